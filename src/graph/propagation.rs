//! Metadata and dirtiness propagation.
//!
//! Metadata flows downstream eagerly: after every structural edit the graph
//! calls [`Topology::flush`], which copies metadata along links and re-runs
//! `setup_outputs` on every operator whose inputs changed until nothing moves.
//! Dirtiness also flows downstream, but only on demand, through
//! [`Topology::dirty_walk`].

use super::topology::{OperatorEntry, Topology};
use crate::core::context::{DirtyContext, DirtyMark, SetupContext, SlotMeta};
use crate::core::error::{GraphError, GraphResult, OperatorId, SlotId};
use crate::core::roi::Roi;
use crate::core::slot::SlotDirection;
use crate::core::types::ArrayMeta;
use indexmap::IndexMap;
use std::collections::VecDeque;

impl Topology {
    /// Settle all queued metadata changes and operator setups.
    ///
    /// Returns the first setup failure, after applying everything else.
    pub fn flush(&mut self) -> GraphResult<()> {
        let mut first_error = None;
        let mut queue: VecDeque<SlotId> = self.pending_meta.drain(..).collect();

        loop {
            while let Some(slot) = queue.pop_front() {
                self.refresh_slot(slot, &mut queue);
            }
            queue.extend(self.pending_meta.drain(..));
            if !queue.is_empty() {
                continue;
            }
            if self.pending_setup.is_empty() {
                break;
            }

            let operators: Vec<OperatorId> = self.pending_setup.drain(..).collect();
            for op in operators {
                let (changed, error) = self.run_setup(op);
                for slot in changed {
                    if let Ok(entry) = self.slot(slot) {
                        queue.extend(entry.partners.iter().copied());
                    }
                }
                if let Some(error) = error {
                    log::warn!("{}", error);
                    first_error.get_or_insert(error);
                }
            }
        }

        for (op, input) in std::mem::take(&mut self.pending_notify) {
            if let Ok(entry) = self.op(op) {
                entry.instance.notify_connect(&input);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Recompute the metadata a linked slot inherits from upstream.
    fn refresh_slot(&mut self, slot: SlotId, queue: &mut VecDeque<SlotId>) {
        let Ok(entry) = self.slot(slot) else {
            return;
        };
        let resolved = match entry.partner {
            Some(up) if entry.level == 0 => self
                .slot(up)
                .ok()
                .filter(|upstream| upstream.level == 0)
                .and_then(|upstream| upstream.meta.clone()),
            Some(_) => None,
            None if entry.direction == SlotDirection::Input => None,
            // Unlinked outputs carry what setup gave them.
            None => return,
        };
        if entry.meta == resolved {
            return;
        }

        let consumers = entry.partners.clone();
        let owner = match entry.direction {
            SlotDirection::Input => entry.operator,
            SlotDirection::Output => None,
        };
        if let Ok(entry) = self.slot_mut(slot) {
            entry.meta = resolved;
        }
        queue.extend(consumers);
        if let Some(op) = owner {
            self.pending_setup.insert(op);
        }
    }

    fn slot_meta(&self, slot: SlotId) -> SlotMeta {
        let Ok(entry) = self.slot(slot) else {
            return SlotMeta::Single(None);
        };
        if entry.level == 0 {
            return SlotMeta::Single(entry.meta.clone());
        }
        SlotMeta::Lanes(
            entry
                .subslots
                .iter()
                .map(|&sub| {
                    self.slot(sub)
                        .ok()
                        .filter(|s| s.level == 0)
                        .and_then(|s| s.meta.clone())
                })
                .collect(),
        )
    }

    /// Run `setup_outputs` on one plain operator.
    ///
    /// Returns the output slots whose metadata changed.
    fn run_setup(&mut self, op: OperatorId) -> (Vec<SlotId>, Option<GraphError>) {
        let Ok(entry) = self.op(op) else {
            return (Vec::new(), None);
        };
        if entry.is_wrapper() {
            return (Vec::new(), None);
        }

        let mut inputs = IndexMap::new();
        let mut ready = true;
        let mut error = None;
        for (name, &slot) in &entry.inputs {
            let meta = self.slot_meta(slot);
            if let (Ok(s), SlotMeta::Single(Some(m))) = (self.slot(slot), &meta) {
                if let Some(allowed) = &s.accepts {
                    if !allowed.contains(&m.dtype) {
                        error.get_or_insert(GraphError::DTypeMismatch {
                            slot: self.label(slot),
                            expected: allowed.clone(),
                            got: m.dtype,
                        });
                    }
                }
            }
            let optional = self.slot(slot).map_or(false, |s| s.optional);
            if !optional && !meta.is_ready() {
                ready = false;
            }
            inputs.insert(name.clone(), meta);
        }

        let mut outputs = IndexMap::new();
        for (name, &slot) in &entry.outputs {
            let blank = match self.slot(slot) {
                Ok(s) if s.level > 0 => SlotMeta::Lanes(vec![None; s.subslots.len()]),
                _ => SlotMeta::Single(None),
            };
            outputs.insert(name.clone(), blank);
        }
        let output_slots = entry.outputs.clone();
        let blank = outputs.clone();

        let mut ctx = SetupContext::new(entry.name.clone(), inputs, outputs);
        let outcome = match error.take() {
            Some(err) => Err(err),
            None if ready => entry.instance.setup_outputs(&mut ctx),
            None => Ok(()),
        };
        let (produced, error) = match outcome {
            Ok(()) => (ctx.into_outputs(), None),
            Err(err) => (blank, Some(err)),
        };

        let mut changed = Vec::new();
        for (name, meta) in produced {
            let Some(&slot) = output_slots.get(&name) else {
                continue;
            };
            match meta {
                SlotMeta::Single(meta) => {
                    if self.set_meta(slot, meta) {
                        changed.push(slot);
                    }
                }
                SlotMeta::Lanes(lanes) => {
                    let subs = self
                        .slot(slot)
                        .map(|s| s.subslots.clone())
                        .unwrap_or_default();
                    for (index, sub) in subs.into_iter().enumerate() {
                        if self.set_meta(sub, lanes.get(index).cloned().flatten()) {
                            changed.push(sub);
                        }
                    }
                }
            }
        }
        (changed, error)
    }

    fn set_meta(&mut self, slot: SlotId, meta: Option<ArrayMeta>) -> bool {
        match self.slot_mut(slot) {
            Ok(entry) if entry.meta != meta => {
                entry.meta = meta;
                true
            }
            _ => false,
        }
    }

    /// Collect every slot reached by marking `start` dirty.
    ///
    /// Multi-slots fan out to their sub-slots, links carry the region
    /// unchanged, and each plain operator reached through an input decides
    /// which of its outputs become dirty.
    pub fn dirty_walk(&self, start: SlotId, roi: Option<Roi>) -> GraphResult<Vec<(SlotId, Option<Roi>)>> {
        self.slot(start)?;
        self.walk(VecDeque::from([(start, roi)]))
    }

    /// Freeze or thaw `op`, every lane of it if wrapped, and collect the
    /// slots reached by the regions it releases.
    pub fn set_fixed(&self, op: OperatorId, fixed: bool) -> GraphResult<Vec<(SlotId, Option<Roi>)>> {
        let targets = match &self.op(op)?.lanes {
            Some(lanes) => lanes.clone(),
            None => vec![op],
        };
        let mut queue = VecDeque::new();
        for target in targets {
            let entry = self.op(target)?;
            let mut ctx = DirtyContext::new("", Vec::new(), None, entry.outputs.keys().cloned().collect());
            entry.instance.set_fixed(fixed, &mut ctx);
            queue.extend(self.mark_targets(entry, ctx.into_marks())?);
        }
        self.walk(queue)
    }

    fn walk(&self, mut queue: VecDeque<(SlotId, Option<Roi>)>) -> GraphResult<Vec<(SlotId, Option<Roi>)>> {
        let mut reached = Vec::new();
        while let Some((slot, roi)) = queue.pop_front() {
            let Ok(entry) = self.slot(slot) else {
                continue;
            };
            reached.push((slot, roi.clone()));

            if entry.level > 0 {
                queue.extend(entry.subslots.iter().map(|&sub| (sub, roi.clone())));
                continue;
            }
            for &consumer in &entry.partners {
                if self.slot(consumer).map_or(false, |c| c.level == 0) {
                    queue.push_back((consumer, roi.clone()));
                }
            }

            if entry.direction != SlotDirection::Input {
                continue;
            }
            let Some(op) = entry.operator.and_then(|op| self.op(op).ok()) else {
                continue;
            };
            if op.is_wrapper() {
                continue;
            }
            let (input, subindex) = self.slot_path(slot)?;
            let mut ctx = DirtyContext::new(input, subindex, roi, op.outputs.keys().cloned().collect());
            op.instance.propagate_dirty(&mut ctx);
            queue.extend(self.mark_targets(op, ctx.into_marks())?);
        }
        Ok(reached)
    }

    /// Output slots named by an operator's dirty marks.
    fn mark_targets(&self, op: &OperatorEntry, marks: Vec<DirtyMark>) -> GraphResult<Vec<(SlotId, Option<Roi>)>> {
        let mut targets = Vec::with_capacity(marks.len());
        for mark in marks {
            let Some(&output) = op.outputs.get(&mark.output) else {
                log::warn!("operator '{}' marked unknown output '{}' dirty", op.name, mark.output);
                continue;
            };
            let target = match mark.lane {
                Some(lane) => match self.slot(output)?.subslots.get(lane) {
                    Some(&sub) => sub,
                    None => continue,
                },
                None => output,
            };
            targets.push((target, mark.roi));
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DType;
    use crate::operators::{ArraySource, Piper};
    use ndarray::ArrayD;
    use std::sync::Arc;

    #[test]
    fn test_flush_propagates_meta_downstream() {
        let mut topo = Topology::new();
        let src = topo.add_operator(Arc::new(ArraySource::new(ArrayD::<f32>::zeros(vec![3, 5]))), None);
        let a = topo.add_operator(Arc::new(Piper::new()), None);
        let b = topo.add_operator(Arc::new(Piper::new()), None);
        let a_in = topo.input(a, "Input").unwrap();
        let b_in = topo.input(b, "Input").unwrap();
        topo.connect(b_in, topo.output(a, "Output").unwrap()).unwrap();
        topo.connect(a_in, topo.output(src, "Output").unwrap()).unwrap();
        topo.flush().unwrap();

        let b_out = topo.output(b, "Output").unwrap();
        let meta = topo.slot(b_out).unwrap().meta.clone().unwrap();
        assert_eq!(meta.shape, vec![3, 5]);
        assert_eq!(meta.dtype, DType::F32);

        topo.disconnect(a_in).unwrap();
        topo.flush().unwrap();
        assert!(topo.slot(b_out).unwrap().meta.is_none());
    }

    #[test]
    fn test_dirty_walk_reaches_downstream() {
        let mut topo = Topology::new();
        let src = topo.add_operator(Arc::new(ArraySource::new(ArrayD::<u8>::zeros(vec![8]))), None);
        let pipe = topo.add_operator(Arc::new(Piper::new()), None);
        let src_out = topo.output(src, "Output").unwrap();
        let pipe_in = topo.input(pipe, "Input").unwrap();
        topo.connect(pipe_in, src_out).unwrap();
        topo.flush().unwrap();

        let roi = Roi::new(vec![2], vec![4]).unwrap();
        let reached = topo.dirty_walk(src_out, Some(roi.clone())).unwrap();
        let pipe_out = topo.output(pipe, "Output").unwrap();
        assert!(reached.contains(&(pipe_out, Some(roi))));
    }
}
