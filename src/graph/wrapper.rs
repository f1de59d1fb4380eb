//! Implicit fan-out of operators over level-1 inputs.
//!
//! Connecting a level-1 upstream into a level-0 input turns the receiving
//! operator into a wrapper: every slot of the operator gains one level and
//! one inner operator (a lane) is cloned per sub-slot. Lanes are kept in step
//! with the inputs on every insert and remove, and the wrapper returns to a
//! plain operator once no input needs fan-out any more.

use super::topology::Topology;
use crate::core::error::{GraphResult, OperatorId, SlotId};
use crate::core::operator::Operator;
use std::sync::Arc;

type Consumers = Vec<(SlotId, Vec<SlotId>)>;

impl Topology {
    /// Promote `op` to a wrapper and connect `trigger` to `upstream`.
    pub(super) fn wrap(
        &mut self,
        op: OperatorId,
        trigger: SlotId,
        upstream: SlotId,
    ) -> GraphResult<()> {
        log::warn!(
            "implicitly wrapping operator '{}' ({}) to fan out over {}",
            self.op(op)?.name,
            op,
            self.label(upstream)
        );

        self.reconfiguring.insert(op);
        let result = self.promote(op, trigger, upstream);
        self.reconfiguring.remove(&op);
        let consumers = result?;

        self.reconcile(op)?;
        self.reconnect(consumers)
    }

    fn promote(&mut self, op: OperatorId, trigger: SlotId, upstream: SlotId) -> GraphResult<Consumers> {
        let (inputs, outputs) = self.slot_lists(op)?;
        let partners: Vec<(SlotId, Option<SlotId>)> = inputs
            .iter()
            .map(|&s| Ok((s, self.slot(s)?.partner)))
            .collect::<GraphResult<_>>()?;
        let consumers = self.detach_all(&inputs, &outputs)?;

        for &slot in inputs.iter().chain(&outputs) {
            let entry = self.slot_mut(slot)?;
            entry.level += 1;
            entry.meta = None;
            self.pending_meta.push(slot);
        }
        self.op_mut(op)?.lanes = Some(Vec::new());

        for (slot, partner) in partners {
            if let (true, Some(partner)) = (slot != trigger, partner) {
                self.connect(slot, partner)?;
            }
        }
        self.connect(trigger, upstream)?;
        Ok(consumers)
    }

    /// Turn a wrapper back into a plain operator.
    pub(super) fn restore(&mut self, op: OperatorId) -> GraphResult<()> {
        log::debug!("unwrapping operator '{}' ({})", self.op(op)?.name, op);

        self.reconfiguring.insert(op);
        let result = self.demote(op);
        self.reconfiguring.remove(&op);
        let consumers = result?;

        self.pending_setup.insert(op);
        self.reconnect(consumers)
    }

    fn demote(&mut self, op: OperatorId) -> GraphResult<Consumers> {
        let (inputs, outputs) = self.slot_lists(op)?;
        let partners: Vec<(SlotId, Option<SlotId>)> = inputs
            .iter()
            .map(|&s| Ok((s, self.slot(s)?.partner)))
            .collect::<GraphResult<_>>()?;
        let consumers = self.detach_all(&inputs, &outputs)?;

        loop {
            let count = self.lane_count(op)?;
            if count == 0 {
                break;
            }
            self.remove_lane(op, count - 1, count - 1)?;
        }
        for &slot in inputs.iter().chain(&outputs) {
            self.resize_internal(slot, 0)?;
            let entry = self.slot_mut(slot)?;
            entry.level = entry.level.saturating_sub(1);
            entry.meta = None;
            self.pending_meta.push(slot);
        }
        self.op_mut(op)?.lanes = None;

        for (slot, partner) in partners {
            if let Some(partner) = partner {
                self.connect(slot, partner)?;
            }
        }
        Ok(consumers)
    }

    fn slot_lists(&self, op: OperatorId) -> GraphResult<(Vec<SlotId>, Vec<SlotId>)> {
        let entry = self.op(op)?;
        Ok((
            entry.inputs.values().copied().collect(),
            entry.outputs.values().copied().collect(),
        ))
    }

    /// Unlink every input and every downstream consumer of the outputs.
    fn detach_all(&mut self, inputs: &[SlotId], outputs: &[SlotId]) -> GraphResult<Consumers> {
        let mut consumers = Vec::with_capacity(outputs.len());
        for &output in outputs {
            let downstream = self.slot(output)?.partners.clone();
            for &consumer in &downstream {
                self.unlink(consumer);
            }
            if self.slot(output)?.level > 0 {
                self.resize_internal(output, 0)?;
            }
            consumers.push((output, downstream));
        }
        for &input in inputs {
            self.detach_input(input);
            if self.slot(input)?.level > 0 {
                self.resize_internal(input, 0)?;
            }
        }
        Ok(consumers)
    }

    fn reconnect(&mut self, consumers: Consumers) -> GraphResult<()> {
        for (output, downstream) in consumers {
            for consumer in downstream {
                if self.contains_slot(consumer) && self.contains_slot(output) {
                    self.connect(consumer, output)?;
                }
            }
        }
        Ok(())
    }

    fn lane_count(&self, op: OperatorId) -> GraphResult<usize> {
        Ok(self.op(op)?.lanes.as_ref().map_or(0, Vec::len))
    }

    // ========================================================================
    // Lanes
    // ========================================================================

    /// Insert a lane at `index` unless the wrapper already has `length` lanes.
    pub(super) fn insert_lane(&mut self, op: OperatorId, index: usize, length: usize) -> GraphResult<()> {
        let count = self.lane_count(op)?;
        if count >= length {
            return Ok(());
        }
        let index = index.min(count);
        let (prototype, inputs, outputs) = {
            let entry = self.op(op)?;
            (
                Arc::clone(&entry.instance),
                entry.inputs.clone(),
                entry.outputs.clone(),
            )
        };

        let instance: Arc<dyn Operator> = Arc::from(prototype.clone_box());
        let lane = self.add_operator(instance, Some(op));
        if let Some(lanes) = self.op_mut(op)?.lanes.as_mut() {
            lanes.insert(index, lane);
        }
        log::debug!("operator {}: inserted lane {} as {}", op, index, lane);

        for (name, outer) in &inputs {
            if self.slot(*outer)?.subslots.len() < length {
                self.insert_subslot(*outer, index)?;
            }
            let sub = self.slot(*outer)?.subslots.get(index).copied();
            let inner = self.op(lane)?.inputs.get(name).copied();
            if let (Some(sub), Some(inner)) = (sub, inner) {
                self.connect(inner, sub)?;
            }
        }
        for (name, outer) in &outputs {
            if self.slot(*outer)?.subslots.len() < length {
                self.insert_subslot(*outer, index)?;
            }
            let sub = self.slot(*outer)?.subslots.get(index).copied();
            let inner = self.op(lane)?.outputs.get(name).copied();
            if let (Some(sub), Some(inner)) = (sub, inner) {
                self.link(sub, inner)?;
            }
        }
        Ok(())
    }

    /// Remove the lane at `index` unless the wrapper already has `length` lanes.
    pub(super) fn remove_lane(&mut self, op: OperatorId, index: usize, length: usize) -> GraphResult<()> {
        let count = self.lane_count(op)?;
        if count <= length || index >= count {
            return Ok(());
        }
        let (inputs, outputs) = self.slot_lists(op)?;
        let lane = match self.op_mut(op)?.lanes.as_mut() {
            Some(lanes) => lanes.remove(index),
            None => return Ok(()),
        };

        for &outer in outputs.iter().chain(&inputs) {
            let len = self.slot(outer)?.subslots.len();
            if len > length && index < len {
                self.remove_subslot(outer, index)?;
            }
        }
        self.destroy_operator(lane);
        log::debug!("operator {}: removed lane {}", op, index);
        Ok(())
    }

    /// Lanes an input asks for: its length, or none when it broadcasts.
    fn required_lanes(&self, input: SlotId) -> GraphResult<usize> {
        let entry = self.slot(input)?;
        match entry.partner {
            Some(up) if self.slot(up)?.level < entry.level => Ok(0),
            _ => Ok(entry.subslots.len()),
        }
    }

    fn sync_lanes(&mut self, op: OperatorId) -> GraphResult<()> {
        let (inputs, _) = self.slot_lists(op)?;
        let mut target = 0;
        for &input in &inputs {
            target = target.max(self.required_lanes(input)?);
        }

        loop {
            let count = self.lane_count(op)?;
            if count < target {
                self.insert_lane(op, count, count + 1)?;
            } else if count > target {
                self.remove_lane(op, count - 1, count - 1)?;
            } else {
                break;
            }
        }

        for &input in &inputs {
            let entry = self.slot(input)?;
            let follows = match entry.partner {
                Some(up) => self.slot(up)?.level == entry.level,
                None => false,
            };
            if !follows && entry.subslots.len() != target {
                self.resize_internal(input, target)?;
            }
        }
        Ok(())
    }

    /// Whether any input is connected to something above its declared level.
    fn needs_fan_out(&self, op: OperatorId) -> GraphResult<bool> {
        let entry = self.op(op)?;
        for (name, &input) in &entry.inputs {
            let declared = entry.metadata.get_input(name).map_or(0, |d| d.level);
            if let Some(up) = self.slot(input)?.partner {
                if self.slot(up)?.level > declared {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Bring a wrapper's lanes in line with its inputs, unwrapping when idle.
    pub(super) fn reconcile(&mut self, op: OperatorId) -> GraphResult<()> {
        if self.reconfiguring.contains(&op) {
            return Ok(());
        }
        match self.op(op) {
            Ok(entry) if entry.is_wrapper() => {}
            _ => return Ok(()),
        }
        self.sync_lanes(op)?;
        if !self.needs_fan_out(op)? {
            self.restore(op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{LaneSource, Piper};
    use ndarray::ArrayD;

    fn lanes() -> Arc<dyn Operator> {
        Arc::new(LaneSource::new(ArrayD::<u8>::zeros(vec![2, 2])))
    }

    fn wired(n: usize) -> (Topology, OperatorId, OperatorId) {
        let mut topo = Topology::new();
        let src = topo.add_operator(lanes(), None);
        let pipe = topo.add_operator(Arc::new(Piper::new()), None);
        let out = topo.output(src, "Output").unwrap();
        let inp = topo.input(pipe, "Input").unwrap();
        topo.resize(out, n).unwrap();
        topo.connect(inp, out).unwrap();
        topo.flush().unwrap();
        (topo, src, pipe)
    }

    #[test]
    fn test_wrap_creates_one_lane_per_subslot() {
        let (topo, _, pipe) = wired(3);
        assert_eq!(topo.lane_count(pipe).unwrap(), 3);
        let out = topo.output(pipe, "Output").unwrap();
        assert_eq!(topo.slot(out).unwrap().level, 1);
        assert_eq!(topo.slot(out).unwrap().subslots.len(), 3);
    }

    #[test]
    fn test_lanes_follow_upstream_resize() {
        let (mut topo, src, pipe) = wired(2);
        let out = topo.output(src, "Output").unwrap();
        topo.resize(out, 5).unwrap();
        assert_eq!(topo.lane_count(pipe).unwrap(), 5);
        topo.remove_slot(out, 1).unwrap();
        assert_eq!(topo.lane_count(pipe).unwrap(), 4);
        topo.insert_slot(out, 0).unwrap();
        assert_eq!(topo.lane_count(pipe).unwrap(), 5);
    }

    #[test]
    fn test_disconnect_unwraps() {
        let (mut topo, _, pipe) = wired(2);
        let inp = topo.input(pipe, "Input").unwrap();
        topo.disconnect(inp).unwrap();
        assert!(!topo.op(pipe).unwrap().is_wrapper());
        assert_eq!(topo.slot(inp).unwrap().level, 0);
    }

    #[test]
    fn test_follower_cannot_be_resized() {
        let (mut topo, _, pipe) = wired(2);
        let inp = topo.input(pipe, "Input").unwrap();
        assert!(topo.resize(inp, 4).is_err());
    }
}
