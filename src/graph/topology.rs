//! Arena of operators and slots, and the wiring rules between them.
//!
//! Every operator and slot lives in an index arena owned by one
//! [`Topology`]. Links are stored on both ends: a downstream slot knows its
//! upstream `partner`, an upstream slot lists its downstream `partners`.
//! Structural edits queue metadata work in `pending_meta` / `pending_setup`;
//! [`Topology::flush`](super::propagation) settles it before the edit returns.

use crate::core::error::{GraphError, GraphResult, OperatorId, SlotId};
use crate::core::operator::{Operator, OperatorMetadata};
use crate::core::slot::{SlotDefinition, SlotDirection};
use crate::core::types::{ArrayMeta, DType};
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

// ============================================================================
// Entries
// ============================================================================

/// One slot in the arena.
#[derive(Debug, Clone)]
pub(crate) struct SlotEntry {
    pub name: String,
    pub direction: SlotDirection,
    pub operator: Option<OperatorId>,
    pub parent: Option<SlotId>,
    pub level: usize,
    pub optional: bool,
    pub accepts: Option<Vec<DType>>,
    /// Upstream slot this one reads from.
    pub partner: Option<SlotId>,
    /// Downstream slots reading from this one.
    pub partners: Vec<SlotId>,
    pub subslots: Vec<SlotId>,
    pub meta: Option<ArrayMeta>,
}

impl SlotEntry {
    fn from_definition(def: &SlotDefinition, operator: OperatorId) -> Self {
        Self {
            name: def.name.clone(),
            direction: def.direction,
            operator: Some(operator),
            parent: None,
            level: def.level,
            optional: def.optional,
            accepts: def.accepts.clone(),
            partner: None,
            partners: Vec::new(),
            subslots: Vec::new(),
            meta: None,
        }
    }

    fn child(&self, parent: SlotId) -> Self {
        Self {
            name: self.name.clone(),
            direction: self.direction,
            operator: self.operator,
            parent: Some(parent),
            level: self.level.saturating_sub(1),
            optional: self.optional,
            accepts: self.accepts.clone(),
            partner: None,
            partners: Vec::new(),
            subslots: Vec::new(),
            meta: None,
        }
    }
}

/// One operator in the arena.
pub(crate) struct OperatorEntry {
    pub name: String,
    pub instance: Arc<dyn Operator>,
    pub metadata: OperatorMetadata,
    pub inputs: IndexMap<String, SlotId>,
    pub outputs: IndexMap<String, SlotId>,
    /// Wrapper owning this operator, if it is a lane.
    pub parent: Option<OperatorId>,
    /// Lane operators, `Some` while this operator is wrapped.
    pub lanes: Option<Vec<OperatorId>>,
}

impl OperatorEntry {
    pub fn is_wrapper(&self) -> bool {
        self.lanes.is_some()
    }
}

/// The producing end of a read.
#[derive(Clone)]
pub(crate) struct ResolvedOutput {
    pub operator: OperatorId,
    pub operator_name: String,
    pub instance: Arc<dyn Operator>,
    pub output: String,
    pub subindex: Vec<usize>,
    pub meta: ArrayMeta,
}

/// Structural change of a multi-slot.
#[derive(Debug, Clone, Copy)]
pub(super) enum LaneChange {
    Inserted(usize),
    Removed(usize),
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Default)]
pub(crate) struct Topology {
    pub(super) operators: Vec<Option<OperatorEntry>>,
    pub(super) slots: Vec<Option<SlotEntry>>,
    pub(super) pending_meta: Vec<SlotId>,
    pub(super) pending_setup: IndexSet<OperatorId>,
    pub(super) pending_notify: Vec<(OperatorId, String)>,
    /// Operators in the middle of being wrapped or restored.
    pub(super) reconfiguring: HashSet<OperatorId>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn slot(&self, id: SlotId) -> GraphResult<&SlotEntry> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(GraphError::SlotNotFound(id))
    }

    pub(super) fn slot_mut(&mut self, id: SlotId) -> GraphResult<&mut SlotEntry> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::SlotNotFound(id))
    }

    pub fn op(&self, id: OperatorId) -> GraphResult<&OperatorEntry> {
        self.operators
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(GraphError::OperatorNotFound(id))
    }

    pub(super) fn op_mut(&mut self, id: OperatorId) -> GraphResult<&mut OperatorEntry> {
        self.operators
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::OperatorNotFound(id))
    }

    pub fn contains_slot(&self, id: SlotId) -> bool {
        self.slot(id).is_ok()
    }

    pub fn operator_ids(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.operators
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_some())
            .map(|(index, _)| OperatorId(index))
    }

    pub fn input(&self, op: OperatorId, name: &str) -> GraphResult<SlotId> {
        let entry = self.op(op)?;
        entry
            .inputs
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownSlot {
                operator: entry.name.clone(),
                slot: name.to_string(),
            })
    }

    pub fn output(&self, op: OperatorId, name: &str) -> GraphResult<SlotId> {
        let entry = self.op(op)?;
        entry
            .outputs
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownSlot {
                operator: entry.name.clone(),
                slot: name.to_string(),
            })
    }

    pub fn subslot(&self, slot: SlotId, index: usize) -> GraphResult<SlotId> {
        let entry = self.slot(slot)?;
        if entry.level == 0 {
            return Err(GraphError::NotMultiSlot {
                slot: self.label(slot),
            });
        }
        entry
            .subslots
            .get(index)
            .copied()
            .ok_or_else(|| GraphError::LaneOutOfRange {
                slot: self.label(slot),
                index,
                len: entry.subslots.len(),
            })
    }

    /// Top-level slot name and lane path of a slot.
    pub fn slot_path(&self, id: SlotId) -> GraphResult<(String, Vec<usize>)> {
        let mut path = Vec::new();
        let mut current = id;
        loop {
            let entry = self.slot(current)?;
            match entry.parent {
                Some(parent) => {
                    let index = self
                        .slot(parent)?
                        .subslots
                        .iter()
                        .position(|&s| s == current)
                        .ok_or(GraphError::SlotNotFound(current))?;
                    path.push(index);
                    current = parent;
                }
                None => {
                    path.reverse();
                    return Ok((entry.name.clone(), path));
                }
            }
        }
    }

    /// Human readable `operator.slot[i]` label used in errors and logs.
    pub fn label(&self, id: SlotId) -> String {
        let Ok(entry) = self.slot(id) else {
            return id.to_string();
        };
        let operator = entry
            .operator
            .and_then(|op| self.op(op).ok())
            .map_or("?", |op| op.name.as_str());
        match self.slot_path(id) {
            Ok((name, path)) => {
                let lanes: String = path.iter().map(|i| format!("[{}]", i)).collect();
                format!("{}.{}{}", operator, name, lanes)
            }
            Err(_) => format!("{}.{}", operator, entry.name),
        }
    }

    // ========================================================================
    // Creation and destruction
    // ========================================================================

    fn push_slot(&mut self, entry: SlotEntry) -> SlotId {
        let id = SlotId(self.slots.len());
        self.slots.push(Some(entry));
        id
    }

    pub fn add_operator(
        &mut self,
        instance: Arc<dyn Operator>,
        parent: Option<OperatorId>,
    ) -> OperatorId {
        let metadata = instance.metadata();
        let id = OperatorId(self.operators.len());

        let mut inputs = IndexMap::new();
        for def in &metadata.inputs {
            let slot = self.push_slot(SlotEntry::from_definition(def, id));
            inputs.insert(def.name.clone(), slot);
        }
        let mut outputs = IndexMap::new();
        for def in &metadata.outputs {
            let slot = self.push_slot(SlotEntry::from_definition(def, id));
            outputs.insert(def.name.clone(), slot);
        }

        log::debug!("added operator '{}' as {}", metadata.name, id);
        self.operators.push(Some(OperatorEntry {
            name: metadata.name.clone(),
            instance,
            metadata,
            inputs,
            outputs,
            parent,
            lanes: None,
        }));
        self.pending_setup.insert(id);
        id
    }

    /// Remove a slot and its sub-slots, unlinking both ends.
    pub(super) fn destroy_slot(&mut self, id: SlotId) {
        let Some(entry) = self.slots.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if let Some(up) = entry.partner {
            if let Some(Some(upstream)) = self.slots.get_mut(up.0) {
                upstream.partners.retain(|&c| c != id);
            }
        }
        for consumer in entry.partners {
            if let Some(Some(downstream)) = self.slots.get_mut(consumer.0) {
                if downstream.partner == Some(id) {
                    downstream.partner = None;
                    self.pending_meta.push(consumer);
                }
            }
        }
        for sub in entry.subslots {
            self.destroy_slot(sub);
        }
    }

    pub(super) fn destroy_operator(&mut self, id: OperatorId) {
        let Some(entry) = self.operators.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        for lane in entry.lanes.into_iter().flatten() {
            self.destroy_operator(lane);
        }
        for &slot in entry.inputs.values().chain(entry.outputs.values()) {
            self.destroy_slot(slot);
        }
        self.pending_setup.shift_remove(&id);
        log::debug!("destroyed operator '{}' ({})", entry.name, id);
    }

    /// Remove a top-level operator, disconnecting everything reading from it.
    pub fn remove_operator(&mut self, id: OperatorId) -> GraphResult<()> {
        let entry = self.op(id)?;
        if entry.parent.is_some() {
            return Err(GraphError::InvalidConnection {
                reason: format!("operator {} is a lane and is managed by its wrapper", id),
            });
        }
        let consumers: Vec<SlotId> = entry
            .outputs
            .values()
            .filter_map(|&s| self.slot(s).ok())
            .flat_map(|s| s.partners.iter().copied())
            .collect();
        for consumer in consumers {
            if self.contains_slot(consumer) && self.slot(consumer)?.parent.is_none() {
                self.disconnect(consumer)?;
            }
        }
        self.destroy_operator(id);
        Ok(())
    }

    // ========================================================================
    // Links
    // ========================================================================

    pub(super) fn link(&mut self, down: SlotId, up: SlotId) -> GraphResult<()> {
        self.slot(up)?;
        self.slot_mut(down)?.partner = Some(up);
        self.slot_mut(up)?.partners.push(down);
        self.pending_meta.push(down);
        Ok(())
    }

    pub(super) fn unlink(&mut self, down: SlotId) {
        let Some(up) = self
            .slots
            .get_mut(down.0)
            .and_then(Option::as_mut)
            .and_then(|entry| entry.partner.take())
        else {
            return;
        };
        if let Some(Some(upstream)) = self.slots.get_mut(up.0) {
            upstream.partners.retain(|&c| c != down);
        }
        self.pending_meta.push(down);
    }

    /// Unlink an input and all of its sub-slots from their upstreams.
    pub(super) fn detach_input(&mut self, input: SlotId) {
        self.unlink(input);
        let subs = self
            .slot(input)
            .map(|entry| entry.subslots.clone())
            .unwrap_or_default();
        for sub in subs {
            self.detach_input(sub);
        }
    }

    fn check_dtype(&self, input: SlotId, upstream: SlotId) -> GraphResult<()> {
        let Some(allowed) = self.slot(input)?.accepts.as_ref() else {
            return Ok(());
        };
        let Some(meta) = self.slot(upstream)?.meta.as_ref() else {
            return Ok(());
        };
        if allowed.contains(&meta.dtype) {
            Ok(())
        } else {
            Err(GraphError::DTypeMismatch {
                slot: self.label(input),
                expected: allowed.clone(),
                got: meta.dtype,
            })
        }
    }

    /// Breadth-first search downstream of the input's operator.
    fn check_cycle(&self, input: SlotId, upstream: SlotId) -> GraphResult<()> {
        let Some(op) = self.slot(input)?.operator else {
            return Ok(());
        };
        let mut queue: VecDeque<SlotId> = self.op(op)?.outputs.values().copied().collect();
        let mut visited = HashSet::new();

        while let Some(slot) = queue.pop_front() {
            if slot == upstream {
                return Err(GraphError::CycleDetected {
                    operator: self.op(op)?.name.clone(),
                });
            }
            if !visited.insert(slot) {
                continue;
            }
            let Ok(entry) = self.slot(slot) else {
                continue;
            };
            queue.extend(entry.partners.iter().copied());
            queue.extend(entry.subslots.iter().copied());
            if entry.direction == SlotDirection::Input {
                if let Some(owner) = entry.operator.and_then(|o| self.op(o).ok()) {
                    queue.extend(owner.outputs.values().copied());
                }
            }
        }
        Ok(())
    }

    /// Connect an input to an upstream slot.
    ///
    /// An upstream one level higher than a top-level input promotes the
    /// input's operator to a wrapper. A lower-level upstream is broadcast to
    /// every sub-slot of a multi-input.
    pub fn connect(&mut self, input: SlotId, upstream: SlotId) -> GraphResult<()> {
        let (direction, level, operator, parent) = {
            let entry = self.slot(input)?;
            (entry.direction, entry.level, entry.operator, entry.parent)
        };
        let up_level = self.slot(upstream)?.level;

        if direction != SlotDirection::Input {
            return Err(GraphError::InvalidConnection {
                reason: format!("{} is an output and cannot be connected", self.label(input)),
            });
        }
        if input == upstream {
            return Err(GraphError::InvalidConnection {
                reason: format!("{} cannot be connected to itself", self.label(input)),
            });
        }
        self.check_dtype(input, upstream)?;
        self.check_cycle(input, upstream)?;

        if up_level > level {
            let wrappable = match (operator, parent) {
                (Some(op), None) => !self.op(op)?.is_wrapper() && up_level == level + 1,
                _ => false,
            };
            return match operator {
                Some(op) if wrappable => self.wrap(op, input, upstream),
                _ => Err(GraphError::LevelMismatch {
                    slot: self.label(input),
                    expected: level,
                    got: up_level,
                }),
            };
        }

        if self.slot(input)?.partner == Some(upstream) {
            return Ok(());
        }
        self.detach_input(input);
        self.link(input, upstream)?;

        if level > 0 {
            if up_level == level {
                let len = self.slot(upstream)?.subslots.len();
                self.resize_internal(input, len)?;
            }
            let subs = self.slot(input)?.subslots.clone();
            for (index, sub) in subs.into_iter().enumerate() {
                self.connect_subslot(input, sub, index)?;
            }
        }

        if let Some(op) = operator {
            self.pending_setup.insert(op);
            if parent.is_none() {
                let name = self.slot(input)?.name.clone();
                self.pending_notify.push((op, name));
                self.reconcile(op)?;
            }
        }
        Ok(())
    }

    /// Wire a sub-slot of a multi-input according to the parent's partner.
    fn connect_subslot(&mut self, parent: SlotId, sub: SlotId, index: usize) -> GraphResult<()> {
        let (level, partner) = {
            let entry = self.slot(parent)?;
            (entry.level, entry.partner)
        };
        let Some(up) = partner else {
            return Ok(());
        };
        let up_entry = self.slot(up)?;
        if up_entry.level == level {
            match up_entry.subslots.get(index).copied() {
                Some(up_sub) => self.connect(sub, up_sub),
                None => Ok(()),
            }
        } else {
            self.connect(sub, up)
        }
    }

    pub fn disconnect(&mut self, input: SlotId) -> GraphResult<()> {
        let (direction, level, operator, parent, partner) = {
            let entry = self.slot(input)?;
            (entry.direction, entry.level, entry.operator, entry.parent, entry.partner)
        };
        if direction != SlotDirection::Input {
            return Err(GraphError::InvalidConnection {
                reason: format!("{} is an output and cannot be disconnected", self.label(input)),
            });
        }
        let followed = match partner {
            Some(up) => self.slot(up).map_or(false, |e| e.level == level),
            None => false,
        };
        self.detach_input(input);
        if level > 0 && followed {
            self.resize_internal(input, 0)?;
        }
        if let Some(op) = operator {
            self.pending_setup.insert(op);
            if parent.is_none() {
                self.reconcile(op)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Multi-slots
    // ========================================================================

    /// Whether a slot's length is driven by something else.
    fn check_resizable(&self, slot: SlotId) -> GraphResult<()> {
        let entry = self.slot(slot)?;
        if entry.level == 0 {
            return Err(GraphError::NotMultiSlot {
                slot: self.label(slot),
            });
        }
        let follows = match entry.partner {
            Some(up) => self.slot(up)?.level == entry.level,
            None => false,
        };
        let wrapper_output = entry.direction == SlotDirection::Output
            && entry
                .operator
                .map_or(false, |op| self.op(op).map_or(false, OperatorEntry::is_wrapper));
        if follows || wrapper_output {
            return Err(GraphError::ResizeFollower {
                slot: self.label(slot),
            });
        }
        Ok(())
    }

    pub fn resize(&mut self, slot: SlotId, len: usize) -> GraphResult<()> {
        self.check_resizable(slot)?;
        self.resize_internal(slot, len)
    }

    pub fn insert_slot(&mut self, slot: SlotId, index: usize) -> GraphResult<SlotId> {
        self.check_resizable(slot)?;
        self.insert_subslot(slot, index)
    }

    pub fn remove_slot(&mut self, slot: SlotId, index: usize) -> GraphResult<()> {
        self.check_resizable(slot)?;
        self.remove_subslot(slot, index)
    }

    pub(super) fn resize_internal(&mut self, slot: SlotId, len: usize) -> GraphResult<()> {
        loop {
            let current = self.slot(slot)?.subslots.len();
            if current < len {
                self.insert_subslot(slot, current)?;
            } else if current > len {
                self.remove_subslot(slot, current - 1)?;
            } else {
                return Ok(());
            }
        }
    }

    pub(super) fn insert_subslot(&mut self, slot: SlotId, index: usize) -> GraphResult<SlotId> {
        let (level, len, direction, consumers) = {
            let entry = self.slot(slot)?;
            (entry.level, entry.subslots.len(), entry.direction, entry.partners.clone())
        };
        if level == 0 {
            return Err(GraphError::NotMultiSlot {
                slot: self.label(slot),
            });
        }
        if index > len {
            return Err(GraphError::LaneOutOfRange {
                slot: self.label(slot),
                index,
                len,
            });
        }

        let child = self.slot(slot)?.child(slot);
        let sub = self.push_slot(child);
        self.slot_mut(slot)?.subslots.insert(index, sub);
        self.pending_meta.push(sub);
        if direction == SlotDirection::Input {
            self.connect_subslot(slot, sub, index)?;
        }

        let new_len = len + 1;
        for consumer in consumers {
            let Ok(entry) = self.slot(consumer) else {
                continue;
            };
            let consumer_len = entry.subslots.len();
            if entry.level == level && consumer_len < new_len {
                self.insert_subslot(consumer, index.min(consumer_len))?;
            }
        }
        self.on_lanes_changed(slot, LaneChange::Inserted(index), new_len)?;
        Ok(sub)
    }

    pub(super) fn remove_subslot(&mut self, slot: SlotId, index: usize) -> GraphResult<()> {
        let (level, len, consumers) = {
            let entry = self.slot(slot)?;
            (entry.level, entry.subslots.len(), entry.partners.clone())
        };
        if level == 0 {
            return Err(GraphError::NotMultiSlot {
                slot: self.label(slot),
            });
        }
        if index >= len {
            return Err(GraphError::LaneOutOfRange {
                slot: self.label(slot),
                index,
                len,
            });
        }

        let sub = self.slot_mut(slot)?.subslots.remove(index);
        self.destroy_slot(sub);

        let new_len = len - 1;
        for consumer in consumers {
            let Ok(entry) = self.slot(consumer) else {
                continue;
            };
            let consumer_len = entry.subslots.len();
            if entry.level == level && consumer_len > new_len {
                self.remove_subslot(consumer, index.min(consumer_len - 1))?;
            }
        }
        self.on_lanes_changed(slot, LaneChange::Removed(index), new_len)
    }

    fn on_lanes_changed(&mut self, slot: SlotId, change: LaneChange, len: usize) -> GraphResult<()> {
        let (operator, parent, direction) = {
            let entry = self.slot(slot)?;
            (entry.operator, entry.parent, entry.direction)
        };
        let Some(op) = operator else {
            return Ok(());
        };
        let wrapped = self.op(op).map_or(false, OperatorEntry::is_wrapper);
        if wrapped && parent.is_none() && direction == SlotDirection::Input {
            match change {
                LaneChange::Inserted(index) => self.insert_lane(op, index, len),
                LaneChange::Removed(index) => self.remove_lane(op, index, len),
            }
        } else {
            self.pending_setup.insert(op);
            Ok(())
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Follow a slot upstream to the output that computes it.
    pub fn resolve_output(&self, slot: SlotId) -> GraphResult<ResolvedOutput> {
        let mut current = slot;
        let mut hops = 0usize;
        while let Some(up) = self.slot(current)?.partner {
            current = up;
            hops += 1;
            if hops > self.slots.len() {
                return Err(GraphError::CycleDetected {
                    operator: self.label(slot),
                });
            }
        }

        let entry = self.slot(current)?;
        let (name, subindex) = self.slot_path(current)?;
        if entry.direction == SlotDirection::Input {
            return Err(GraphError::Disconnected {
                operator: entry
                    .operator
                    .and_then(|op| self.op(op).ok())
                    .map_or_else(String::new, |op| op.name.clone()),
                slot: name,
            });
        }
        if entry.level > 0 {
            return Err(GraphError::LevelMismatch {
                slot: self.label(slot),
                expected: 0,
                got: entry.level,
            });
        }
        let Some(op_id) = entry.operator else {
            return Err(GraphError::NotReady {
                slot: self.label(slot),
            });
        };
        let op = self.op(op_id)?;
        let meta = match (&entry.meta, op.is_wrapper()) {
            (Some(meta), false) => meta.clone(),
            _ => {
                return Err(GraphError::NotReady {
                    slot: self.label(slot),
                })
            }
        };
        Ok(ResolvedOutput {
            operator: op_id,
            operator_name: op.name.clone(),
            instance: Arc::clone(&op.instance),
            output: name,
            subindex,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{ArraySource, Piper};
    use ndarray::ArrayD;

    fn source() -> Arc<dyn Operator> {
        Arc::new(ArraySource::new(ArrayD::<u8>::zeros(vec![4, 4])))
    }

    #[test]
    fn test_add_operator_allocates_slots() {
        let mut topo = Topology::new();
        let op = topo.add_operator(source(), None);
        let out = topo.output(op, "Output").unwrap();
        assert_eq!(topo.slot(out).unwrap().operator, Some(op));
        assert!(topo.input(op, "Missing").is_err());
    }

    #[test]
    fn test_connect_links_both_ends() {
        let mut topo = Topology::new();
        let src = topo.add_operator(source(), None);
        let pipe = topo.add_operator(Arc::new(Piper::new()), None);
        let out = topo.output(src, "Output").unwrap();
        let inp = topo.input(pipe, "Input").unwrap();
        topo.connect(inp, out).unwrap();
        assert_eq!(topo.slot(inp).unwrap().partner, Some(out));
        assert_eq!(topo.slot(out).unwrap().partners, vec![inp]);

        topo.disconnect(inp).unwrap();
        assert!(topo.slot(inp).unwrap().partner.is_none());
        assert!(topo.slot(out).unwrap().partners.is_empty());
    }

    #[test]
    fn test_connect_output_is_rejected() {
        let mut topo = Topology::new();
        let a = topo.add_operator(source(), None);
        let b = topo.add_operator(source(), None);
        let out_a = topo.output(a, "Output").unwrap();
        let out_b = topo.output(b, "Output").unwrap();
        assert!(matches!(
            topo.connect(out_a, out_b),
            Err(GraphError::InvalidConnection { .. })
        ));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut topo = Topology::new();
        let a = topo.add_operator(Arc::new(Piper::new()), None);
        let b = topo.add_operator(Arc::new(Piper::new()), None);
        let a_in = topo.input(a, "Input").unwrap();
        let a_out = topo.output(a, "Output").unwrap();
        let b_in = topo.input(b, "Input").unwrap();
        let b_out = topo.output(b, "Output").unwrap();
        topo.connect(b_in, a_out).unwrap();
        assert!(matches!(
            topo.connect(a_in, b_out),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_resolve_disconnected_input() {
        let mut topo = Topology::new();
        let pipe = topo.add_operator(Arc::new(Piper::new()), None);
        let inp = topo.input(pipe, "Input").unwrap();
        assert!(matches!(
            topo.resolve_output(inp),
            Err(GraphError::Disconnected { .. })
        ));
    }

    #[test]
    fn test_label_includes_lane_path() {
        let mut topo = Topology::new();
        let pipe = topo.add_operator(Arc::new(Piper::new()), None);
        let inp = topo.input(pipe, "Input").unwrap();
        assert_eq!(topo.label(inp), "Piper.Input");
    }
}
