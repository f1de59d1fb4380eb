//! Serializable snapshots of graph structure.
//!
//! A snapshot records operators, slot levels, lane counts, links and resolved
//! metadata. It is a diagnostic view: operators carry behaviour that cannot
//! be serialized, so a snapshot cannot rebuild a graph.

use super::topology::Topology;
use crate::core::error::{OperatorId, SlotId};
use crate::core::types::ArrayMeta;
use serde::{Deserialize, Serialize};

/// Serializable view of one slot and its sub-slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub name: String,
    pub level: usize,
    /// Upstream slot, if connected.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partner: Option<SlotId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<ArrayMeta>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub subslots: Vec<SlotSnapshot>,
}

impl SlotSnapshot {
    /// Number of sub-slots.
    pub fn len(&self) -> usize {
        self.subslots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subslots.is_empty()
    }
}

/// Serializable view of one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSnapshot {
    pub id: OperatorId,
    pub name: String,
    /// Wrapper owning this operator, if it is a lane.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<OperatorId>,
    /// Lane operators, present while wrapped.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lanes: Option<Vec<OperatorId>>,
    pub inputs: Vec<SlotSnapshot>,
    pub outputs: Vec<SlotSnapshot>,
}

/// Serializable view of a complete graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Snapshot format version
    pub version: String,
    pub operators: Vec<OperatorSnapshot>,
}

impl GraphSnapshot {
    /// Current format version.
    pub const VERSION: &'static str = "1.0.0";

    /// Find an operator by id.
    pub fn operator(&self, id: OperatorId) -> Option<&OperatorSnapshot> {
        self.operators.iter().find(|op| op.id == id)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to compact JSON (no whitespace).
    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Topology {
    fn snapshot_slot(&self, id: SlotId) -> Option<SlotSnapshot> {
        let entry = self.slot(id).ok()?;
        Some(SlotSnapshot {
            id,
            name: entry.name.clone(),
            level: entry.level,
            partner: entry.partner,
            meta: entry.meta.clone(),
            subslots: entry
                .subslots
                .iter()
                .filter_map(|&sub| self.snapshot_slot(sub))
                .collect(),
        })
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let operators = self
            .operator_ids()
            .filter_map(|id| {
                let entry = self.op(id).ok()?;
                Some(OperatorSnapshot {
                    id,
                    name: entry.name.clone(),
                    parent: entry.parent,
                    lanes: entry.lanes.clone(),
                    inputs: entry
                        .inputs
                        .values()
                        .filter_map(|&s| self.snapshot_slot(s))
                        .collect(),
                    outputs: entry
                        .outputs
                        .values()
                        .filter_map(|&s| self.snapshot_slot(s))
                        .collect(),
                })
            })
            .collect();
        GraphSnapshot {
            version: GraphSnapshot::VERSION.to_string(),
            operators,
        }
    }
}
