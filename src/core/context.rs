//! Setup, dirty-propagation and execution contexts.
//!
//! Contexts are what an operator sees of the graph from inside its hooks.
//! Setup and dirty contexts are plain data: the graph fills them, calls the
//! hook, and applies whatever the operator recorded. The execution context
//! carries a graph handle so `execute` can issue nested reads.

use crate::core::error::{ExecutionError, ExecutionResult, GraphError, GraphResult, OperatorId};
use crate::core::roi::Roi;
use crate::core::types::ArrayMeta;
use crate::execution::request::ReadRequest;
use crate::graph::structure::Graph;
use indexmap::IndexMap;
use std::fmt;

/// Resolved metadata of one slot as seen by setup.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotMeta {
    /// A level-0 slot; `None` when not ready.
    Single(Option<ArrayMeta>),
    /// A level-1 slot with one entry per lane.
    Lanes(Vec<Option<ArrayMeta>>),
}

impl SlotMeta {
    /// Whether every array in this slot is ready.
    pub fn is_ready(&self) -> bool {
        match self {
            SlotMeta::Single(meta) => meta.is_some(),
            SlotMeta::Lanes(lanes) => lanes.iter().all(Option::is_some),
        }
    }
}

/// Context provided to [`Operator::setup_outputs`](crate::core::operator::Operator::setup_outputs).
#[derive(Debug, Clone)]
pub struct SetupContext {
    operator: String,
    inputs: IndexMap<String, SlotMeta>,
    outputs: IndexMap<String, SlotMeta>,
}

impl SetupContext {
    pub(crate) fn new(
        operator: impl Into<String>,
        inputs: IndexMap<String, SlotMeta>,
        outputs: IndexMap<String, SlotMeta>,
    ) -> Self {
        Self {
            operator: operator.into(),
            inputs,
            outputs,
        }
    }

    /// Name of the operator being set up.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    fn input(&self, name: &str) -> GraphResult<&SlotMeta> {
        self.inputs.get(name).ok_or_else(|| GraphError::UnknownSlot {
            operator: self.operator.clone(),
            slot: name.to_string(),
        })
    }

    /// Metadata of a level-0 input.
    pub fn input_meta(&self, name: &str) -> GraphResult<&ArrayMeta> {
        match self.input(name)? {
            SlotMeta::Single(Some(meta)) => Ok(meta),
            SlotMeta::Single(None) => Err(GraphError::NotReady {
                slot: name.to_string(),
            }),
            SlotMeta::Lanes(_) => Err(GraphError::LevelMismatch {
                slot: name.to_string(),
                expected: 0,
                got: 1,
            }),
        }
    }

    /// Metadata of an optional level-0 input, if connected and ready.
    pub fn optional_input_meta(&self, name: &str) -> Option<&ArrayMeta> {
        match self.inputs.get(name) {
            Some(SlotMeta::Single(meta)) => meta.as_ref(),
            _ => None,
        }
    }

    /// Per-lane metadata of a level-1 input.
    pub fn input_lanes(&self, name: &str) -> GraphResult<&[Option<ArrayMeta>]> {
        match self.input(name)? {
            SlotMeta::Lanes(lanes) => Ok(lanes),
            SlotMeta::Single(_) => Err(GraphError::NotMultiSlot {
                slot: name.to_string(),
            }),
        }
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    fn output_mut(&mut self, name: &str) -> GraphResult<&mut SlotMeta> {
        let operator = &self.operator;
        self.outputs
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownSlot {
                operator: operator.clone(),
                slot: name.to_string(),
            })
    }

    /// Number of lanes of a level-1 output.
    pub fn output_lane_count(&self, name: &str) -> GraphResult<usize> {
        match self.outputs.get(name) {
            Some(SlotMeta::Lanes(lanes)) => Ok(lanes.len()),
            Some(SlotMeta::Single(_)) => Err(GraphError::NotMultiSlot {
                slot: name.to_string(),
            }),
            None => Err(GraphError::UnknownSlot {
                operator: self.operator.clone(),
                slot: name.to_string(),
            }),
        }
    }

    /// Set the metadata of a level-0 output.
    pub fn set_output_meta(&mut self, name: &str, meta: ArrayMeta) -> GraphResult<()> {
        match self.output_mut(name)? {
            SlotMeta::Single(slot) => {
                *slot = Some(meta);
                Ok(())
            }
            SlotMeta::Lanes(_) => Err(GraphError::LevelMismatch {
                slot: name.to_string(),
                expected: 0,
                got: 1,
            }),
        }
    }

    /// Set the metadata of one lane of a level-1 output.
    pub fn set_output_lane_meta(
        &mut self,
        name: &str,
        lane: usize,
        meta: ArrayMeta,
    ) -> GraphResult<()> {
        match self.output_mut(name)? {
            SlotMeta::Lanes(lanes) => {
                let len = lanes.len();
                let slot = lanes.get_mut(lane).ok_or_else(|| GraphError::LaneOutOfRange {
                    slot: name.to_string(),
                    index: lane,
                    len,
                })?;
                *slot = Some(meta);
                Ok(())
            }
            SlotMeta::Single(_) => Err(GraphError::NotMultiSlot {
                slot: name.to_string(),
            }),
        }
    }

    /// Build a setup failure for this operator.
    pub fn error(&self, reason: impl fmt::Display) -> GraphError {
        GraphError::Setup {
            operator: self.operator.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn into_outputs(self) -> IndexMap<String, SlotMeta> {
        self.outputs
    }
}

/// One dirty region recorded by an operator.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DirtyMark {
    pub output: String,
    pub lane: Option<usize>,
    pub roi: Option<Roi>,
}

/// Context provided to [`Operator::propagate_dirty`](crate::core::operator::Operator::propagate_dirty).
///
/// A `None` ROI means the whole slot.
#[derive(Debug, Clone)]
pub struct DirtyContext {
    input: String,
    subindex: Vec<usize>,
    roi: Option<Roi>,
    outputs: Vec<String>,
    marks: Vec<DirtyMark>,
}

impl DirtyContext {
    pub(crate) fn new(
        input: impl Into<String>,
        subindex: Vec<usize>,
        roi: Option<Roi>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            input: input.into(),
            subindex,
            roi,
            outputs,
            marks: Vec::new(),
        }
    }

    /// Name of the input that became dirty.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Lane path of the dirty sub-slot, empty for a level-0 input.
    pub fn subindex(&self) -> &[usize] {
        &self.subindex
    }

    /// The dirty region, `None` for the whole input.
    pub fn roi(&self) -> Option<&Roi> {
        self.roi.as_ref()
    }

    /// Mark a region of an output dirty.
    pub fn mark_output_dirty(&mut self, output: &str, roi: Option<Roi>) {
        self.marks.push(DirtyMark {
            output: output.to_string(),
            lane: None,
            roi,
        });
    }

    /// Mark a region of one lane of a level-1 output dirty.
    pub fn mark_output_lane_dirty(&mut self, output: &str, lane: usize, roi: Option<Roi>) {
        self.marks.push(DirtyMark {
            output: output.to_string(),
            lane: Some(lane),
            roi,
        });
    }

    /// Mark every output dirty in full.
    pub fn mark_all_outputs_dirty(&mut self) {
        let marks = self.outputs.iter().map(|output| DirtyMark {
            output: output.clone(),
            lane: None,
            roi: None,
        });
        self.marks.extend(marks);
    }

    pub(crate) fn into_marks(self) -> Vec<DirtyMark> {
        self.marks
    }
}

/// Context provided to [`Operator::execute`](crate::core::operator::Operator::execute).
#[derive(Clone)]
pub struct ExecutionContext {
    graph: Graph,
    operator: OperatorId,
    operator_name: String,
    output: String,
    subindex: Vec<usize>,
    roi: Roi,
    meta: ArrayMeta,
}

impl ExecutionContext {
    pub(crate) fn new(
        graph: Graph,
        operator: OperatorId,
        operator_name: String,
        output: String,
        subindex: Vec<usize>,
        roi: Roi,
        meta: ArrayMeta,
    ) -> Self {
        Self {
            graph,
            operator,
            operator_name,
            output,
            subindex,
            roi,
            meta,
        }
    }

    /// The graph this request runs in.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The operator being executed.
    pub fn operator_id(&self) -> OperatorId {
        self.operator
    }

    /// Name of the operator being executed.
    pub fn operator_name(&self) -> &str {
        &self.operator_name
    }

    /// Name of the output being computed.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Lane path of the output sub-slot, empty for level-0 outputs.
    pub fn subindex(&self) -> &[usize] {
        &self.subindex
    }

    /// First lane index, for level-1 outputs.
    pub fn lane(&self) -> Option<usize> {
        self.subindex.first().copied()
    }

    /// The requested region.
    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    /// Metadata of the output being computed.
    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    /// Metadata of a level-0 input.
    pub fn input_meta(&self, name: &str) -> ExecutionResult<ArrayMeta> {
        let slot = self.graph.input(self.operator, name)?;
        self.graph.meta(slot)?.ok_or_else(|| {
            ExecutionError::Wiring(GraphError::NotReady {
                slot: name.to_string(),
            })
        })
    }

    /// Start building a read of `roi` from a level-0 input.
    pub fn read_input(&self, name: &str, roi: Roi) -> ExecutionResult<ReadRequest> {
        let slot = self.graph.input(self.operator, name)?;
        Ok(self.graph.read(slot, roi)?)
    }

    /// Start building a read of `roi` from one lane of a level-1 input.
    pub fn read_input_lane(&self, name: &str, lane: usize, roi: Roi) -> ExecutionResult<ReadRequest> {
        let slot = self.graph.input(self.operator, name)?;
        let sub = self.graph.subslot(slot, lane)?;
        Ok(self.graph.read(sub, roi)?)
    }

    /// Wrap an error as a failure of this operator's output.
    pub fn fail(&self, error: impl fmt::Display) -> ExecutionError {
        ExecutionError::operator(&self.operator_name, &self.output, error)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("operator", &self.operator_name)
            .field("output", &self.output)
            .field("subindex", &self.subindex)
            .field("roi", &self.roi)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DType;

    fn setup_ctx() -> SetupContext {
        let mut inputs = IndexMap::new();
        inputs.insert(
            "Input".to_string(),
            SlotMeta::Single(Some(ArrayMeta::new(vec![4, 4], DType::U8))),
        );
        inputs.insert("Mask".to_string(), SlotMeta::Single(None));
        inputs.insert(
            "Stack".to_string(),
            SlotMeta::Lanes(vec![Some(ArrayMeta::new(vec![2], DType::F32)), None]),
        );
        let mut outputs = IndexMap::new();
        outputs.insert("Output".to_string(), SlotMeta::Single(None));
        outputs.insert("Lanes".to_string(), SlotMeta::Lanes(vec![None, None]));
        SetupContext::new("Test", inputs, outputs)
    }

    #[test]
    fn test_setup_context_inputs() {
        let ctx = setup_ctx();
        assert_eq!(ctx.input_meta("Input").unwrap().shape, vec![4, 4]);
        assert!(matches!(ctx.input_meta("Mask"), Err(GraphError::NotReady { .. })));
        assert!(ctx.optional_input_meta("Mask").is_none());
        assert_eq!(ctx.input_lanes("Stack").unwrap().len(), 2);
        assert!(matches!(
            ctx.input_meta("Stack"),
            Err(GraphError::LevelMismatch { .. })
        ));
        assert!(matches!(
            ctx.input_meta("Nope"),
            Err(GraphError::UnknownSlot { .. })
        ));
    }

    #[test]
    fn test_setup_context_outputs() {
        let mut ctx = setup_ctx();
        let meta = ArrayMeta::new(vec![4, 4], DType::U8);
        ctx.set_output_meta("Output", meta.clone()).unwrap();
        assert_eq!(ctx.output_lane_count("Lanes").unwrap(), 2);
        ctx.set_output_lane_meta("Lanes", 1, meta.clone()).unwrap();
        assert!(matches!(
            ctx.set_output_lane_meta("Lanes", 2, meta.clone()),
            Err(GraphError::LaneOutOfRange { index: 2, len: 2, .. })
        ));

        let outputs = ctx.into_outputs();
        assert_eq!(outputs["Output"], SlotMeta::Single(Some(meta.clone())));
        assert_eq!(outputs["Lanes"], SlotMeta::Lanes(vec![None, Some(meta)]));
    }

    #[test]
    fn test_dirty_context_marks_all_outputs() {
        let mut ctx = DirtyContext::new(
            "Input",
            vec![],
            None,
            vec!["A".to_string(), "B".to_string()],
        );
        ctx.mark_all_outputs_dirty();
        let marks = ctx.into_marks();
        assert_eq!(marks.len(), 2);
        assert!(marks.iter().all(|m| m.roi.is_none() && m.lane.is_none()));
    }
}
