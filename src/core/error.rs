//! Error types for roiflow.
//!
//! Uses thiserror for structured errors with context. Errors are split by
//! where they surface:
//! - Wiring errors ([`GraphError`]) are raised synchronously at the graph-edit
//!   or read call site and are never retried
//! - Computation errors ([`ExecutionError`]) travel through request handles to
//!   every task awaiting the failed work, so they are `Clone`

use crate::core::types::DType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Index of an operator in a graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub usize);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Index of a slot in a graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Top-level error type for roiflow.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum RoiflowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("ROI error: {0}")]
    Roi(#[from] RoiError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors from ROI arithmetic and slicing.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoiError {
    #[error("Rank mismatch: expected {expected} axes, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("Axis {axis}: start {start} is past stop {stop}")]
    InvertedRange { axis: usize, start: usize, stop: usize },

    #[error("Axis {axis}: stop {stop} exceeds extent {extent}")]
    OutOfBounds { axis: usize, stop: usize, extent: usize },

    #[error("Axis {axis}: index {index} out of range for extent {extent}")]
    IndexOutOfRange { axis: usize, index: isize, extent: usize },

    #[error("Axis {axis}: step {step} is not supported, only unit steps select a ROI")]
    UnsupportedStep { axis: usize, step: isize },

    #[error("Axis {axis}: a new axis cannot select a ROI")]
    NewAxis { axis: usize },

    #[error("Invalid block shape {0:?}: every axis needs a positive extent")]
    InvalidBlockShape(Vec<usize>),
}

/// Errors related to graph structure and slot wiring.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphError {
    #[error("Operator {0} not found")]
    OperatorNotFound(OperatorId),

    #[error("Slot {0} not found")]
    SlotNotFound(SlotId),

    #[error("Operator '{operator}' has no slot named '{slot}'")]
    UnknownSlot { operator: String, slot: String },

    #[error("Slot '{slot}' of operator '{operator}' is not connected")]
    Disconnected { operator: String, slot: String },

    #[error("Slot '{slot}' is not ready: its metadata is not resolved yet")]
    NotReady { slot: String },

    #[error("Invalid connection: {reason}")]
    InvalidConnection { reason: String },

    #[error("Slot '{slot}' accepts {expected:?}, upstream provides {got}")]
    DTypeMismatch {
        slot: String,
        expected: Vec<DType>,
        got: DType,
    },

    #[error("Slot '{slot}' has level {got}, expected level {expected}")]
    LevelMismatch {
        slot: String,
        expected: usize,
        got: usize,
    },

    #[error("Connecting into operator '{operator}' would create a cycle")]
    CycleDetected { operator: String },

    #[error("Slot '{slot}' is not a multi-slot")]
    NotMultiSlot { slot: String },

    #[error("Lane {index} out of range for slot '{slot}' with {len} lanes")]
    LaneOutOfRange {
        slot: String,
        index: usize,
        len: usize,
    },

    #[error("Slot '{slot}' follows its upstream and cannot be resized directly")]
    ResizeFollower { slot: String },

    #[error("Setup of operator '{operator}' failed: {reason}")]
    Setup { operator: String, reason: String },

    #[error("Invalid ROI: {0}")]
    InvalidRoi(#[from] RoiError),
}

/// Errors raised while computing a requested region.
///
/// Cloneable so one failure can be delivered to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Operator '{operator}' failed computing '{output}': {error}")]
    OperatorFailed {
        operator: String,
        output: String,
        error: String,
    },

    #[error("Wiring error during execution: {0}")]
    Wiring(#[from] GraphError),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("DType mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("Task panicked: {message}")]
    Panicked { message: String },

    #[error("Request cancelled: the scheduler shut down before it completed")]
    Cancelled,

    #[error("Timeout after {duration_ms} ms")]
    Timeout { duration_ms: u64 },

    #[error("Request result was already taken")]
    ResultTaken,

    #[error("{0}")]
    Other(String),
}

/// Errors from loading engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

// ============================================================================
// Error Utilities
// ============================================================================

impl From<RoiError> for ExecutionError {
    fn from(err: RoiError) -> Self {
        ExecutionError::Wiring(GraphError::InvalidRoi(err))
    }
}

impl ExecutionError {
    /// Build an operator failure from any displayable error.
    pub fn operator(
        operator: impl Into<String>,
        output: impl Into<String>,
        error: impl fmt::Display,
    ) -> Self {
        ExecutionError::OperatorFailed {
            operator: operator.into(),
            output: output.into(),
            error: error.to_string(),
        }
    }

    /// Whether a later identical request might succeed.
    ///
    /// Wiring errors and shape problems are programmer errors and will fail
    /// again until the graph is changed.
    /// A blockwise cache logs transient fetch failures as warnings, since
    /// the next read retries them, and the rest as errors.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutionError::OperatorFailed { .. }
                | ExecutionError::Panicked { .. }
                | ExecutionError::Timeout { .. }
                | ExecutionError::Other(_)
        )
    }
}

/// Result type alias for roiflow operations.
pub type RoiflowResult<T> = Result<T, RoiflowError>;

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for execution operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Result type alias for ROI arithmetic.
pub type RoiResult<T> = Result<T, RoiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(OperatorId(3).to_string(), "op#3");
        assert_eq!(SlotId(12).to_string(), "slot#12");
    }

    #[test]
    fn test_roi_error_converts_to_execution_error() {
        let err: ExecutionError = RoiError::RankMismatch { expected: 2, got: 3 }.into();
        assert!(matches!(
            err,
            ExecutionError::Wiring(GraphError::InvalidRoi(RoiError::RankMismatch { .. }))
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_operator_failure_is_transient() {
        let err = ExecutionError::operator("Reader", "Output", "disk on fire");
        assert!(err.is_transient());
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_graph_error_serializes() {
        let err = GraphError::Disconnected {
            operator: "Cache".into(),
            slot: "Input".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: GraphError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
