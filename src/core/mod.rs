//! Core types and traits.
//!
//! This module contains the building blocks shared by the graph and the
//! execution engine:
//! - Regions of interest and block arithmetic
//! - Array metadata and typed buffers
//! - Slot definitions and operator metadata
//! - The operator trait and its contexts
//! - Error types

pub mod context;
pub mod error;
pub mod operator;
pub mod roi;
pub mod slot;
pub mod types;

// Re-export commonly used types
pub use context::{DirtyContext, ExecutionContext, SetupContext, SlotMeta};
pub use error::{
    ConfigError, ExecutionError, GraphError, OperatorId, RoiError, RoiflowError, SlotId,
};
pub use operator::{Operator, OperatorMetadata};
pub use roi::Roi;
pub use slot::{SlotDefinition, SlotDirection};
pub use types::{ArrayBuffer, ArrayMeta, DType, Element};
