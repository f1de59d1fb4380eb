//! The Operator trait and operator metadata.
//!
//! An operator is a named unit owning named input and output slots. It has
//! three hooks, called by the graph at different times:
//!
//! 1. **Setup** (`setup_outputs`): whenever input metadata changes and every
//!    required input is ready, derive the output metadata.
//! 2. **Execution** (`execute`): fill a requested region of one output. May
//!    issue nested reads on its inputs and await them.
//! 3. **Dirty propagation** (`propagate_dirty`): translate a dirty region on
//!    an input into dirty regions on the outputs.

use crate::core::context::{DirtyContext, ExecutionContext, SetupContext};
use crate::core::error::{ExecutionResult, GraphResult};
use crate::core::slot::SlotDefinition;
use crate::core::types::ArrayBuffer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Metadata describing an operator and its slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorMetadata {
    /// Human-readable name (e.g. "BlockwiseCache")
    pub name: String,
    /// Detailed description
    pub description: String,
    /// Input slot definitions
    pub inputs: Vec<SlotDefinition>,
    /// Output slot definitions
    pub outputs: Vec<SlotDefinition>,
}

impl OperatorMetadata {
    /// Create a new metadata builder.
    pub fn builder(name: impl Into<String>) -> OperatorMetadataBuilder {
        OperatorMetadataBuilder::new(name)
    }

    /// Get all input slot names.
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Get all output slot names.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Find an input slot by name.
    pub fn get_input(&self, name: &str) -> Option<&SlotDefinition> {
        self.inputs.iter().find(|s| s.name == name)
    }

    /// Find an output slot by name.
    pub fn get_output(&self, name: &str) -> Option<&SlotDefinition> {
        self.outputs.iter().find(|s| s.name == name)
    }
}

/// Builder for OperatorMetadata.
pub struct OperatorMetadataBuilder {
    name: String,
    description: String,
    inputs: Vec<SlotDefinition>,
    outputs: Vec<SlotDefinition>,
}

impl OperatorMetadataBuilder {
    /// Create a new builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add an input slot. The definition's direction is forced to input.
    pub fn input(mut self, mut slot: SlotDefinition) -> Self {
        slot.direction = crate::core::slot::SlotDirection::Input;
        self.inputs.push(slot);
        self
    }

    /// Add an output slot. The definition's direction is forced to output.
    pub fn output(mut self, mut slot: SlotDefinition) -> Self {
        slot.direction = crate::core::slot::SlotDirection::Output;
        self.outputs.push(slot);
        self
    }

    /// Build the metadata.
    pub fn build(self) -> OperatorMetadata {
        OperatorMetadata {
            name: self.name,
            description: self.description,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

/// Upcast helper so graph users can reach the concrete operator type.
pub trait AsAny {
    /// Borrow as `Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The core trait for operators.
///
/// # Thread Safety
///
/// Operators are shared between worker threads, so any mutable state must
/// sit behind a lock. `execute` may run concurrently for different regions.
///
/// # Example Implementation
///
/// ```ignore
/// #[derive(Clone)]
/// struct Invert;
///
/// #[async_trait]
/// impl Operator for Invert {
///     fn metadata(&self) -> OperatorMetadata {
///         OperatorMetadata::builder("Invert")
///             .input(SlotDefinition::input("Input").accepting(vec![DType::U8]))
///             .output(SlotDefinition::output("Output"))
///             .build()
///     }
///
///     fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()> {
///         let meta = ctx.input_meta("Input")?.clone();
///         ctx.set_output_meta("Output", meta)
///     }
///
///     async fn execute(&self, ctx: &ExecutionContext, result: &mut ArrayBuffer) -> ExecutionResult<()> {
///         let data = ctx.read_input("Input", ctx.roi().clone())?.await?;
///         let inverted = data.into_array::<u8>()?.mapv(|v| 255 - v);
///         result.copy_from(&ArrayBuffer::from(inverted))
///     }
///
///     fn clone_box(&self) -> Box<dyn Operator> {
///         Box::new(self.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait Operator: AsAny + Send + Sync {
    /// Get the metadata for this operator.
    ///
    /// Called once when the operator is added to a graph.
    fn metadata(&self) -> OperatorMetadata;

    /// Derive output metadata from input metadata.
    ///
    /// Only called when every required input is ready. Errors surface at the
    /// graph-edit call that triggered the setup.
    fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()>;

    /// Fill `result` with the region `ctx.roi()` of output `ctx.output()`.
    ///
    /// `result` is pre-allocated with the region's shape and the output dtype.
    async fn execute(&self, ctx: &ExecutionContext, result: &mut ArrayBuffer) -> ExecutionResult<()>;

    /// React to a dirty region on one of the inputs.
    ///
    /// Default implementation marks every output dirty in full.
    fn propagate_dirty(&self, ctx: &mut DirtyContext) {
        ctx.mark_all_outputs_dirty();
    }

    /// Called after an input has been connected.
    fn notify_connect(&self, _input: &str) {}

    /// Freeze or thaw this operator's outputs.
    ///
    /// An operator that can hold back updates stops forwarding dirty regions
    /// while fixed. When thawed it marks in `ctx` whatever changed in the
    /// meantime. The default ignores the request.
    fn set_fixed(&self, _fixed: bool, _ctx: &mut DirtyContext) {}

    /// Create a fresh instance with the same configuration.
    ///
    /// Used to populate the lanes of a wrapped operator; the new instance must
    /// not share per-lane state with `self`.
    fn clone_box(&self) -> Box<dyn Operator>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::slot::{SlotDefinition, SlotDirection};

    #[test]
    fn test_metadata_builder_forces_directions() {
        let meta = OperatorMetadata::builder("Thresholding")
            .description("Binarize an image")
            .input(SlotDefinition::output("Input"))
            .input(SlotDefinition::input("Threshold").optional())
            .output(SlotDefinition::input("Output"))
            .build();

        assert_eq!(meta.input_names(), vec!["Input", "Threshold"]);
        assert_eq!(meta.output_names(), vec!["Output"]);
        assert_eq!(meta.get_input("Input").unwrap().direction, SlotDirection::Input);
        assert_eq!(meta.get_output("Output").unwrap().direction, SlotDirection::Output);
        assert!(meta.get_input("Missing").is_none());
    }

    #[test]
    fn test_as_any_downcasts() {
        struct Marker(u32);
        let value = Marker(7);
        let any = value.as_any();
        assert_eq!(any.downcast_ref::<Marker>().map(|m| m.0), Some(7));
    }
}
