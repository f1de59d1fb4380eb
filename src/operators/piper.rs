//! Pass-through operator.

use crate::core::context::{DirtyContext, ExecutionContext, SetupContext};
use crate::core::error::{ExecutionResult, GraphResult};
use crate::core::operator::{Operator, OperatorMetadata};
use crate::core::slot::SlotDefinition;
use crate::core::types::{ArrayBuffer, DType};
use async_trait::async_trait;

/// Copies `Input` to `Output`.
#[derive(Debug, Clone, Default)]
pub struct Piper {
    accepts: Option<Vec<DType>>,
}

impl Piper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A piper whose input only accepts the given dtypes.
    pub fn accepting(dtypes: impl Into<Vec<DType>>) -> Self {
        Self {
            accepts: Some(dtypes.into()),
        }
    }
}

#[async_trait]
impl Operator for Piper {
    fn metadata(&self) -> OperatorMetadata {
        let mut input = SlotDefinition::input("Input");
        if let Some(dtypes) = &self.accepts {
            input = input.accepting(dtypes.clone());
        }
        OperatorMetadata::builder("Piper")
            .description("Passes its input through unchanged")
            .input(input)
            .output(SlotDefinition::output("Output"))
            .build()
    }

    fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()> {
        let meta = ctx.input_meta("Input")?.clone();
        ctx.set_output_meta("Output", meta)
    }

    async fn execute(&self, ctx: &ExecutionContext, result: &mut ArrayBuffer) -> ExecutionResult<()> {
        let data = ctx.read_input("Input", ctx.roi().clone())?.await?;
        result.copy_from(&data)
    }

    fn propagate_dirty(&self, ctx: &mut DirtyContext) {
        let roi = ctx.roi().cloned();
        ctx.mark_output_dirty("Output", roi);
    }

    fn clone_box(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}
