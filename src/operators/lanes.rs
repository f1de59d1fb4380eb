//! Level-1 source serving one array per lane.

use crate::core::context::{ExecutionContext, SetupContext};
use crate::core::error::{ExecutionResult, GraphResult};
use crate::core::operator::{Operator, OperatorMetadata};
use crate::core::slot::SlotDefinition;
use crate::core::types::{ArrayBuffer, Element};
use async_trait::async_trait;
use ndarray::ArrayD;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Source with a level-1 `Output`.
///
/// The lane count is whatever the output is resized to; each lane serves the
/// default array unless an override was set for its index.
pub struct LaneSource {
    default: ArrayBuffer,
    overrides: RwLock<HashMap<usize, ArrayBuffer>>,
}

impl LaneSource {
    pub fn new<T: Element>(default: ArrayD<T>) -> Self {
        Self {
            default: ArrayBuffer::from_array(default),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Serve `buffer` on lane `index`. Call `Graph::refresh` afterwards.
    pub fn set_lane(&self, index: usize, buffer: impl Into<ArrayBuffer>) {
        self.overrides.write().insert(index, buffer.into());
    }

    /// Go back to the default array on lane `index`.
    pub fn clear_lane(&self, index: usize) {
        self.overrides.write().remove(&index);
    }

    fn with_lane<R>(&self, index: usize, f: impl FnOnce(&ArrayBuffer) -> R) -> R {
        let overrides = self.overrides.read();
        f(overrides.get(&index).unwrap_or(&self.default))
    }
}

#[async_trait]
impl Operator for LaneSource {
    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata::builder("LaneSource")
            .description("Serves one array per lane")
            .output(SlotDefinition::output("Output").with_level(1))
            .build()
    }

    fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()> {
        for lane in 0..ctx.output_lane_count("Output")? {
            let meta = self.with_lane(lane, ArrayBuffer::meta);
            ctx.set_output_lane_meta("Output", lane, meta)?;
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, result: &mut ArrayBuffer) -> ExecutionResult<()> {
        let lane = ctx.lane().ok_or_else(|| ctx.fail("read of the lane container itself"))?;
        let region = self.with_lane(lane, |buffer| buffer.region(ctx.roi()))?;
        result.copy_from(&region)
    }

    fn clone_box(&self) -> Box<dyn Operator> {
        Box::new(Self {
            default: self.default.clone(),
            overrides: RwLock::new(self.overrides.read().clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn test_lanes_serve_overrides() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(LaneSource::new(ArrayD::<u16>::from_elem(vec![2], 1)));
        let out = graph.output(src, "Output").unwrap();
        graph.resize(out, 2).unwrap();

        graph
            .with_operator::<LaneSource, _>(src, |s| s.set_lane(1, ArrayD::<u16>::from_elem(vec![3], 7)))
            .unwrap();
        graph.refresh(src).unwrap();

        let first = graph.subslot(out, 0).unwrap();
        let second = graph.subslot(out, 1).unwrap();
        assert_eq!(graph.meta(first).unwrap().unwrap().shape, vec![2]);
        assert_eq!(graph.meta(second).unwrap().unwrap().shape, vec![3]);

        let data = graph.read_all(second).unwrap().wait().unwrap();
        assert_eq!(data.into_array::<u16>().unwrap().as_slice(), Some(&[7, 7, 7][..]));
    }
}
