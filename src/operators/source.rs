//! In-memory array source.

use crate::core::context::{ExecutionContext, SetupContext};
use crate::core::error::{ExecutionResult, GraphResult};
use crate::core::operator::{Operator, OperatorMetadata};
use crate::core::slot::SlotDefinition;
use crate::core::types::{ArrayBuffer, Element};
use async_trait::async_trait;
use ndarray::ArrayD;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Serves regions of an array held in memory.
///
/// Replacing the data with [`ArraySource::set_data`] does not notify the
/// graph: call `Graph::refresh` if the shape or dtype changed and
/// `Graph::set_dirty` on the output.
pub struct ArraySource {
    data: Arc<RwLock<ArrayBuffer>>,
    axistags: Option<String>,
    reads: AtomicUsize,
}

impl ArraySource {
    pub fn new<T: Element>(array: ArrayD<T>) -> Self {
        Self::from_buffer(ArrayBuffer::from_array(array))
    }

    pub fn from_buffer(buffer: ArrayBuffer) -> Self {
        Self {
            data: Arc::new(RwLock::new(buffer)),
            axistags: None,
            reads: AtomicUsize::new(0),
        }
    }

    /// Attach axis labels to the published metadata.
    pub fn with_axistags(mut self, tags: impl Into<String>) -> Self {
        self.axistags = Some(tags.into());
        self
    }

    /// Replace the served array.
    pub fn set_data(&self, buffer: impl Into<ArrayBuffer>) {
        *self.data.write() = buffer.into();
    }

    /// Number of regions served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Operator for ArraySource {
    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata::builder("ArraySource")
            .description("Serves regions of an in-memory array")
            .output(SlotDefinition::output("Output").with_description("The stored array"))
            .build()
    }

    fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()> {
        let mut meta = self.data.read().meta();
        meta.axistags = self.axistags.clone();
        ctx.set_output_meta("Output", meta)
    }

    async fn execute(&self, ctx: &ExecutionContext, result: &mut ArrayBuffer) -> ExecutionResult<()> {
        let region = self.data.read().region(ctx.roi())?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        result.copy_from(&region)
    }

    fn clone_box(&self) -> Box<dyn Operator> {
        Box::new(Self {
            data: Arc::clone(&self.data),
            axistags: self.axistags.clone(),
            reads: AtomicUsize::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roi::Roi;
    use crate::core::types::DType;
    use crate::graph::Graph;

    #[test]
    fn test_source_publishes_meta() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ArrayD::<i64>::zeros(vec![3, 4])).with_axistags("yx"));
        let meta = graph.meta(graph.output(src, "Output").unwrap()).unwrap().unwrap();
        assert_eq!(meta.shape, vec![3, 4]);
        assert_eq!(meta.dtype, DType::I64);
        assert_eq!(meta.axistags.as_deref(), Some("yx"));
    }

    #[test]
    fn test_set_data_then_refresh() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ArrayD::<u8>::zeros(vec![2])));
        let out = graph.output(src, "Output").unwrap();

        graph
            .with_operator::<ArraySource, _>(src, |s| s.set_data(ArrayD::<u8>::from_elem(vec![5], 9)))
            .unwrap();
        graph.refresh(src).unwrap();
        assert_eq!(graph.meta(out).unwrap().unwrap().shape, vec![5]);

        let data = graph.read(out, Roi::new(vec![1], vec![3]).unwrap()).unwrap().wait().unwrap();
        assert_eq!(data.into_array::<u8>().unwrap().as_slice(), Some(&[9, 9][..]));
        assert_eq!(graph.with_operator::<ArraySource, _>(src, |s| s.read_count()).unwrap(), Some(1));
    }
}
