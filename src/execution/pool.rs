//! Batches of region reads.

use crate::core::error::{ExecutionError, ExecutionResult};
use crate::core::types::ArrayBuffer;
use crate::execution::request::{ReadRequest, RequestHandle};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;

/// A batch of reads submitted and awaited together.
///
/// Results come back in the order the requests were added. Every request
/// runs to completion even when another one fails; the first failure in that
/// order is returned.
#[derive(Debug, Default)]
pub struct RequestPool {
    requests: Vec<ReadRequest>,
    max_active: Option<usize>,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` requests in flight at once.
    pub fn with_max_active(mut self, limit: usize) -> Self {
        self.max_active = Some(limit.max(1));
        self
    }

    pub fn add(&mut self, request: ReadRequest) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Run every request from inside another request, parking it meanwhile.
    pub async fn join(self) -> ExecutionResult<Vec<ArrayBuffer>> {
        let outcomes: Vec<ExecutionResult<ArrayBuffer>> = match self.max_active {
            None => join_all(self.requests.into_iter().map(ReadRequest::submit)).await,
            Some(limit) => {
                stream::iter(self.requests)
                    .map(ReadRequest::submit)
                    .buffered(limit)
                    .collect()
                    .await
            }
        };
        first_failure(outcomes)
    }

    /// Submit every request and block until all have finished.
    pub fn wait(self) -> ExecutionResult<Vec<ArrayBuffer>> {
        let limit = self.max_active.unwrap_or(usize::MAX);
        let mut pending = self.requests.into_iter();
        let mut active: VecDeque<RequestHandle<ArrayBuffer>> = VecDeque::new();
        let mut outcomes = Vec::new();
        loop {
            while active.len() < limit {
                match pending.next() {
                    Some(request) => active.push_back(request.submit()),
                    None => break,
                }
            }
            match active.pop_front() {
                Some(handle) => outcomes.push(handle.wait()),
                None => break,
            }
        }
        first_failure(outcomes)
    }
}

impl Extend<ReadRequest> for RequestPool {
    fn extend<I: IntoIterator<Item = ReadRequest>>(&mut self, requests: I) {
        self.requests.extend(requests);
    }
}

impl FromIterator<ReadRequest> for RequestPool {
    fn from_iter<I: IntoIterator<Item = ReadRequest>>(requests: I) -> Self {
        Self {
            requests: requests.into_iter().collect(),
            max_active: None,
        }
    }
}

fn first_failure(outcomes: Vec<ExecutionResult<ArrayBuffer>>) -> ExecutionResult<Vec<ArrayBuffer>> {
    let mut buffers = Vec::with_capacity(outcomes.len());
    let mut failure: Option<ExecutionError> = None;
    for outcome in outcomes {
        match outcome {
            Ok(buffer) => buffers.push(buffer),
            Err(err) => {
                log::debug!("pooled request failed: {}", err);
                failure.get_or_insert(err);
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(buffers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roi::Roi;
    use crate::core::types::DType;
    use crate::graph::Graph;
    use crate::operators::ArraySource;
    use ndarray::ArrayD;

    fn ramp_graph(workers: usize) -> (Graph, crate::core::error::SlotId) {
        let graph = Graph::with_workers(workers);
        let src = graph.add_operator(ArraySource::new(
            ArrayD::from_shape_vec(vec![12], (0..12u16).collect()).unwrap(),
        ));
        let out = graph.output(src, "Output").unwrap();
        (graph, out)
    }

    fn segment(graph: &Graph, out: crate::core::error::SlotId, start: usize) -> ReadRequest {
        graph
            .read(out, Roi::new(vec![start], vec![start + 4]).unwrap())
            .unwrap()
    }

    #[test]
    fn test_pool_keeps_request_order() {
        let (graph, out) = ramp_graph(2);
        let pool: RequestPool = [8, 0, 4].iter().map(|&s| segment(&graph, out, s)).collect();
        assert_eq!(pool.len(), 3);

        let buffers = pool.with_max_active(2).wait().unwrap();
        let firsts: Vec<u16> = buffers
            .into_iter()
            .map(|b| b.into_array::<u16>().unwrap()[[0]])
            .collect();
        assert_eq!(firsts, vec![8, 0, 4]);
    }

    #[test]
    fn test_pool_reports_first_failure() {
        let (graph, out) = ramp_graph(1);
        let mut pool = RequestPool::new();
        pool.add(segment(&graph, out, 0));
        pool.add(segment(&graph, out, 4).write_into(ArrayBuffer::zeros(DType::U16, &[3])));
        pool.add(segment(&graph, out, 8).write_into(ArrayBuffer::zeros(DType::U8, &[4])));

        assert!(matches!(
            pool.wait(),
            Err(ExecutionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_pool_joins_inside_request() {
        for workers in [0, 1] {
            let (graph, out) = ramp_graph(workers);
            let mut pool = RequestPool::new().with_max_active(1);
            pool.extend((0..3).map(|i| segment(&graph, out, i * 4)));

            let buffers = graph.put_task(pool.join()).wait().unwrap();
            assert_eq!(buffers.len(), 3);
            assert!(buffers.iter().all(|b| b.shape() == &[4]));

            let unbounded: RequestPool = (0..3).map(|i| segment(&graph, out, i * 4)).collect();
            assert_eq!(graph.put_task(unbounded.join()).wait().unwrap().len(), 3);
        }
    }
}
