//! Request handles, completion events and region reads.
//!
//! A [`RequestHandle`] is the consuming end of one scheduled task. It can be
//! awaited from inside another request (parking that task) or waited on
//! synchronously. [`ReadRequest`] describes "compute this region of this
//! slot"; submitting it schedules the producing operator's `execute`.

use crate::core::context::ExecutionContext;
use crate::core::error::{ExecutionError, ExecutionResult, GraphResult};
use crate::core::roi::Roi;
use crate::core::types::{ArrayBuffer, ArrayMeta};
use crate::execution::scheduler::Shared;
use crate::graph::structure::Graph;
use crate::graph::topology::ResolvedOutput;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Longest a helping thread sleeps before looking for queued work again.
const HELP_SLICE: Duration = Duration::from_millis(1);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Completion
// ============================================================================

type Callback<T> = Box<dyn FnOnce(&ExecutionResult<T>) + Send>;

struct CompletionState<T> {
    outcome: Option<ExecutionResult<T>>,
    finished: bool,
    /// Tasks parked on this completion, woken in arrival order.
    waiters: VecDeque<Waker>,
    callbacks: Vec<Callback<T>>,
}

fn run_callback<T>(callback: Callback<T>, outcome: &ExecutionResult<T>) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|m| m.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        log::error!("request callback panicked: {}", message);
    }
}

/// One-shot result slot shared by a task and its waiters.
pub(crate) struct Completion<T> {
    state: Mutex<CompletionState<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                outcome: None,
                finished: false,
                waiters: VecDeque::new(),
                callbacks: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Store the outcome; returns false if already finished.
    ///
    /// Callbacks run first, on the finishing thread, before any waiter can
    /// observe the outcome.
    pub(crate) fn finish(&self, outcome: ExecutionResult<T>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            for callback in std::mem::take(&mut state.callbacks) {
                run_callback(callback, &outcome);
            }
            state.finished = true;
            state.outcome = Some(outcome);
            std::mem::take(&mut state.waiters)
        };
        self.done.notify_all();
        for waker in waiters {
            waker.wake();
        }
        true
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Run `callback` on the outcome, now if already finished.
    fn subscribe(&self, callback: Callback<T>) {
        let mut state = self.state.lock();
        if !state.finished {
            state.callbacks.push(callback);
            return;
        }
        match &state.outcome {
            Some(outcome) => run_callback(callback, outcome),
            None => log::debug!("request result already taken; callback skipped"),
        }
    }

    fn register(state: &mut CompletionState<T>, waker: &Waker) {
        if !state.waiters.iter().any(|w| w.will_wake(waker)) {
            state.waiters.push_back(waker.clone());
        }
    }

    fn take_from(state: &mut CompletionState<T>) -> ExecutionResult<T> {
        state
            .outcome
            .take()
            .unwrap_or(Err(ExecutionError::ResultTaken))
    }

    fn take(&self) -> Option<ExecutionResult<T>> {
        let mut state = self.state.lock();
        if state.finished {
            Some(Self::take_from(&mut state))
        } else {
            None
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<ExecutionResult<T>> {
        let mut state = self.state.lock();
        if state.finished {
            Poll::Ready(Self::take_from(&mut state))
        } else {
            Self::register(&mut state, cx.waker());
            Poll::Pending
        }
    }

    /// Block until finished or `timeout` elapses; returns whether finished.
    fn wait_for(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.finished {
            self.done.wait_for(&mut state, timeout);
        }
        state.finished
    }
}

impl<T: Clone> Completion<T> {
    fn poll_shared(&self, cx: &mut Context<'_>) -> Poll<ExecutionResult<T>> {
        let mut state = self.state.lock();
        if state.finished {
            Poll::Ready(
                state
                    .outcome
                    .clone()
                    .unwrap_or(Err(ExecutionError::ResultTaken)),
            )
        } else {
            Self::register(&mut state, cx.waker());
            Poll::Pending
        }
    }
}

/// Block on a completion, running queued tasks when this thread must help.
fn block_until<T>(completion: &Completion<T>, scheduler: &Weak<Shared>, deadline: Instant) -> bool {
    loop {
        if completion.is_finished() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let remaining = deadline - now;
        match scheduler.upgrade() {
            Some(shared) if shared.should_help() => {
                if !shared.help_once() {
                    completion.wait_for(remaining.min(HELP_SLICE));
                }
            }
            _ => {
                completion.wait_for(remaining);
            }
        }
    }
}

fn poll_interval(scheduler: &Weak<Shared>) -> Duration {
    scheduler
        .upgrade()
        .map_or(DEFAULT_POLL_INTERVAL, |shared| shared.poll_interval())
}

// ============================================================================
// Handles
// ============================================================================

/// Handle to the result of a scheduled request.
///
/// Awaiting the handle inside another request suspends that request until
/// this one finishes. The result can be taken once.
pub struct RequestHandle<T> {
    completion: Arc<Completion<T>>,
    scheduler: Weak<Shared>,
}

impl<T> RequestHandle<T> {
    pub(crate) fn new(completion: Arc<Completion<T>>, scheduler: Weak<Shared>) -> Self {
        Self {
            completion,
            scheduler,
        }
    }

    /// Whether the request has finished.
    pub fn is_done(&self) -> bool {
        self.completion.is_finished()
    }

    /// Call `callback` with the result once the request succeeds.
    ///
    /// Runs immediately if the request already succeeded and its result has
    /// not been taken. Callbacks run on the thread finishing the request
    /// while its state is locked, so they must not wait on this request.
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
        T: 'static,
    {
        self.completion.subscribe(Box::new(move |outcome: &ExecutionResult<T>| {
            if let Ok(value) = outcome {
                callback(value);
            }
        }));
    }

    /// Call `callback` with the error once the request fails.
    ///
    /// Cancellation at scheduler shutdown counts as a failure.
    pub fn on_failed<F>(&self, callback: F)
    where
        F: FnOnce(&ExecutionError) + Send + 'static,
        T: 'static,
    {
        self.completion.subscribe(Box::new(move |outcome: &ExecutionResult<T>| {
            if let Err(err) = outcome {
                callback(err);
            }
        }));
    }

    /// Wait at most `timeout` for the result.
    ///
    /// Returns [`ExecutionError::Timeout`] if the request is still running;
    /// the handle stays usable.
    pub fn wait_timeout(&self, timeout: Duration) -> ExecutionResult<T> {
        let deadline = Instant::now() + timeout;
        if block_until(&self.completion, &self.scheduler, deadline) {
            if let Some(outcome) = self.completion.take() {
                return outcome;
            }
        }
        Err(ExecutionError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        })
    }

    /// Block until the request finishes.
    pub fn wait(self) -> ExecutionResult<T> {
        let interval = poll_interval(&self.scheduler);
        loop {
            match self.wait_timeout(interval) {
                Err(ExecutionError::Timeout { .. }) if !self.is_done() => {
                    log::trace!("still waiting for request");
                }
                outcome => return outcome,
            }
        }
    }
}

impl RequestHandle<()> {
    /// Convert into a cloneable completion event.
    pub fn into_event(self) -> Event {
        Event {
            completion: self.completion,
            scheduler: self.scheduler,
        }
    }
}

impl<T> Future for RequestHandle<T> {
    type Output = ExecutionResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.poll_take(cx)
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Cloneable completion signal; every clone observes the same outcome.
#[derive(Clone)]
pub struct Event {
    completion: Arc<Completion<()>>,
    scheduler: Weak<Shared>,
}

impl Event {
    /// Whether the underlying request has finished.
    pub fn is_set(&self) -> bool {
        self.completion.is_finished()
    }

    /// Block until the underlying request finishes.
    pub fn wait(&self) -> ExecutionResult<()> {
        let interval = poll_interval(&self.scheduler);
        while !block_until(&self.completion, &self.scheduler, Instant::now() + interval) {
            log::trace!("still waiting for event");
        }
        let state = self.completion.state.lock();
        state
            .outcome
            .clone()
            .unwrap_or(Err(ExecutionError::ResultTaken))
    }
}

impl Future for Event {
    type Output = ExecutionResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.poll_shared(cx)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

// ============================================================================
// Region reads
// ============================================================================

/// A pending read of one region of one slot.
///
/// Nothing runs until the request is submitted, awaited or waited on.
pub struct ReadRequest {
    graph: Graph,
    target: ResolvedOutput,
    roi: Roi,
    destination: Option<ArrayBuffer>,
}

impl ReadRequest {
    pub(crate) fn new(graph: Graph, target: ResolvedOutput, roi: Roi) -> Self {
        Self {
            graph,
            target,
            roi,
            destination: None,
        }
    }

    /// The requested region.
    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    /// Metadata of the producing output.
    pub fn meta(&self) -> &ArrayMeta {
        &self.target.meta
    }

    /// Name of the operator that will compute the region.
    pub fn operator_name(&self) -> &str {
        &self.target.operator_name
    }

    /// Write the result into a caller-provided buffer.
    pub fn write_into(mut self, destination: ArrayBuffer) -> Self {
        self.destination = Some(destination);
        self
    }

    /// A zeroed buffer matching the request's shape and dtype.
    pub fn allocate(&self) -> ArrayBuffer {
        ArrayBuffer::zeros(self.target.meta.dtype, &self.roi.shape())
    }

    /// The same producer, a different region.
    pub fn retarget(&self, roi: Roi) -> GraphResult<ReadRequest> {
        roi.check_within(&self.target.meta.shape)?;
        Ok(ReadRequest::new(self.graph.clone(), self.target.clone(), roi))
    }

    /// Schedule the computation.
    ///
    /// The queued task holds the graph weakly, so dropping every graph handle
    /// cancels reads that have not started.
    pub fn submit(self) -> RequestHandle<ArrayBuffer> {
        let ReadRequest {
            graph,
            target,
            roi,
            destination,
        } = self;
        let weak = graph.downgrade();
        graph.put_task(async move {
            let graph = weak.upgrade().ok_or(ExecutionError::Cancelled)?;
            compute(graph, target, roi, destination).await
        })
    }

    /// Submit and block until the region is computed.
    pub fn wait(self) -> ExecutionResult<ArrayBuffer> {
        self.submit().wait()
    }
}

/// Run the producing operator for `roi` and check what it wrote.
async fn compute(
    graph: Graph,
    target: ResolvedOutput,
    roi: Roi,
    destination: Option<ArrayBuffer>,
) -> ExecutionResult<ArrayBuffer> {
    let expected = roi.shape();

    let mut buffer = match destination {
        Some(buffer) => {
            if buffer.dtype() != target.meta.dtype {
                return Err(ExecutionError::DTypeMismatch {
                    expected: target.meta.dtype,
                    got: buffer.dtype(),
                });
            }
            if buffer.shape() != expected.as_slice() {
                return Err(ExecutionError::ShapeMismatch {
                    expected,
                    got: buffer.shape().to_vec(),
                });
            }
            buffer
        }
        None => ArrayBuffer::zeros(target.meta.dtype, &expected),
    };

    log::trace!(
        "computing {} of '{}'.{}",
        roi,
        target.operator_name,
        target.output
    );
    let ctx = ExecutionContext::new(
        graph,
        target.operator,
        target.operator_name.clone(),
        target.output.clone(),
        target.subindex.clone(),
        roi,
        target.meta.clone(),
    );
    target.instance.execute(&ctx, &mut buffer).await?;

    if buffer.shape() != expected.as_slice() {
        return Err(ExecutionError::ShapeMismatch {
            expected,
            got: buffer.shape().to_vec(),
        });
    }
    if buffer.dtype() != target.meta.dtype {
        return Err(ExecutionError::DTypeMismatch {
            expected: target.meta.dtype,
            got: buffer.dtype(),
        });
    }
    Ok(buffer)
}

impl IntoFuture for ReadRequest {
    type Output = ExecutionResult<ArrayBuffer>;
    type IntoFuture = RequestHandle<ArrayBuffer>;

    fn into_future(self) -> Self::IntoFuture {
        self.submit()
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("operator", &self.target.operator_name)
            .field("output", &self.target.output)
            .field("roi", &self.roi)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scheduler::Scheduler;

    #[test]
    fn test_completion_finishes_once() {
        let completion = Completion::<u8>::new();
        assert!(completion.finish(Ok(1)));
        assert!(!completion.finish(Ok(2)));
        assert_eq!(completion.take(), Some(Ok(1)));
        assert_eq!(completion.take(), Some(Err(ExecutionError::ResultTaken)));
    }

    #[test]
    fn test_wait_timeout_keeps_handle_usable() {
        let pool = Scheduler::new(1, Duration::from_millis(5));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = pool.put_task(async move {
            let _ = rx.recv_timeout(Duration::from_secs(5));
            Ok(3)
        });
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(10)),
            Err(ExecutionError::Timeout { .. })
        ));
        tx.send(()).unwrap();
        assert_eq!(handle.wait().unwrap(), 3);
    }

    #[test]
    fn test_callbacks_see_outcome_before_waiters() {
        let pool = Scheduler::new(1, Duration::from_millis(5));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let ok = pool.put_task(async { Ok(4u32) });
        let sink = Arc::clone(&seen);
        ok.on_finished(move |v| sink.lock().push(format!("finished {}", v)));
        let sink = Arc::clone(&seen);
        ok.on_failed(move |e| sink.lock().push(format!("failed {}", e)));
        assert_eq!(ok.wait(), Ok(4));
        assert_eq!(*seen.lock(), vec!["finished 4".to_string()]);

        let bad = pool.put_task(async { Err::<u32, _>(ExecutionError::Other("no disk".into())) });
        let sink = Arc::clone(&seen);
        bad.on_failed(move |e| sink.lock().push(e.to_string()));
        assert!(bad.wait().is_err());
        assert_eq!(seen.lock().last().map(String::as_str), Some("no disk"));
    }

    #[test]
    fn test_failed_callback_on_cancel() {
        let pool = Scheduler::new(0, Duration::from_millis(5));
        let handle = pool.put_task(async { Ok(()) });
        let cancelled = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&cancelled);
        handle.on_failed(move |e| *sink.lock() = Some(e.clone()));

        pool.finalize();
        assert_eq!(*cancelled.lock(), Some(ExecutionError::Cancelled));
        assert_eq!(handle.wait(), Err(ExecutionError::Cancelled));
    }

    #[test]
    fn test_panicking_callback_does_not_block_waiters() {
        let pool = Scheduler::new(1, Duration::from_millis(5));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = pool.put_task(async move {
            let _ = rx.recv_timeout(Duration::from_secs(5));
            Ok(1)
        });
        handle.on_finished(|_| panic!("bad callback"));
        tx.send(()).unwrap();
        assert_eq!(handle.wait(), Ok(1));
    }

    #[test]
    fn test_event_is_shared() {
        let pool = Scheduler::new(1, Duration::from_millis(5));
        let event = pool.put_task(async { Ok(()) }).into_event();
        let copy = event.clone();
        assert_eq!(event.wait(), Ok(()));
        assert_eq!(copy.wait(), Ok(()));
        assert!(copy.is_set());
    }
}
