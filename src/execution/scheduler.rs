//! Cooperative worker pool running request futures.
//!
//! Each request is a task: a boxed future polled by whichever worker pops it.
//! A task that awaits an unfinished request is parked by returning `Pending`;
//! when the awaited request completes, its waker re-queues the task on the
//! parked queue of the worker that last ran it. Workers prefer their own
//! parked tasks, then fresh tasks (newest first), then steal parked tasks
//! from other workers.
//!
//! Threads blocked in [`RequestHandle::wait`] on a worker of the same
//! scheduler help by running queued tasks, so nested blocking waits cannot
//! starve the pool. A scheduler with zero workers runs everything on the
//! waiting threads.

use crate::core::error::{ExecutionError, ExecutionResult};
use crate::execution::request::{Completion, RequestHandle};
use futures::future::{BoxFuture, FutureExt};
use futures::task::{waker_ref, ArcWake};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

const NO_HOME: usize = usize::MAX;

thread_local! {
    /// (scheduler id, worker index) of the worker running on this thread.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

// ============================================================================
// Tasks
// ============================================================================

pub(crate) struct Task {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    /// Worker that last polled this task.
    home: AtomicUsize,
    queued: AtomicBool,
    shared: Weak<Shared>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(shared) = arc_self.shared.upgrade() {
            if shared.enqueue(Arc::clone(arc_self), true) {
                shared.counters.resumed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Finishes a request's completion exactly once.
///
/// Dropping an unfinished guard, which happens when a queued task is
/// discarded at shutdown, finishes the request as cancelled.
struct CompletionGuard<T> {
    completion: Arc<Completion<T>>,
    shared: Weak<Shared>,
    finished: bool,
}

impl<T> CompletionGuard<T> {
    fn finish(&mut self, outcome: ExecutionResult<T>) {
        let failed = outcome.is_err();
        if self.completion.finish(outcome) {
            if let Some(shared) = self.shared.upgrade() {
                let counter = if failed {
                    &shared.counters.failed
                } else {
                    &shared.counters.completed
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.finished = true;
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if !self.finished && self.completion.finish(Err(ExecutionError::Cancelled)) {
            if let Some(shared) = self.shared.upgrade() {
                shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    suspended: AtomicU64,
    resumed: AtomicU64,
    stolen: AtomicU64,
}

struct Queues {
    /// Never-polled tasks, popped newest first.
    fresh: Vec<Arc<Task>>,
    /// Resumed tasks per worker, plus one trailing queue for tasks without a home.
    parked: Vec<VecDeque<Arc<Task>>>,
}

pub(crate) struct Shared {
    id: usize,
    queues: Mutex<Queues>,
    available: Condvar,
    shutdown: AtomicBool,
    num_workers: usize,
    poll_interval: Duration,
    counters: Counters,
}

impl Shared {
    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Index of the calling thread if it is one of this scheduler's workers.
    fn current_worker(&self) -> Option<usize> {
        CURRENT_WORKER.with(|current| match current.get() {
            Some((id, index)) if id == self.id => Some(index),
            _ => None,
        })
    }

    /// Whether a thread blocked on a request should run tasks itself.
    pub(crate) fn should_help(&self) -> bool {
        self.num_workers == 0 || self.current_worker().is_some()
    }

    pub(crate) fn spawn<F, T>(self: &Arc<Self>, future: F) -> RequestHandle<T>
    where
        F: Future<Output = ExecutionResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let mut guard = CompletionGuard {
            completion: Arc::clone(&completion),
            shared: Arc::downgrade(self),
            finished: false,
        };
        let wrapped = async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    log::error!("request panicked: {}", message);
                    Err(ExecutionError::Panicked { message })
                }
            };
            guard.finish(outcome);
        };

        let task = Arc::new(Task {
            future: Mutex::new(Some(wrapped.boxed())),
            home: AtomicUsize::new(NO_HOME),
            queued: AtomicBool::new(false),
            shared: Arc::downgrade(self),
        });
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        self.enqueue(task, false);
        RequestHandle::new(completion, Arc::downgrade(self))
    }

    /// Queue a task; returns false if it was already queued or the
    /// scheduler is shutting down.
    fn enqueue(&self, task: Arc<Task>, resumed: bool) -> bool {
        if task.queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.shutdown.load(Ordering::Acquire) {
            task.queued.store(false, Ordering::Release);
            Self::cancel(&task);
            return false;
        }

        let mut queues = self.queues.lock();
        if resumed {
            let home = self.home_queue(&task);
            queues.parked[home].push_back(task);
        } else {
            queues.fresh.push(task);
        }
        drop(queues);
        self.available.notify_one();
        true
    }

    /// Parked queue of the worker that last polled `task`.
    fn home_queue(&self, task: &Task) -> usize {
        task.home.load(Ordering::Relaxed).min(self.num_workers)
    }

    /// Drop a task's future unless it is being polled right now.
    fn cancel(task: &Task) {
        let future = task.future.try_lock().and_then(|mut slot| slot.take());
        drop(future);
    }

    fn pop(&self, queues: &mut Queues, own: usize) -> Option<Arc<Task>> {
        if let Some(task) = queues.parked[own].pop_front() {
            return Some(task);
        }
        if let Some(task) = queues.fresh.pop() {
            return Some(task);
        }
        for index in 0..queues.parked.len() {
            if index == own {
                continue;
            }
            if let Some(task) = queues.parked[index].pop_front() {
                self.counters.stolen.fetch_add(1, Ordering::Relaxed);
                return Some(task);
            }
        }
        None
    }

    /// Poll a task once. Returns false if another thread is polling it.
    fn run(&self, task: Arc<Task>, worker: Option<usize>) -> bool {
        task.queued.store(false, Ordering::Release);
        let Some(mut slot) = task.future.try_lock() else {
            // being polled elsewhere; back to its home worker
            if !task.queued.swap(true, Ordering::AcqRel) {
                let home = self.home_queue(&task);
                self.queues.lock().parked[home].push_back(Arc::clone(&task));
                self.available.notify_one();
            }
            return false;
        };
        let Some(future) = slot.as_mut() else {
            return true;
        };

        task.home.store(worker.unwrap_or(NO_HOME), Ordering::Relaxed);
        let waker = waker_ref(&task);
        let mut cx = Context::from_waker(&waker);
        match std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                self.counters.suspended.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Poll::Ready(())) => {
                *slot = None;
            }
            Err(payload) => {
                log::error!("task poll panicked: {}", panic_message(&*payload));
                *slot = None;
            }
        }
        true
    }

    /// Run one queued task on the calling thread, if any.
    pub(crate) fn help_once(&self) -> bool {
        let worker = self.current_worker();
        let task = {
            let mut queues = self.queues.lock();
            self.pop(&mut queues, worker.unwrap_or(self.num_workers))
        };
        match task {
            Some(task) => self.run(task, worker),
            None => false,
        }
    }

    fn worker_loop(self: Arc<Self>, index: usize) {
        CURRENT_WORKER.with(|current| current.set(Some((self.id, index))));
        log::debug!("scheduler {}: worker {} started", self.id, index);
        loop {
            let task = {
                let mut queues = self.queues.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        log::debug!("scheduler {}: worker {} stopped", self.id, index);
                        return;
                    }
                    if let Some(task) = self.pop(&mut queues, index) {
                        break task;
                    }
                    self.available.wait(&mut queues);
                }
            };
            self.run(task, Some(index));
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks submitted.
    pub spawned: u64,
    /// Tasks finished successfully.
    pub completed: u64,
    /// Tasks finished with an error, panics included.
    pub failed: u64,
    /// Tasks discarded at shutdown.
    pub cancelled: u64,
    /// Polls that returned pending.
    pub suspended: u64,
    /// Wake-ups of parked tasks.
    pub resumed: u64,
    /// Parked tasks taken from another worker's queue.
    pub stolen: u64,
}

impl SchedulerStats {
    /// Tasks submitted but not yet finished.
    pub fn outstanding(&self) -> u64 {
        self.spawned
            .saturating_sub(self.completed + self.failed + self.cancelled)
    }
}

/// Fixed-size worker pool.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a pool with `num_workers` threads.
    pub fn new(num_workers: usize, poll_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            queues: Mutex::new(Queues {
                fresh: Vec::new(),
                parked: (0..=num_workers).map(|_| VecDeque::new()).collect(),
            }),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            num_workers,
            poll_interval,
            counters: Counters::default(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("roiflow-worker-{}", index))
                .spawn(move || worker.worker_loop(index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => log::error!("failed to start worker {}: {}", index, err),
            }
        }
        log::debug!(
            "scheduler {} started with {} workers",
            shared.id,
            workers.len()
        );

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Submit a future; its result is delivered through the returned handle.
    ///
    /// A panic inside the future completes the handle with
    /// [`ExecutionError::Panicked`] and leaves the worker running.
    pub fn put_task<F, T>(&self, future: F) -> RequestHandle<T>
    where
        F: Future<Output = ExecutionResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.spawn(future)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            spawned: c.spawned.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            suspended: c.suspended.load(Ordering::Relaxed),
            resumed: c.resumed.load(Ordering::Relaxed),
            stolen: c.stolen.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers and cancel everything still queued.
    ///
    /// Tasks running when this is called finish their current poll; any
    /// request not yet completed fails with [`ExecutionError::Cancelled`].
    pub fn finalize(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _queues = self.shared.queues.lock();
            self.shared.available.notify_all();
        }

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("scheduler {}: a worker thread panicked", self.shared.id);
            }
        }

        let drained: Vec<Arc<Task>> = {
            let mut queues = self.shared.queues.lock();
            let mut drained: Vec<Arc<Task>> = queues.fresh.drain(..).collect();
            for parked in queues.parked.iter_mut() {
                drained.extend(parked.drain(..));
            }
            drained
        };
        log::debug!(
            "scheduler {} finalized, cancelling {} queued tasks",
            self.shared.id,
            drained.len()
        );
        for task in drained {
            Shared::cancel(&task);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("num_workers", &self.shared.num_workers)
            .field("stats", &self.stats())
            .finish()
    }
}
