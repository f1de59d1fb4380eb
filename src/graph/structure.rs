//! The graph handle.
//!
//! [`Graph`] is a cheap, cloneable handle to one operator graph and its
//! scheduler. Structural edits take the topology write lock, apply the change
//! and settle metadata before returning, so every edit either fails with a
//! [`GraphError`] or leaves all reachable slots with up-to-date metadata.
//! Reads take the read lock only long enough to resolve the producing
//! operator.

use super::snapshot::GraphSnapshot;
use super::topology::Topology;
use crate::config::EngineConfig;
use crate::core::error::{ExecutionResult, GraphError, GraphResult, OperatorId, SlotId};
use crate::core::operator::Operator;
use crate::core::roi::Roi;
use crate::core::types::ArrayMeta;
use crate::execution::request::{ReadRequest, RequestHandle};
use crate::execution::scheduler::{Scheduler, SchedulerStats};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Callback invoked with a slot and its dirty region (`None` = whole slot).
pub type DirtyCallback = Arc<dyn Fn(SlotId, Option<&Roi>) + Send + Sync>;

/// Identifies one dirty-notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

struct Subscriber {
    id: SubscriptionId,
    slot: SlotId,
    callback: DirtyCallback,
}

struct GraphInner {
    topology: RwLock<Topology>,
    scheduler: Scheduler,
    config: EngineConfig,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicUsize,
}

/// Handle to an operator graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

/// Non-owning graph handle held by queued work.
#[derive(Clone)]
pub(crate) struct WeakGraph {
    inner: Weak<GraphInner>,
}

impl WeakGraph {
    pub(crate) fn upgrade(&self) -> Option<Graph> {
        self.inner.upgrade().map(|inner| Graph { inner })
    }
}

impl Graph {
    /// Create a graph with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a graph whose scheduler runs `num_workers` threads.
    pub fn with_workers(num_workers: usize) -> Self {
        Self::with_config(EngineConfig::default().with_num_workers(num_workers))
    }

    /// Create a graph from `config`, starting its worker threads.
    pub fn with_config(config: EngineConfig) -> Self {
        let scheduler = Scheduler::new(config.num_workers, config.poll_interval());
        Self {
            inner: Arc::new(GraphInner {
                topology: RwLock::new(Topology::new()),
                scheduler,
                config,
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicUsize::new(0),
            }),
        }
    }

    /// Configuration the graph was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The scheduler running this graph's requests.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub(crate) fn downgrade(&self) -> WeakGraph {
        WeakGraph {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Stop the scheduler; pending requests fail with `Cancelled`.
    pub fn finalize(&self) {
        self.inner.scheduler.finalize();
    }

    /// Schedule an arbitrary future on this graph's workers.
    pub fn put_task<F, T>(&self, future: F) -> RequestHandle<T>
    where
        F: Future<Output = ExecutionResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.scheduler.put_task(future)
    }

    /// Apply a structural edit and settle metadata.
    fn edit<R>(&self, f: impl FnOnce(&mut Topology) -> GraphResult<R>) -> GraphResult<R> {
        let mut topology = self.inner.topology.write();
        let result = f(&mut topology);
        let flushed = topology.flush();
        let value = result?;
        flushed?;
        Ok(value)
    }

    // ========================================================================
    // Operators
    // ========================================================================

    /// Add an operator and run its setup.
    ///
    /// A failing setup is logged and leaves the operator's outputs not
    /// ready; use [`Graph::try_add_operator`] to get the error instead.
    pub fn add_operator<O: Operator + 'static>(&self, operator: O) -> OperatorId {
        self.add_shared(Arc::new(operator))
    }

    /// Add an already shared operator instance.
    pub fn add_shared(&self, operator: Arc<dyn Operator>) -> OperatorId {
        let mut topology = self.inner.topology.write();
        let id = topology.add_operator(operator, None);
        if let Err(err) = topology.flush() {
            log::warn!("setup of new operator {} failed: {}", id, err);
        }
        id
    }

    /// Add an operator, failing if its setup does.
    ///
    /// On failure the operator is removed again and the graph is unchanged.
    pub fn try_add_operator<O: Operator + 'static>(&self, operator: O) -> GraphResult<OperatorId> {
        let mut topology = self.inner.topology.write();
        let id = topology.add_operator(Arc::new(operator), None);
        if let Err(err) = topology.flush() {
            topology.remove_operator(id)?;
            topology.flush()?;
            return Err(err);
        }
        Ok(id)
    }

    /// Remove an operator, disconnecting its consumers and tearing down lanes.
    pub fn remove_operator(&self, operator: OperatorId) -> GraphResult<()> {
        self.edit(|t| t.remove_operator(operator))
    }

    /// Re-run an operator's setup, e.g. after changing its configuration.
    pub fn refresh(&self, operator: OperatorId) -> GraphResult<()> {
        self.edit(|t| {
            let lanes = t.op(operator)?.lanes.clone();
            t.pending_setup.insert(operator);
            t.pending_setup.extend(lanes.into_iter().flatten());
            Ok(())
        })
    }

    pub fn operator_name(&self, operator: OperatorId) -> GraphResult<String> {
        Ok(self.inner.topology.read().op(operator)?.name.clone())
    }

    pub fn operator_count(&self) -> usize {
        self.inner.topology.read().operator_ids().count()
    }

    /// Lane operators of a wrapped operator; empty when not wrapped.
    pub fn lanes(&self, operator: OperatorId) -> GraphResult<Vec<OperatorId>> {
        Ok(self
            .inner
            .topology
            .read()
            .op(operator)?
            .lanes
            .clone()
            .unwrap_or_default())
    }

    pub fn is_wrapped(&self, operator: OperatorId) -> GraphResult<bool> {
        Ok(self.inner.topology.read().op(operator)?.is_wrapper())
    }

    /// Borrow the concrete operator instance, if it has type `T`.
    pub fn with_operator<T, R>(&self, operator: OperatorId, f: impl FnOnce(&T) -> R) -> GraphResult<Option<R>>
    where
        T: Operator + 'static,
    {
        let instance = Arc::clone(&self.inner.topology.read().op(operator)?.instance);
        Ok((*instance).as_any().downcast_ref::<T>().map(f))
    }

    // ========================================================================
    // Slots
    // ========================================================================

    pub fn input(&self, operator: OperatorId, name: &str) -> GraphResult<SlotId> {
        self.inner.topology.read().input(operator, name)
    }

    pub fn output(&self, operator: OperatorId, name: &str) -> GraphResult<SlotId> {
        self.inner.topology.read().output(operator, name)
    }

    /// The `index`-th sub-slot of a multi-slot.
    pub fn subslot(&self, slot: SlotId, index: usize) -> GraphResult<SlotId> {
        self.inner.topology.read().subslot(slot, index)
    }

    /// Number of sub-slots.
    pub fn len(&self, slot: SlotId) -> GraphResult<usize> {
        Ok(self.inner.topology.read().slot(slot)?.subslots.len())
    }

    pub fn level(&self, slot: SlotId) -> GraphResult<usize> {
        Ok(self.inner.topology.read().slot(slot)?.level)
    }

    /// Resolved metadata; `None` while the slot is not ready.
    pub fn meta(&self, slot: SlotId) -> GraphResult<Option<ArrayMeta>> {
        Ok(self.inner.topology.read().slot(slot)?.meta.clone())
    }

    pub fn is_ready(&self, slot: SlotId) -> GraphResult<bool> {
        Ok(self.meta(slot)?.is_some())
    }

    /// Upstream slot of a connected slot.
    pub fn partner(&self, slot: SlotId) -> GraphResult<Option<SlotId>> {
        Ok(self.inner.topology.read().slot(slot)?.partner)
    }

    /// `operator.slot[i]` label for logs and error messages.
    pub fn label(&self, slot: SlotId) -> String {
        self.inner.topology.read().label(slot)
    }

    /// Connect `input` to read from `upstream`.
    pub fn connect(&self, input: SlotId, upstream: SlotId) -> GraphResult<()> {
        log::debug!("connect {} <- {}", self.label(input), self.label(upstream));
        self.edit(|t| t.connect(input, upstream))
    }

    pub fn disconnect(&self, input: SlotId) -> GraphResult<()> {
        log::debug!("disconnect {}", self.label(input));
        self.edit(|t| t.disconnect(input))
    }

    /// Set the number of sub-slots of a multi-slot.
    pub fn resize(&self, slot: SlotId, len: usize) -> GraphResult<()> {
        self.edit(|t| t.resize(slot, len))
    }

    /// Insert a sub-slot at `index`, shifting later ones.
    pub fn insert_slot(&self, slot: SlotId, index: usize) -> GraphResult<SlotId> {
        self.edit(|t| t.insert_slot(slot, index))
    }

    pub fn append_slot(&self, slot: SlotId) -> GraphResult<SlotId> {
        self.edit(|t| {
            let len = t.slot(slot)?.subslots.len();
            t.insert_slot(slot, len)
        })
    }

    /// Remove the sub-slot at `index`.
    pub fn remove_slot(&self, slot: SlotId, index: usize) -> GraphResult<()> {
        self.edit(|t| t.remove_slot(slot, index))
    }

    /// Remove the last sub-slot.
    pub fn pop_slot(&self, slot: SlotId) -> GraphResult<()> {
        self.edit(|t| {
            let len = t.slot(slot)?.subslots.len();
            match len.checked_sub(1) {
                Some(last) => t.remove_slot(slot, last),
                None => Err(GraphError::LaneOutOfRange {
                    slot: t.label(slot),
                    index: 0,
                    len: 0,
                }),
            }
        })
    }

    // ========================================================================
    // Dirtiness
    // ========================================================================

    /// Mark a region of a slot dirty and propagate downstream.
    ///
    /// `None` marks the whole slot. Subscribers run on the calling thread
    /// after propagation, without any graph lock held.
    pub fn set_dirty(&self, slot: SlotId, roi: Option<Roi>) -> GraphResult<()> {
        let reached = {
            let topology = self.inner.topology.read();
            if let (Some(roi), Some(meta)) = (&roi, &topology.slot(slot)?.meta) {
                roi.check_within(&meta.shape)?;
            }
            topology.dirty_walk(slot, roi)?
        };
        log::trace!("dirty notification reached {} slots", reached.len());
        self.notify_subscribers(&reached);
        Ok(())
    }

    /// Freeze or thaw an operator's outputs.
    ///
    /// While fixed, an operator that supports it (such as
    /// [`BlockwiseCache`](crate::execution::cache::BlockwiseCache)) keeps
    /// serving what it has and holds back dirty notifications. Thawing
    /// releases them downstream in one go. Wrapped operators apply this to
    /// every lane.
    pub fn set_fixed(&self, operator: OperatorId, fixed: bool) -> GraphResult<()> {
        let reached = self.inner.topology.read().set_fixed(operator, fixed)?;
        log::debug!(
            "operator {} {}, {} slots dirtied",
            operator,
            if fixed { "fixed" } else { "released" },
            reached.len()
        );
        self.notify_subscribers(&reached);
        Ok(())
    }

    fn notify_subscribers(&self, reached: &[(SlotId, Option<Roi>)]) {
        let callbacks: Vec<(SlotId, DirtyCallback)> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.slot, Arc::clone(&s.callback)))
            .collect();
        if callbacks.is_empty() {
            return;
        }
        for (slot, roi) in reached {
            for (watched, callback) in &callbacks {
                if watched == slot {
                    callback(*slot, roi.as_ref());
                }
            }
        }
    }

    /// Observe dirty notifications reaching `slot`.
    pub fn subscribe_dirty<F>(&self, slot: SlotId, callback: F) -> GraphResult<SubscriptionId>
    where
        F: Fn(SlotId, Option<&Roi>) + Send + Sync + 'static,
    {
        self.inner.topology.read().slot(slot)?;
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push(Subscriber {
            id,
            slot,
            callback: Arc::new(callback),
        });
        Ok(id)
    }

    /// Drop a subscription; returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Build a request for `roi` of `slot`.
    ///
    /// Fails immediately if the slot is disconnected, not ready, or the ROI
    /// does not fit its shape.
    pub fn read(&self, slot: SlotId, roi: Roi) -> GraphResult<ReadRequest> {
        let target = self.inner.topology.read().resolve_output(slot)?;
        roi.check_within(&target.meta.shape)?;
        Ok(ReadRequest::new(self.clone(), target, roi))
    }

    /// Build a request for the whole of `slot`.
    pub fn read_all(&self, slot: SlotId) -> GraphResult<ReadRequest> {
        let target = self.inner.topology.read().resolve_output(slot)?;
        let roi = target.meta.full_roi();
        Ok(ReadRequest::new(self.clone(), target, roi))
    }

    /// Serializable description of the current structure.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.inner.topology.read().snapshot()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("operators", &self.operator_count())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{ExecutionContext, SetupContext};
    use crate::core::error::ExecutionError;
    use crate::core::operator::OperatorMetadata;
    use crate::core::slot::SlotDefinition;
    use crate::core::types::{ArrayBuffer, DType};
    use crate::operators::{ArraySource, LaneSource, Piper};
    use async_trait::async_trait;
    use ndarray::{ArrayD, IxDyn};

    fn ramp(shape: &[usize]) -> ArrayD<u32> {
        let len: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len as u32).collect()).unwrap()
    }

    /// Refuses every setup.
    struct Uncalibrated;

    #[async_trait]
    impl Operator for Uncalibrated {
        fn metadata(&self) -> OperatorMetadata {
            OperatorMetadata::builder("Uncalibrated")
                .output(SlotDefinition::output("Output"))
                .build()
        }

        fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()> {
            Err(ctx.error("no calibration loaded"))
        }

        async fn execute(&self, _ctx: &ExecutionContext, _result: &mut ArrayBuffer) -> ExecutionResult<()> {
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn Operator> {
            Box::new(Uncalibrated)
        }
    }

    #[test]
    fn test_read_through_pipeline() {
        let graph = Graph::with_workers(2);
        let src = graph.add_operator(ArraySource::new(ramp(&[4, 6])));
        let pipe = graph.add_operator(Piper::new());
        graph
            .connect(graph.input(pipe, "Input").unwrap(), graph.output(src, "Output").unwrap())
            .unwrap();

        let out = graph.output(pipe, "Output").unwrap();
        assert_eq!(graph.meta(out).unwrap(), Some(ArrayMeta::new(vec![4, 6], DType::U32)));

        let roi = Roi::new(vec![1, 2], vec![3, 5]).unwrap();
        let data = graph.read(out, roi).unwrap().wait().unwrap();
        let array = data.into_array::<u32>().unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array[[0, 0]], 8);
        assert_eq!(array[[1, 2]], 16);
    }

    #[test]
    fn test_read_disconnected_fails_synchronously() {
        let graph = Graph::with_workers(1);
        let pipe = graph.add_operator(Piper::new());
        let out = graph.output(pipe, "Output").unwrap();
        assert!(matches!(
            graph.read(graph.input(pipe, "Input").unwrap(), Roi::from_shape(&[1])),
            Err(GraphError::Disconnected { .. })
        ));
        assert!(matches!(
            graph.read(out, Roi::from_shape(&[1])),
            Err(GraphError::NotReady { .. })
        ));
    }

    #[test]
    fn test_read_out_of_bounds() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ramp(&[4])));
        let out = graph.output(src, "Output").unwrap();
        assert!(matches!(
            graph.read(out, Roi::new(vec![2], vec![9]).unwrap()),
            Err(GraphError::InvalidRoi(_))
        ));
    }

    #[test]
    fn test_read_all_zero_workers() {
        let graph = Graph::with_workers(0);
        let src = graph.add_operator(ArraySource::new(ramp(&[3])));
        let out = graph.output(src, "Output").unwrap();
        let data = graph.read_all(out).unwrap().wait().unwrap();
        assert_eq!(data.into_array::<u32>().unwrap().as_slice(), Some(&[0, 1, 2][..]));
    }

    #[test]
    fn test_write_into_checks_shape() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ramp(&[4])));
        let out = graph.output(src, "Output").unwrap();
        let request = graph.read(out, Roi::new(vec![0], vec![2]).unwrap()).unwrap();
        let wrong = crate::core::types::ArrayBuffer::zeros(DType::U32, &[3]);
        assert!(matches!(
            request.write_into(wrong).wait(),
            Err(ExecutionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dtype_mismatch_on_connect() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ArrayD::<f64>::zeros(vec![2])));
        let picky = graph.add_operator(Piper::accepting(vec![DType::U8]));
        let result = graph.connect(
            graph.input(picky, "Input").unwrap(),
            graph.output(src, "Output").unwrap(),
        );
        assert!(matches!(result, Err(GraphError::DTypeMismatch { got: DType::F64, .. })));
    }

    #[test]
    fn test_subscribe_dirty() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ramp(&[10])));
        let pipe = graph.add_operator(Piper::new());
        let src_out = graph.output(src, "Output").unwrap();
        graph.connect(graph.input(pipe, "Input").unwrap(), src_out).unwrap();
        let out = graph.output(pipe, "Output").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = graph
            .subscribe_dirty(out, move |_, roi| sink.lock().push(roi.cloned()))
            .unwrap();

        let roi = Roi::new(vec![3], vec![5]).unwrap();
        graph.set_dirty(src_out, Some(roi.clone())).unwrap();
        assert_eq!(*seen.lock(), vec![Some(roi)]);

        assert!(graph.unsubscribe(id));
        graph.set_dirty(src_out, None).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_wrapped_lanes_follow_source() {
        let graph = Graph::with_workers(2);
        let src = graph.add_operator(LaneSource::new(ramp(&[2, 2])));
        let pipe = graph.add_operator(Piper::new());
        let src_out = graph.output(src, "Output").unwrap();
        graph.resize(src_out, 2).unwrap();
        graph.connect(graph.input(pipe, "Input").unwrap(), src_out).unwrap();

        assert!(graph.is_wrapped(pipe).unwrap());
        assert_eq!(graph.lanes(pipe).unwrap().len(), 2);

        graph.append_slot(src_out).unwrap();
        assert_eq!(graph.lanes(pipe).unwrap().len(), 3);
        graph.pop_slot(src_out).unwrap();
        graph.pop_slot(src_out).unwrap();
        assert_eq!(graph.lanes(pipe).unwrap().len(), 1);

        let out = graph.output(pipe, "Output").unwrap();
        assert_eq!(graph.len(out).unwrap(), 1);
        let lane = graph.subslot(out, 0).unwrap();
        let data = graph.read_all(lane).unwrap().wait().unwrap();
        assert_eq!(data.shape(), &[2, 2]);

        graph.disconnect(graph.input(pipe, "Input").unwrap()).unwrap();
        assert!(!graph.is_wrapped(pipe).unwrap());
        assert!(graph.lanes(pipe).unwrap().is_empty());
    }

    #[test]
    fn test_remove_operator_disconnects_consumers() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ramp(&[2])));
        let pipe = graph.add_operator(Piper::new());
        let pipe_in = graph.input(pipe, "Input").unwrap();
        graph.connect(pipe_in, graph.output(src, "Output").unwrap()).unwrap();

        graph.remove_operator(src).unwrap();
        assert_eq!(graph.partner(pipe_in).unwrap(), None);
        assert_eq!(graph.meta(graph.output(pipe, "Output").unwrap()).unwrap(), None);
        assert!(matches!(graph.operator_name(src), Err(GraphError::OperatorNotFound(_))));
        assert_eq!(graph.operator_count(), 1);
    }

    #[test]
    fn test_try_add_operator_reports_setup_failure() {
        let graph = Graph::with_workers(1);
        graph.add_operator(ArraySource::new(ramp(&[2])));

        let err = graph.try_add_operator(Uncalibrated).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Setup { ref operator, ref reason }
                if operator == "Uncalibrated" && reason.contains("calibration")
        ));
        assert_eq!(graph.operator_count(), 1);

        assert!(graph.try_add_operator(Piper::new()).is_ok());
        assert_eq!(graph.operator_count(), 2);
    }

    #[test]
    fn test_set_fixed_without_support_is_noop() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ramp(&[4])));
        let out = graph.output(src, "Output").unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&seen);
        graph
            .subscribe_dirty(out, move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        graph.set_fixed(src, true).unwrap();
        graph.set_fixed(src, false).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(graph.set_fixed(OperatorId(99), true).is_err());
    }

    #[test]
    fn test_dropped_graph_cancels_queued_read() {
        let graph = Graph::with_workers(0);
        let src = graph.add_operator(ArraySource::new(ramp(&[4])));
        let handle = graph.read_all(graph.output(src, "Output").unwrap()).unwrap().submit();

        let inner = Arc::downgrade(&graph.inner);
        drop(graph);
        assert!(inner.upgrade().is_none());
        assert_eq!(handle.wait(), Err(ExecutionError::Cancelled));
    }

    #[test]
    fn test_with_operator_downcasts() {
        let graph = Graph::with_workers(1);
        let src = graph.add_operator(ArraySource::new(ramp(&[2])));
        assert_eq!(graph.with_operator::<ArraySource, _>(src, |s| s.read_count()).unwrap(), Some(0));
        assert_eq!(graph.with_operator::<Piper, _>(src, |_| ()).unwrap(), None);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let graph = Graph::with_workers(1);
        graph.add_operator(ArraySource::new(ramp(&[2])));
        let snapshot = graph.snapshot();
        let json = snapshot.to_json_compact().unwrap();
        assert_eq!(GraphSnapshot::from_json(&json).unwrap(), snapshot);
    }
}
