use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tessera_core::{
    ContextId, Domain, DomainPoint, Event, FieldMask, LogicalRegion, RegionRequirement, TraceId,
};
use tracing::{debug, info};

use crate::{
    RuntimeError,
    context::TaskContext,
    operation::{ArcOp, OpCore, OpKind, OperationLike, launch_operation},
    runtime::Runtime,
    trace::Trace,
};

// FENCE OP
// ================================================================================================

/// Whether a fence orders only mapping or full execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceKind {
    Mapping,
    Execution,
}

/// A barrier in the dependence pipeline: every earlier child must reach the
/// fenced stage before the fence maps, and every later child depends on the
/// fence.
pub struct FenceOp {
    core: OpCore,
    fence_kind: FenceKind,
}

impl FenceOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        fence_kind: FenceKind,
    ) -> Result<ArcOp, RuntimeError> {
        let op: ArcOp = Arc::new(Self { core: OpCore::new(rt, ctx, Vec::new()), fence_kind });
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for FenceOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Fence
    }

    fn logging_name(&self) -> &'static str {
        "Fence"
    }

    fn trigger_dependence_analysis(&self, rt: &Arc<Runtime>) {
        let ctx = rt.find_context(self.core.parent_ctx()).expect("parent context retired");
        let op = self.core.op();
        ctx.perform_fence_analysis(&op, self.fence_kind == FenceKind::Execution);
        ctx.update_current_fence(&op);
    }
}

// FRAME OP
// ================================================================================================

/// Marks the boundary of a frame of independent work; the context throttles
/// the number of outstanding frames.
pub struct FrameOp {
    core: OpCore,
}

impl FrameOp {
    pub fn launch(rt: &Arc<Runtime>, ctx_id: ContextId) -> Result<ArcOp, RuntimeError> {
        let ctx = rt.find_context(ctx_id).ok_or(RuntimeError::UnknownContext(ctx_id))?;
        let op: ArcOp = Arc::new(Self { core: OpCore::new(rt, ctx_id, Vec::new()) });
        // admission happens on the issuing thread, before the frame enters
        // the pipeline
        ctx.issue_frame(op.core().completion_event())?;
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for FrameOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Frame
    }

    fn logging_name(&self) -> &'static str {
        "Frame"
    }

    fn trigger_dependence_analysis(&self, rt: &Arc<Runtime>) {
        let ctx = rt.find_context(self.core.parent_ctx()).expect("parent context retired");
        let op = self.core.op();
        ctx.perform_fence_analysis(&op, true);
        ctx.update_current_fence(&op);
    }

    fn trigger_complete(&self, rt: &Arc<Runtime>) {
        let ctx = rt.find_context(self.core.parent_ctx()).expect("parent context retired");
        ctx.finish_frame();
        self.core.finalize_complete(rt);
    }
}

// TRACE MARKERS
// ================================================================================================

/// Closes a trace's capture pass; fence-like in the dependence pipeline.
pub struct TraceCaptureOp {
    core: OpCore,
    trace: Arc<Trace>,
}

impl TraceCaptureOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        trace: Arc<Trace>,
    ) -> Result<ArcOp, RuntimeError> {
        let op: ArcOp = Arc::new(Self { core: OpCore::new(rt, ctx, Vec::new()), trace });
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for TraceCaptureOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::TraceCapture
    }

    fn logging_name(&self) -> &'static str {
        "TraceCapture"
    }

    fn trigger_dependence_analysis(&self, rt: &Arc<Runtime>) {
        info!(target: "tessera::trace", tid = %self.trace.trace_id(), "trace capture boundary");
        let ctx = rt.find_context(self.core.parent_ctx()).expect("parent context retired");
        let op = self.core.op();
        ctx.perform_fence_analysis(&op, false);
        ctx.update_current_fence(&op);
        self.trace.end_trace_capture();
        self.trace.fix_trace();
    }
}

/// Closes one replay pass of a fixed trace.
pub struct TraceCompleteOp {
    core: OpCore,
    trace: Arc<Trace>,
}

impl TraceCompleteOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        trace: Arc<Trace>,
    ) -> Result<ArcOp, RuntimeError> {
        let op: ArcOp = Arc::new(Self { core: OpCore::new(rt, ctx, Vec::new()), trace });
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for TraceCompleteOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::TraceComplete
    }

    fn logging_name(&self) -> &'static str {
        "TraceComplete"
    }

    fn trigger_dependence_analysis(&self, rt: &Arc<Runtime>) {
        info!(target: "tessera::trace", tid = %self.trace.trace_id(), "trace replay boundary");
        let ctx = rt.find_context(self.core.parent_ctx()).expect("parent context retired");
        let op = self.core.op();
        ctx.perform_fence_analysis(&op, false);
        ctx.update_current_fence(&op);
        self.trace.end_trace_execution();
    }
}

// COPY OP
// ================================================================================================

/// The data movement a copy performs when it maps, expressed as a transfer
/// through the DMA pipeline.
#[derive(Clone, Debug)]
pub struct CopyPayload {
    pub src_mem: tessera_core::MemoryHandle,
    pub dst_mem: tessera_core::MemoryHandle,
    pub src_iter: tessera_transfer::IteratorDesc,
    pub dst_iter: tessera_transfer::IteratorDesc,
    pub kind: tessera_transfer::XferKind,
}

/// An explicit region-to-region copy.
pub struct CopyOp {
    core: OpCore,
    payload: Option<CopyPayload>,
}

impl CopyOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        regions: Vec<RegionRequirement>,
        payload: Option<CopyPayload>,
    ) -> Result<ArcOp, RuntimeError> {
        let op: ArcOp = Arc::new(Self { core: OpCore::new(rt, ctx, regions), payload });
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for CopyOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Copy
    }

    fn logging_name(&self) -> &'static str {
        "Copy"
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        match &self.payload {
            Some(payload) => {
                // mapping produced a transfer; the copy completes when the
                // descriptor chain drains
                let queue = rt.xfer_queue();
                let guid = queue.allocate_guid();
                let fence = queue
                    .create_xfer_des(
                        guid,
                        tessera_transfer::XferDesSpec {
                            target_node: guid.node(),
                            pre_xd_guid: tessera_core::XferDesId::NO_GUID,
                            next_xd_guid: tessera_core::XferDesId::NO_GUID,
                            next_max_rw_gap: 0,
                            src_ib_offset: 0,
                            src_ib_size: 0,
                            mark_started: true,
                            src_mem: payload.src_mem,
                            dst_mem: payload.dst_mem,
                            src_iter: payload.src_iter.clone(),
                            dst_iter: payload.dst_iter.clone(),
                            max_req_size: tessera_transfer::DEFAULT_MAX_REQ_SIZE,
                            max_nr: tessera_transfer::DEFAULT_MAX_NR,
                            priority: 0,
                            order: tessera_transfer::XferOrder::SrcFifo,
                            kind: payload.kind,
                        },
                    )
                    .expect("copy transfer rejected by the DMA system");
                self.core.complete_execution(rt, fence);
            },
            None => self.core.complete_execution(rt, Event::NO_EVENT),
        }
    }
}

// FILL OP
// ================================================================================================

/// Fills a region's fields with a replicated value.
pub struct FillOp {
    core: OpCore,
    value: Vec<u8>,
}

impl FillOp {
    /// Builds a fill without launching it, so callers may attach extra
    /// mapping preconditions first.
    pub fn new(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        regions: Vec<RegionRequirement>,
        value: Vec<u8>,
    ) -> Self {
        Self { core: OpCore::new(rt, ctx, regions), value }
    }

    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        regions: Vec<RegionRequirement>,
        value: Vec<u8>,
    ) -> Result<ArcOp, RuntimeError> {
        let op: ArcOp = Arc::new(Self::new(rt, ctx, regions, value));
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl OperationLike for FillOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Fill
    }

    fn logging_name(&self) -> &'static str {
        "Fill"
    }
}

// DELETION OP
// ================================================================================================

/// What a deletion destroys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionTarget {
    IndexSpace(u64),
    FieldSpace(u32),
    Fields { field_space: u32, fields: FieldMask },
    Region(LogicalRegion),
}

/// Destroys a resource in the region tree once all users are done.
pub struct DeletionOp {
    core: OpCore,
    target: DeletionTarget,
}

impl DeletionOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        target: DeletionTarget,
    ) -> Result<ArcOp, RuntimeError> {
        let op: ArcOp = Arc::new(Self { core: OpCore::new(rt, ctx, Vec::new()), target });
        launch_operation(rt, op.clone(), Event::NO_EVENT)?;
        Ok(op)
    }

    pub fn target(&self) -> &DeletionTarget {
        &self.target
    }

    /// Applies the destructive mutation to the region tree.
    pub fn perform_deletion(&self, rt: &Arc<Runtime>) {
        debug!(target: "tessera::ctx", uid = %self.core.unique_id(), target = ?self.target,
            "performing deletion");
        match &self.target {
            DeletionTarget::IndexSpace(space) => rt.forest().destroy_index_space(*space),
            DeletionTarget::FieldSpace(space) => rt.forest().destroy_field_space(*space),
            DeletionTarget::Fields { field_space, fields } => {
                rt.forest().free_fields(*field_space, *fields)
            },
            DeletionTarget::Region(region) => rt.forest().destroy_region(*region),
        }
    }
}

impl OperationLike for DeletionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Deletion
    }

    fn logging_name(&self) -> &'static str {
        "Deletion"
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        self.perform_deletion(rt);
        self.core.complete_execution(rt, Event::NO_EVENT);
    }
}

// TIMING OP
// ================================================================================================

/// The resolution of a timing measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingKind {
    Seconds,
    MicroSeconds,
    NanoSeconds,
}

/// Measures the current time after its preconditions are met.
pub struct TimingOp {
    core: OpCore,
    measurement: TimingKind,
    preconditions: Vec<Event>,
    result: Mutex<Option<i64>>,
}

impl TimingOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        measurement: TimingKind,
        preconditions: Vec<Event>,
    ) -> Result<Arc<TimingOp>, RuntimeError> {
        let timing = Arc::new(Self {
            core: OpCore::new(rt, ctx, Vec::new()),
            measurement,
            preconditions,
            result: Mutex::new(None),
        });
        let op: ArcOp = timing.clone();
        launch_operation(rt, op, Event::NO_EVENT)?;
        Ok(timing)
    }

    pub fn measure_now(&self) -> i64 {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        match self.measurement {
            TimingKind::Seconds => elapsed.as_secs() as i64,
            TimingKind::MicroSeconds => elapsed.as_micros() as i64,
            TimingKind::NanoSeconds => elapsed.as_nanos() as i64,
        }
    }

    pub fn set_result(&self, value: i64) {
        *self.result.lock() = Some(value);
    }

    /// The measured value; present once the operation has completed.
    pub fn result(&self) -> Option<i64> {
        *self.result.lock()
    }
}

impl OperationLike for TimingOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Timing
    }

    fn logging_name(&self) -> &'static str {
        "Timing"
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let wait_on = Event::merge(&self.preconditions);
        self.core.complete_mapping(rt, wait_on);
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        self.set_result(self.measure_now());
        self.core.complete_execution(rt, Event::NO_EVENT);
    }
}

// TASK OP
// ================================================================================================

type TaskBody = Box<dyn FnOnce(&Arc<Runtime>, &Arc<dyn TaskContext>) + Send>;

/// An individual task: runs a body inside a fresh child context and
/// completes when all of the children the body launched complete.
pub struct TaskOp {
    core: OpCore,
    task_name: &'static str,
    leaf: bool,
    body: Mutex<Option<TaskBody>>,
    child_ctx: Mutex<Option<Arc<dyn TaskContext>>>,
}

impl TaskOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        task_name: &'static str,
        regions: Vec<RegionRequirement>,
        leaf: bool,
        body: impl FnOnce(&Arc<Runtime>, &Arc<dyn TaskContext>) + Send + 'static,
    ) -> Result<Arc<TaskOp>, RuntimeError> {
        let task = Arc::new(Self {
            core: OpCore::new(rt, ctx, regions),
            task_name,
            leaf,
            body: Mutex::new(Some(Box::new(body))),
            child_ctx: Mutex::new(None),
        });
        let op: ArcOp = task.clone();
        launch_operation(rt, op, Event::NO_EVENT)?;
        Ok(task)
    }

    pub fn child_context(&self) -> Option<Arc<dyn TaskContext>> {
        self.child_ctx.lock().clone()
    }
}

impl OperationLike for TaskOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Task
    }

    fn logging_name(&self) -> &'static str {
        self.task_name
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let parent = rt.find_context(self.core.parent_ctx()).expect("parent context retired");
        let child = if self.leaf {
            rt.create_leaf_context(
                self.core.unique_id(),
                self.task_name.to_string(),
                parent.depth() + 1,
                Some(parent.context_id()),
            )
        } else {
            rt.create_inner_context(
                self.core.unique_id(),
                self.task_name.to_string(),
                parent.depth() + 1,
                Some(parent.context_id()),
            )
        };
        *self.child_ctx.lock() = Some(child.clone());

        let body = self.body.lock().take().expect("task body executed twice");
        body(rt, &child);
        child.end_task();
        self.core.complete_execution(rt, Event::NO_EVENT);
    }

    fn trigger_complete(&self, rt: &Arc<Runtime>) {
        // completion waits for every child the body launched
        let wait_on = self
            .child_ctx
            .lock()
            .as_ref()
            .map(|ctx| ctx.children_complete_event())
            .unwrap_or(Event::NO_EVENT);
        let op = self.core.op();
        let rt = Arc::clone(rt);
        wait_on.add_waiter(Box::new(move |_poisoned: bool| {
            op.core().finalize_complete(&rt);
        }));
    }

    fn trigger_commit(&self, rt: &Arc<Runtime>) {
        let wait_on = self
            .child_ctx
            .lock()
            .as_ref()
            .map(|ctx| ctx.children_committed_event())
            .unwrap_or(Event::NO_EVENT);
        let op = self.core.op();
        let rt = Arc::clone(rt);
        wait_on.add_waiter(Box::new(move |_poisoned: bool| {
            op.core().finalize_commit(&rt);
        }));
    }
}

// INDEX TASK OP
// ================================================================================================

type PointTask = Arc<dyn Fn(DomainPoint) -> Vec<u8> + Send + Sync>;

/// An index task: one point task per element of a launch domain, producing
/// a future map (or a folded reduction value).
pub struct IndexTaskOp {
    core: OpCore,
    task_name: &'static str,
    domain: Domain,
    point_task: PointTask,
    /// Restricted point set; `None` executes the whole domain. Control
    /// replication restricts each shard to the points it owns.
    points_override: Mutex<Option<Vec<DomainPoint>>>,
    future_map: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl IndexTaskOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        task_name: &'static str,
        regions: Vec<RegionRequirement>,
        domain: Domain,
        point_task: PointTask,
    ) -> Result<Arc<IndexTaskOp>, RuntimeError> {
        let task = Arc::new(Self::new(rt, ctx, task_name, regions, domain, point_task));
        let op: ArcOp = task.clone();
        launch_operation(rt, op, Event::NO_EVENT)?;
        Ok(task)
    }

    pub fn new(
        rt: &Arc<Runtime>,
        ctx: ContextId,
        task_name: &'static str,
        regions: Vec<RegionRequirement>,
        domain: Domain,
        point_task: PointTask,
    ) -> Self {
        Self {
            core: OpCore::new(rt, ctx, regions),
            task_name,
            domain,
            point_task,
            points_override: Mutex::new(None),
            future_map: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Restricts execution to the given points.
    pub fn restrict_points(&self, points: Vec<DomainPoint>) {
        *self.points_override.lock() = Some(points);
    }

    /// Runs the point tasks for this operation's point set, recording their
    /// results in the future map.
    pub fn execute_points(&self) {
        let points = self
            .points_override
            .lock()
            .clone()
            .unwrap_or_else(|| self.domain.points().collect());
        let mut future_map = self.future_map.lock();
        for point in points {
            let value = (self.point_task)(point);
            future_map.insert(self.domain.linearize(&point), value);
        }
    }

    /// Merges externally produced point results (e.g. from other shards).
    pub fn merge_results(&self, results: impl IntoIterator<Item = (u64, Vec<u8>)>) {
        let mut future_map = self.future_map.lock();
        for (linear, value) in results {
            future_map.insert(linear, value);
        }
    }

    /// Snapshot of the future map keyed by linearized point.
    pub fn future_map(&self) -> BTreeMap<u64, Vec<u8>> {
        self.future_map.lock().clone()
    }
}

impl OperationLike for IndexTaskOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::IndexTask
    }

    fn logging_name(&self) -> &'static str {
        self.task_name
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        self.execute_points();
        self.core.complete_execution(rt, Event::NO_EVENT);
    }
}

// TRACE HELPERS
// ================================================================================================

/// Begins a trace in a context.
pub fn begin_trace(rt: &Arc<Runtime>, ctx: ContextId, tid: TraceId) -> Result<(), RuntimeError> {
    let ctx = rt.find_context(ctx).ok_or(RuntimeError::UnknownContext(ctx))?;
    ctx.begin_trace(rt, tid)
}

/// Ends a trace in a context, issuing the appropriate boundary marker.
pub fn end_trace(rt: &Arc<Runtime>, ctx: ContextId, tid: TraceId) -> Result<(), RuntimeError> {
    let ctx = rt.find_context(ctx).ok_or(RuntimeError::UnknownContext(ctx))?;
    ctx.end_trace(rt, tid)
}
