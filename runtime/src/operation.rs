use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tessera_core::{
    ContextId, DependenceType, Event, FieldMask, RegionRequirement, UniqueId, UserEvent,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};
use tracing::{debug, error, trace};

use crate::runtime::Runtime;

// OP KIND
// ================================================================================================

/// The kind of an operation, used for logging and trace-replay validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Task = 0,
    IndexTask = 1,
    Copy = 2,
    Fill = 3,
    Close = 4,
    Deletion = 5,
    Fence = 6,
    Frame = 7,
    TraceCapture = 8,
    TraceComplete = 9,
    DependentPartition = 10,
    PendingPartition = 11,
    MustEpoch = 12,
    Timing = 13,
}

impl Serializable for OpKind {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(*self as u8);
    }
}

impl Deserializable for OpKind {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(match source.read_u8()? {
            0 => Self::Task,
            1 => Self::IndexTask,
            2 => Self::Copy,
            3 => Self::Fill,
            4 => Self::Close,
            5 => Self::Deletion,
            6 => Self::Fence,
            7 => Self::Frame,
            8 => Self::TraceCapture,
            9 => Self::TraceComplete,
            10 => Self::DependentPartition,
            11 => Self::PendingPartition,
            12 => Self::MustEpoch,
            13 => Self::Timing,
            other => {
                return Err(DeserializationError::InvalidValue(format!(
                    "invalid operation kind {other}"
                )));
            },
        })
    }
}

// OP STATUS
// ================================================================================================

/// The lifecycle state of a child operation as observed by its parent
/// context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    /// Created but not yet registered with the parent.
    Unregistered,
    Executing,
    Executed,
    Complete,
    Committed,
    /// Unregistered before executing (cancelled).
    Gone,
}

// DEPENDENCE EDGE
// ================================================================================================

/// One recorded mapping dependence from this operation on an earlier one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependenceEdge {
    pub target: UniqueId,
    pub dtype: DependenceType,
    /// Region requirement index on the earlier operation, if this was a
    /// region dependence.
    pub target_idx: Option<usize>,
    /// Region requirement index on this operation.
    pub source_idx: Option<usize>,
    pub fields: FieldMask,
}

// OP CORE
// ================================================================================================

const NO_CTX_INDEX: u64 = u64::MAX;

pub(crate) struct OpState {
    pub status: OpStatus,
    pub mapping_preconditions: SmallVec<[Event; 4]>,
    pub dependences: Vec<DependenceEdge>,
    pub poisoned: bool,
    /// The trace this operation was registered under, and whether that
    /// trace was capturing at registration time.
    pub trace: Option<Arc<crate::trace::Trace>>,
    pub tracing_capture: bool,
}

/// Shared bookkeeping embedded in every operation: identity, parent context,
/// region requirements, lifecycle events and the dependence set.
pub struct OpCore {
    uid: UniqueId,
    parent_ctx: ContextId,
    r#gen: u64,
    regions: Vec<RegionRequirement>,
    ctx_index: AtomicU64,
    /// Triggered when the operation has mapped; mapping dependences of later
    /// operations wait on this.
    mapped: UserEvent,
    /// Triggered when the operation and all of its children have completed.
    completion: UserEvent,
    /// Triggered when the operation commits and its slot is freed.
    committed: UserEvent,
    pub(crate) state: Mutex<OpState>,
    self_ref: Mutex<Weak<dyn OperationLike>>,
}

pub type ArcOp = Arc<dyn OperationLike>;

impl OpCore {
    pub fn new(rt: &Runtime, parent_ctx: ContextId, regions: Vec<RegionRequirement>) -> Self {
        Self {
            uid: rt.allocate_unique_id(),
            parent_ctx,
            r#gen: 0,
            regions,
            ctx_index: AtomicU64::new(NO_CTX_INDEX),
            mapped: UserEvent::new(),
            completion: UserEvent::new(),
            committed: UserEvent::new(),
            state: Mutex::new(OpState {
                status: OpStatus::Unregistered,
                mapping_preconditions: SmallVec::new(),
                dependences: Vec::new(),
                poisoned: false,
                trace: None,
                tracing_capture: false,
            }),
            self_ref: Mutex::new(Weak::<crate::ops::FenceOp>::new() as Weak<dyn OperationLike>),
        }
    }

    // PUBLIC ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn unique_id(&self) -> UniqueId {
        self.uid
    }

    pub fn parent_ctx(&self) -> ContextId {
        self.parent_ctx
    }

    pub fn generation(&self) -> u64 {
        self.r#gen
    }

    pub fn regions(&self) -> &[RegionRequirement] {
        &self.regions
    }

    /// The context-local index assigned at registration.
    pub fn ctx_index(&self) -> u64 {
        let index = self.ctx_index.load(Ordering::SeqCst);
        debug_assert_ne!(index, NO_CTX_INDEX, "operation not yet registered");
        index
    }

    pub(crate) fn set_ctx_index(&self, index: u64) {
        self.ctx_index.store(index, Ordering::SeqCst);
    }

    pub fn status(&self) -> OpStatus {
        self.state.lock().status
    }

    pub(crate) fn set_status(&self, status: OpStatus) {
        self.state.lock().status = status;
    }

    pub fn mapped_event(&self) -> Event {
        self.mapped.event()
    }

    pub fn completion_event(&self) -> Event {
        self.completion.event()
    }

    pub fn committed_event(&self) -> Event {
        self.committed.event()
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    /// Snapshot of the dependence edges registered so far.
    pub fn dependences(&self) -> Vec<DependenceEdge> {
        self.state.lock().dependences.clone()
    }

    /// Attaches this operation to an active trace.
    pub fn set_trace(&self, trace: Arc<crate::trace::Trace>, capturing: bool) {
        let mut state = self.state.lock();
        state.trace = Some(trace);
        state.tracing_capture = capturing;
    }

    /// Returns the attached trace and whether it was capturing when this
    /// operation registered.
    pub fn trace_info(&self) -> (Option<Arc<crate::trace::Trace>>, bool) {
        let state = self.state.lock();
        (state.trace.clone(), state.tracing_capture)
    }

    /// The operation embedding this core.
    pub fn op(&self) -> ArcOp {
        self.self_ref.lock().upgrade().expect("operation core outlived its operation")
    }

    pub(crate) fn attach_self(&self, op: &ArcOp) {
        *self.self_ref.lock() = Arc::downgrade(op);
    }

    // DEPENDENCE REGISTRATION
    // --------------------------------------------------------------------------------------------

    /// Registers an unqualified mapping dependence on an earlier operation.
    pub fn register_dependence(&self, target: &ArcOp) {
        if target.core().unique_id() == self.uid {
            return;
        }
        trace!(target: "tessera::ctx", source = %self.uid, dep = %target.core().unique_id(),
            "mapping dependence");
        let mut state = self.state.lock();
        state.mapping_preconditions.push(target.core().mapped_event());
        state.dependences.push(DependenceEdge {
            target: target.core().unique_id(),
            dtype: DependenceType::TrueDependence,
            target_idx: None,
            source_idx: None,
            fields: FieldMask::EMPTY,
        });
    }

    /// Registers a region dependence on an earlier operation.
    pub fn register_region_dependence(
        &self,
        source_idx: usize,
        target: &ArcOp,
        target_idx: usize,
        dtype: DependenceType,
        fields: FieldMask,
    ) {
        trace!(target: "tessera::ctx", source = %self.uid, dep = %target.core().unique_id(),
            source_idx, target_idx, ?dtype, "region dependence");
        let mut state = self.state.lock();
        state.mapping_preconditions.push(target.core().mapped_event());
        state.dependences.push(DependenceEdge {
            target: target.core().unique_id(),
            dtype,
            target_idx: Some(target_idx),
            source_idx: Some(source_idx),
            fields,
        });
    }

    /// Adds a raw event precondition to this operation's mapping.
    pub fn add_mapping_precondition(&self, event: Event) {
        self.state.lock().mapping_preconditions.push(event);
    }

    // STAGE PIPELINE
    // --------------------------------------------------------------------------------------------

    /// Schedules `trigger_mapping` once every registered mapping
    /// precondition has triggered. Called by the context at the end of the
    /// operation's dependence-analysis stage.
    pub fn schedule_mapping(&self, rt: &Arc<Runtime>) {
        let preconditions = core::mem::take(&mut self.state.lock().mapping_preconditions);
        let wait_on = Event::merge(&preconditions);
        let op = self.op();
        let rt = Arc::clone(rt);
        wait_on.add_waiter(Box::new(move |poisoned: bool| {
            if poisoned {
                op.core().handle_poisoned_precondition(&rt);
            } else {
                op.trigger_mapping(&rt);
            }
        }));
    }

    /// Marks this operation mapped once `wait_on` triggers, then moves on to
    /// the execution stage.
    pub fn complete_mapping(&self, rt: &Arc<Runtime>, wait_on: Event) {
        let op = self.op();
        let rt = Arc::clone(rt);
        wait_on.add_waiter(Box::new(move |poisoned: bool| {
            if poisoned {
                op.core().handle_poisoned_precondition(&rt);
                return;
            }
            debug!(target: "tessera::ctx", uid = %op.core().unique_id(),
                name = op.logging_name(), "mapped");
            op.core().mapped.trigger();
            op.trigger_execution(&rt);
        }));
    }

    /// Marks this operation executed once `effects` triggers, then runs the
    /// completion stage.
    pub fn complete_execution(&self, rt: &Arc<Runtime>, effects: Event) {
        let op = self.op();
        let rt = Arc::clone(rt);
        effects.add_waiter(Box::new(move |poisoned: bool| {
            if poisoned {
                op.core().state.lock().poisoned = true;
            }
            let ctx = rt.find_context(op.core().parent_ctx()).expect("parent context retired");
            ctx.register_child_executed(&op);
            op.trigger_complete(&rt);
        }));
    }

    /// Final completion bookkeeping; called by `trigger_complete` once any
    /// child effects are done.
    pub fn finalize_complete(&self, rt: &Arc<Runtime>) {
        let op = self.op();
        let ctx = rt.find_context(self.parent_ctx).expect("parent context retired");
        ctx.register_child_complete(&op);
        let poisoned = self.state.lock().poisoned;
        if poisoned {
            self.completion.poison();
        } else {
            self.completion.trigger();
        }
        op.trigger_commit(rt);
    }

    /// Final commit bookkeeping; frees this operation's slot in the parent.
    pub fn finalize_commit(&self, rt: &Arc<Runtime>) {
        let op = self.op();
        let poisoned = self.state.lock().poisoned;
        if poisoned {
            error!(target: "tessera::ctx", uid = %self.uid, name = op.logging_name(),
                "operation failed at commit after poisoned precondition");
        }
        let ctx = rt.find_context(self.parent_ctx).expect("parent context retired");
        ctx.register_child_commit(&op);
        self.committed.trigger();
    }

    /// Fails this operation because an upstream event was poisoned.
    pub(crate) fn fail_from_poison(&self, rt: &Arc<Runtime>) {
        self.handle_poisoned_precondition(rt);
    }

    fn handle_poisoned_precondition(&self, rt: &Arc<Runtime>) {
        let op = self.op();
        error!(target: "tessera::ctx", uid = %self.uid, name = op.logging_name(),
            "precondition poisoned; failing operation");
        {
            let mut state = self.state.lock();
            state.poisoned = true;
        }
        // poison propagates to dependents through the mapped event, and the
        // operation heads straight for the failed-commit path
        self.mapped.poison();
        let ctx = rt.find_context(self.parent_ctx).expect("parent context retired");
        ctx.register_child_executed(&op);
        op.trigger_complete(rt);
    }
}

// OPERATION TRAIT
// ================================================================================================

/// The capability surface every operation implements.
///
/// Shared bookkeeping lives in the embedded [`OpCore`]; concrete kinds
/// override the stage callbacks they care about and inherit the defaults for
/// the rest. Stage callbacks never block: waiting is expressed by
/// registering a waiter on an event and returning.
pub trait OperationLike: Send + Sync {
    fn core(&self) -> &OpCore;

    fn kind(&self) -> OpKind;

    /// Name used in log messages and error reports.
    fn logging_name(&self) -> &'static str;

    /// Internal operations (closes, projections) are tracked separately by
    /// traces and attributed to their creating operation on replay.
    fn is_internal_op(&self) -> bool {
        false
    }

    fn region_count(&self) -> usize {
        self.core().regions().len()
    }

    /// Stage 1, run in program order with respect to siblings: insert
    /// dependence edges against earlier operations, fences and traces.
    fn trigger_dependence_analysis(&self, rt: &Arc<Runtime>) {
        let core = self.core();
        let ctx = rt.find_context(core.parent_ctx()).expect("parent context retired");
        ctx.analyze_region_dependences(rt, &core.op());
    }

    /// Stage 2: produce mapping decisions and call
    /// [`OpCore::complete_mapping`].
    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        self.core().complete_mapping(rt, Event::NO_EVENT);
    }

    /// Stage 3: launch the payload and call
    /// [`OpCore::complete_execution`].
    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        self.core().complete_execution(rt, Event::NO_EVENT);
    }

    /// Stage 4: all effects visible; release references and notify the
    /// parent.
    fn trigger_complete(&self, rt: &Arc<Runtime>) {
        self.core().finalize_complete(rt);
    }

    /// Stage 5: the operation can never be needed again.
    fn trigger_commit(&self, rt: &Arc<Runtime>) {
        self.core().finalize_commit(rt);
    }
}

/// Registers a freshly constructed operation with its parent context and
/// starts its dependence-analysis stage.
///
/// This is the single entry point through which every operation joins the
/// pipeline; `op_pre` defers the dependence analysis until it triggers.
pub fn launch_operation(
    rt: &Arc<Runtime>,
    op: ArcOp,
    op_pre: Event,
) -> Result<(), crate::RuntimeError> {
    op.core().attach_self(&op);
    let ctx = rt
        .find_context(op.core().parent_ctx())
        .ok_or(crate::RuntimeError::UnknownContext(op.core().parent_ctx()))?;
    for (index, req) in op.core().regions().iter().enumerate() {
        ctx.check_privilege(rt, req, index)?;
    }
    ctx.register_new_child_operation(&op)?;
    ctx.add_to_dependence_queue(op, op_pre)
}
