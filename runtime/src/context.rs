use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
};

use parking_lot::{Condvar, Mutex};
use tessera_core::{
    ContextId, Domain, Event, FieldId, LogicalRegion, NodeId, RegionRequirement, TraceId,
    UniqueId, UserEvent, check_dependence_type,
    utils::{
        ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, read_string,
        write_string,
    },
};
use tracing::{debug, info, trace, warn};

use crate::{
    RuntimeError,
    config::ContextConfig,
    operation::{ArcOp, OpKind, OpStatus},
    runtime::Runtime,
    trace::Trace,
};

// LOCAL FIELDS
// ================================================================================================

/// A field allocated for the lifetime of a context and reclaimed when the
/// context exits.
#[derive(Clone, Debug)]
pub struct LocalFieldInfo {
    pub field_space: u32,
    pub fid: FieldId,
    pub size: usize,
    pub serdez_id: u32,
    /// Triggers when the field's storage may be reused.
    pub reclaim: Event,
}

impl Serializable for LocalFieldInfo {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.field_space);
        self.fid.write_into(target);
        target.write_u64(self.size as u64);
        target.write_u32(self.serdez_id);
    }
}

impl Deserializable for LocalFieldInfo {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            field_space: source.read_u32()?,
            fid: FieldId::read_from(source)?,
            size: source.read_u64()? as usize,
            serdez_id: source.read_u32()?,
            reclaim: Event::NO_EVENT,
        })
    }
}

// TASK CONTEXT TRAIT
// ================================================================================================

/// The capability surface of a task's execution context.
///
/// `InnerContext` implements the full surface; leaf contexts refuse child
/// operations, and inline contexts redirect to their enclosing context.
pub trait TaskContext: Send + Sync {
    fn context_id(&self) -> ContextId;
    fn owner_uid(&self) -> UniqueId;
    fn task_name(&self) -> &str;
    fn depth(&self) -> u32;
    fn config(&self) -> ContextConfig;
    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>>;

    fn is_leaf(&self) -> bool {
        false
    }

    // children ----------------------------------------------------------------------------------

    /// Assigns the operation its context-local index. Blocks while the
    /// outstanding-children window is full.
    fn register_new_child_operation(&self, op: &ArcOp) -> Result<u64, RuntimeError>;

    /// Queues the operation for dependence analysis in program order,
    /// deferred until `op_pre` triggers.
    fn add_to_dependence_queue(&self, op: ArcOp, op_pre: Event) -> Result<(), RuntimeError>;

    fn register_child_executed(&self, op: &ArcOp);
    fn register_child_complete(&self, op: &ArcOp);
    fn register_child_commit(&self, op: &ArcOp);
    fn unregister_child_operation(&self, op: &ArcOp);

    /// Inserts dependence edges for `op` against earlier children, the
    /// current fence and the active trace.
    fn analyze_region_dependences(&self, rt: &Arc<Runtime>, op: &ArcOp);

    /// Verifies that a region requirement's privileges can be derived from
    /// its declared parent region. Failures are returned to the caller; the
    /// operation does not map.
    fn check_privilege(
        &self,
        rt: &Arc<Runtime>,
        req: &RegionRequirement,
        index: usize,
    ) -> Result<(), RuntimeError>;

    // fences and traces -------------------------------------------------------------------------

    /// Makes `op` the context's current fence; later children depend on it.
    fn update_current_fence(&self, op: &ArcOp);

    /// Registers `op`'s dependences on every still-outstanding child. An
    /// execution fence additionally waits for their completion.
    fn perform_fence_analysis(&self, op: &ArcOp, execution_fence: bool);

    fn begin_trace(&self, rt: &Arc<Runtime>, tid: TraceId) -> Result<(), RuntimeError>;
    fn end_trace(&self, rt: &Arc<Runtime>, tid: TraceId) -> Result<(), RuntimeError>;
    fn find_trace(&self, tid: TraceId) -> Option<Arc<Trace>>;

    // frames and admission ----------------------------------------------------------------------

    /// Issues a frame whose completion is signalled by `termination`;
    /// blocks while too many frames are outstanding.
    fn issue_frame(&self, termination: Event) -> Result<(), RuntimeError>;
    fn finish_frame(&self);

    fn increment_pending(&self);
    fn decrement_pending(&self);
    fn increment_outstanding(&self);
    fn decrement_outstanding(&self);
    fn is_active_context(&self) -> bool;

    // local fields ------------------------------------------------------------------------------

    fn add_local_field(
        &self,
        field_space: u32,
        fid: FieldId,
        size: usize,
        serdez_id: u32,
    ) -> Result<(), RuntimeError>;

    /// Snapshots every local field visible to a child of this context, from
    /// the outermost enclosing context inward.
    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>);

    // inline mappings ---------------------------------------------------------------------------

    fn register_inline_mapping(&self, req: RegionRequirement);
    fn unregister_inline_mapping(&self, region: LogicalRegion);

    /// Returns the index of the first requirement that conflicts with a
    /// currently inline-mapped region, along with whether the conflicting
    /// mapping is on the requirement's parent region.
    fn has_conflicting_regions(&self, reqs: &[RegionRequirement]) -> Option<(usize, bool)>;

    fn find_safe_cast_domain(&self, rt: &Arc<Runtime>, index_space: u64) -> Option<Domain>;

    // completion --------------------------------------------------------------------------------

    /// Triggered once the owner task finished and every child completed.
    fn children_complete_event(&self) -> Event;
    /// Triggered once every child committed.
    fn children_committed_event(&self) -> Event;
    /// Marks the owner task's body as finished executing.
    fn end_task(&self);

    // introspection -----------------------------------------------------------------------------

    /// Returns (executing, executed, complete) set sizes.
    fn children_counts(&self) -> (usize, usize, usize);
    fn total_children(&self) -> u64;
    fn committed_children(&self) -> u64;
}

// INNER CONTEXT
// ================================================================================================

/// Which flavor of full context this is.
pub enum ContextVariant {
    /// An ordinary inner context with a parent.
    Inner { parent: Option<ContextId> },
    /// The root of the context tree.
    Top,
    /// A context reconstructed from a remote snapshot; the enclosing local
    /// fields travelled with it.
    Remote { enclosing_fields: Vec<LocalFieldInfo>, source_node: NodeId },
}

struct CtxState {
    total_children_count: u64,
    committed_children_count: u64,
    outstanding_children_count: usize,
    executing: HashMap<UniqueId, ArcOp>,
    executed: HashMap<UniqueId, ArcOp>,
    complete: HashMap<UniqueId, ArcOp>,
    /// Non-committed children in registration order, for program-order
    /// dependence analysis. Cleared at each fence, which dominates them.
    program_order: Vec<ArcOp>,
    current_fence: Option<ArcOp>,
    fence_generation: u64,
    /// Tail of the serialized dependence-analysis chain.
    dependence_tail: Event,
    traces: HashMap<TraceId, Arc<Trace>>,
    current_trace: Option<Arc<Trace>>,
    frame_events: VecDeque<Event>,
    pending_frames: usize,
    outstanding_subtasks: usize,
    pending_subtasks: usize,
    currently_active: bool,
    local_fields: Vec<LocalFieldInfo>,
    inline_regions: Vec<RegionRequirement>,
    safe_cast_domains: HashMap<u64, Domain>,
    owner_finished: bool,
    complete_triggered: bool,
    committed_triggered: bool,
}

/// The full-capability context: owns children bookkeeping, admission
/// control, fences, frames, traces, local fields and inline-mapping state.
pub struct InnerContext {
    rt: Weak<Runtime>,
    ctx_id: ContextId,
    owner_uid: UniqueId,
    task_name: String,
    depth: u32,
    config: ContextConfig,
    variant: ContextVariant,
    state: Mutex<CtxState>,
    /// Signalled when the outstanding-children window reopens.
    window_cond: Condvar,
    children_complete: UserEvent,
    children_committed: UserEvent,
}

impl InnerContext {
    pub(crate) fn create(
        rt: &Arc<Runtime>,
        ctx_id: ContextId,
        owner_uid: UniqueId,
        task_name: String,
        depth: u32,
        config: ContextConfig,
        variant: ContextVariant,
    ) -> Arc<Self> {
        Arc::new(Self {
            rt: Arc::downgrade(rt),
            ctx_id,
            owner_uid,
            task_name,
            depth,
            config,
            variant,
            state: Mutex::new(CtxState {
                total_children_count: 0,
                committed_children_count: 0,
                outstanding_children_count: 0,
                executing: HashMap::new(),
                executed: HashMap::new(),
                complete: HashMap::new(),
                program_order: Vec::new(),
                current_fence: None,
                fence_generation: 0,
                dependence_tail: Event::NO_EVENT,
                traces: HashMap::new(),
                current_trace: None,
                frame_events: VecDeque::new(),
                pending_frames: 0,
                outstanding_subtasks: 0,
                pending_subtasks: 0,
                currently_active: false,
                local_fields: Vec::new(),
                inline_regions: Vec::new(),
                safe_cast_domains: HashMap::new(),
                owner_finished: false,
                complete_triggered: false,
                committed_triggered: false,
            }),
            window_cond: Condvar::new(),
            children_complete: UserEvent::new(),
            children_committed: UserEvent::new(),
        })
    }

    fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime dropped while context alive")
    }

    /// Checks whether the children-complete / children-committed conditions
    /// now hold and fires the corresponding events.
    fn check_completion(&self) {
        let (fire_complete, fire_committed) = {
            let mut state = self.state.lock();
            let complete = state.owner_finished
                && state.executing.is_empty()
                && state.executed.is_empty()
                && !state.complete_triggered;
            if complete {
                state.complete_triggered = true;
            }
            let committed = state.owner_finished
                && state.executing.is_empty()
                && state.executed.is_empty()
                && state.complete.is_empty()
                && !state.committed_triggered;
            if committed {
                // commits may only fire after completion
                if !state.complete_triggered {
                    state.complete_triggered = true;
                }
                state.committed_triggered = true;
            }
            (complete, committed)
        };
        if fire_complete {
            debug!(target: "tessera::ctx", ctx = %self.ctx_id, "all children complete");
            self.children_complete.trigger();
        }
        if fire_committed {
            debug!(target: "tessera::ctx", ctx = %self.ctx_id, "all children committed");
            self.children_committed.trigger();
        }
    }
}

impl TaskContext for InnerContext {
    fn context_id(&self) -> ContextId {
        self.ctx_id
    }

    fn owner_uid(&self) -> UniqueId {
        self.owner_uid
    }

    fn task_name(&self) -> &str {
        &self.task_name
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn config(&self) -> ContextConfig {
        self.config
    }

    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        match &self.variant {
            ContextVariant::Inner { parent: Some(parent) } => self.runtime().find_context(*parent),
            _ => None,
        }
    }

    // children ----------------------------------------------------------------------------------

    fn register_new_child_operation(&self, op: &ArcOp) -> Result<u64, RuntimeError> {
        let mut state = self.state.lock();

        // admission control: block while the window is full, reopening at
        // the hysteresis low-water mark
        if self.config.max_window_size > 0 {
            while state.outstanding_children_count >= self.config.max_window_size {
                trace!(target: "tessera::ctx", ctx = %self.ctx_id,
                    outstanding = state.outstanding_children_count, "window wait");
                self.window_cond.wait(&mut state);
            }
        }

        let index = state.total_children_count;
        state.total_children_count += 1;
        state.outstanding_children_count += 1;
        op.core().set_ctx_index(index);
        op.core().set_status(OpStatus::Executing);
        state.executing.insert(op.core().unique_id(), op.clone());
        state.program_order.push(op.clone());
        if let Some(current) = &state.current_trace {
            op.core().set_trace(Arc::clone(current), current.is_tracing());
        }
        Ok(index)
    }

    fn add_to_dependence_queue(&self, op: ArcOp, op_pre: Event) -> Result<(), RuntimeError> {
        let gate = UserEvent::new();
        let prev_tail = {
            let mut state = self.state.lock();
            let prev = state.dependence_tail.clone();
            state.dependence_tail = gate.event();
            prev
        };

        let rt = self.runtime();
        let wait_on = Event::merge(&[prev_tail, op_pre]);
        wait_on.add_waiter(Box::new(move |poisoned: bool| {
            if poisoned {
                op.core().fail_from_poison(&rt);
            } else {
                op.trigger_dependence_analysis(&rt);
                op.core().schedule_mapping(&rt);
            }
            gate.trigger();
        }));
        Ok(())
    }

    fn register_child_executed(&self, op: &ArcOp) {
        let uid = op.core().unique_id();
        let mut state = self.state.lock();
        if let Some(op) = state.executing.remove(&uid) {
            op.core().set_status(OpStatus::Executed);
            state.executed.insert(uid, op);
        }
        drop(state);
        self.check_completion();
    }

    fn register_child_complete(&self, op: &ArcOp) {
        let uid = op.core().unique_id();
        let mut state = self.state.lock();
        if let Some(op) = state.executed.remove(&uid) {
            op.core().set_status(OpStatus::Complete);
            state.complete.insert(uid, op);
            // the window drains when children complete; a cancelled child
            // already released its slot at unregistration
            if state.outstanding_children_count > 0 {
                state.outstanding_children_count -= 1;
                if self.config.max_window_size == 0
                    || state.outstanding_children_count < self.config.window_low_water()
                {
                    self.window_cond.notify_all();
                }
            }
        }
        drop(state);
        self.check_completion();
    }

    fn register_child_commit(&self, op: &ArcOp) {
        let uid = op.core().unique_id();
        let mut state = self.state.lock();
        // a cancelled child may still drain its pipeline; its slot was
        // already reclaimed
        if state.complete.remove(&uid).is_some() {
            state.committed_children_count += 1;
            op.core().set_status(OpStatus::Committed);
            state.program_order.retain(|other| other.core().unique_id() != uid);
            if let Some(fence) = &state.current_fence {
                if fence.core().unique_id() == uid {
                    state.current_fence = None;
                }
            }
        }
        drop(state);
        self.check_completion();
    }

    fn unregister_child_operation(&self, op: &ArcOp) {
        let uid = op.core().unique_id();
        let mut state = self.state.lock();
        let was_tracked = state.executing.remove(&uid).is_some()
            || state.executed.remove(&uid).is_some()
            || state.complete.remove(&uid).is_some();
        if was_tracked {
            op.core().set_status(OpStatus::Gone);
            state.program_order.retain(|other| other.core().unique_id() != uid);
            if state.outstanding_children_count > 0 {
                state.outstanding_children_count -= 1;
                self.window_cond.notify_all();
            }
        }
        drop(state);
        self.check_completion();
    }

    fn analyze_region_dependences(&self, rt: &Arc<Runtime>, op: &ArcOp) {
        // replayed traces substitute their memoized edges for analysis
        let (trace, capturing) = op.core().trace_info();
        if let Some(trace) = &trace {
            if !capturing {
                if let Err(violation) = trace.register_operation(op) {
                    rt.report_fatal(violation);
                }
                return;
            }
            if let Err(violation) = trace.register_operation(op) {
                rt.report_fatal(violation);
            }
        }

        let (fence, priors) = {
            let state = self.state.lock();
            let priors: Vec<ArcOp> = state
                .program_order
                .iter()
                .filter(|prior| prior.core().unique_id() != op.core().unique_id())
                .filter(|prior| prior.core().ctx_index() < op.core().ctx_index())
                .cloned()
                .collect();
            (state.current_fence.clone(), priors)
        };

        // every child registered since the previous fence depends on it
        if let Some(fence) = fence {
            if fence.core().unique_id() != op.core().unique_id() {
                op.core().register_dependence(&fence);
                if let Some(trace) = &trace {
                    trace.record_dependence(&fence, op);
                }
            }
        }

        for prior in priors {
            if matches!(
                prior.kind(),
                OpKind::Fence | OpKind::TraceCapture | OpKind::TraceComplete | OpKind::Frame
            ) {
                continue;
            }
            for (source_idx, req) in op.core().regions().iter().enumerate() {
                for (target_idx, prior_req) in prior.core().regions().iter().enumerate() {
                    if !rt.forest().regions_overlap(&prior_req.region, &req.region) {
                        continue;
                    }
                    let overlap = prior_req.fields.overlap(&req.fields);
                    if overlap.is_empty() {
                        continue;
                    }
                    let dtype = check_dependence_type(prior_req, req);
                    if dtype == tessera_core::DependenceType::NoDependence {
                        continue;
                    }
                    op.core().register_region_dependence(
                        source_idx,
                        &prior,
                        target_idx,
                        dtype,
                        overlap,
                    );
                    if let Some(trace) = &trace {
                        trace.record_region_dependence(
                            &prior, op, target_idx, source_idx, dtype, false, overlap,
                        );
                    }
                }
            }
        }
    }

    fn check_privilege(
        &self,
        rt: &Arc<Runtime>,
        req: &RegionRequirement,
        index: usize,
    ) -> Result<(), RuntimeError> {
        if req.privilege.is_no_access() {
            return Ok(());
        }
        if !rt.forest().is_subregion(&req.region, &req.parent) {
            return Err(RuntimeError::PrivilegeViolation {
                task: self.task_name.clone(),
                uid: self.owner_uid,
                index,
            });
        }
        Ok(())
    }

    // fences and traces -------------------------------------------------------------------------

    fn update_current_fence(&self, op: &ArcOp) {
        let mut state = self.state.lock();
        state.current_fence = Some(op.clone());
        state.fence_generation += 1;
        // the fence dominates everything registered before it
        let fence_uid = op.core().unique_id();
        state.program_order.retain(|other| other.core().unique_id() == fence_uid);
        trace!(target: "tessera::ctx", ctx = %self.ctx_id, gen = state.fence_generation,
            "current fence updated");
    }

    fn perform_fence_analysis(&self, op: &ArcOp, execution_fence: bool) {
        let children: Vec<ArcOp> = {
            let state = self.state.lock();
            state
                .executing
                .values()
                .chain(state.executed.values())
                .chain(state.complete.values())
                .filter(|child| child.core().unique_id() != op.core().unique_id())
                .cloned()
                .collect()
        };
        for child in children {
            op.core().register_dependence(&child);
            if execution_fence {
                op.core().add_mapping_precondition(child.core().completion_event());
            }
        }
    }

    fn begin_trace(&self, _rt: &Arc<Runtime>, tid: TraceId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if state.current_trace.is_some() {
            return Err(RuntimeError::NestedTrace {
                tid,
                task: self.task_name.clone(),
                uid: self.owner_uid,
            });
        }
        let trace = state.traces.entry(tid).or_insert_with(|| {
            Arc::new(Trace::new(tid, self.ctx_id, self.task_name.clone(), self.owner_uid))
        });
        info!(target: "tessera::trace", ctx = %self.ctx_id, %tid,
            replay = !trace.is_tracing(), "begin trace");
        state.current_trace = Some(Arc::clone(trace));
        Ok(())
    }

    fn end_trace(&self, rt: &Arc<Runtime>, tid: TraceId) -> Result<(), RuntimeError> {
        let trace = {
            let mut state = self.state.lock();
            let Some(trace) = state.current_trace.take() else {
                return Err(RuntimeError::UnmatchedEndTrace {
                    tid,
                    task: self.task_name.clone(),
                    uid: self.owner_uid,
                });
            };
            debug_assert_eq!(trace.trace_id(), tid);
            trace
        };
        // the capture pass closes with a capture marker, replays with a
        // completion marker; both are fence-like
        if trace.is_tracing() {
            crate::ops::TraceCaptureOp::launch(rt, self.ctx_id, trace)?;
        } else {
            crate::ops::TraceCompleteOp::launch(rt, self.ctx_id, trace)?;
        }
        Ok(())
    }

    fn find_trace(&self, tid: TraceId) -> Option<Arc<Trace>> {
        self.state.lock().traces.get(&tid).cloned()
    }

    // frames and admission ----------------------------------------------------------------------

    fn issue_frame(&self, termination: Event) -> Result<(), RuntimeError> {
        let wait_on = {
            let mut state = self.state.lock();
            state.pending_frames += 1;
            if self.config.max_outstanding_frames > 0
                && state.frame_events.len() >= self.config.max_outstanding_frames
            {
                // wait for the oldest outstanding frame before admitting
                // this one
                let oldest = state.frame_events.front().cloned();
                state.frame_events.push_back(termination);
                oldest
            } else {
                state.frame_events.push_back(termination);
                None
            }
        };
        if let Some(event) = wait_on {
            event.wait();
        }
        Ok(())
    }

    fn finish_frame(&self) {
        let mut state = self.state.lock();
        state.frame_events.pop_front();
        if state.pending_frames > 0 {
            state.pending_frames -= 1;
        }
    }

    fn increment_pending(&self) {
        let mut state = self.state.lock();
        state.pending_subtasks += 1;
    }

    fn decrement_pending(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending_subtasks > 0);
        state.pending_subtasks -= 1;
    }

    fn increment_outstanding(&self) {
        let mut state = self.state.lock();
        state.outstanding_subtasks += 1;
        if !state.currently_active {
            state.currently_active = true;
            trace!(target: "tessera::ctx", ctx = %self.ctx_id, "context activated");
        }
    }

    fn decrement_outstanding(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.outstanding_subtasks > 0);
        state.outstanding_subtasks -= 1;
        // the context stays active while work remains or children are still
        // materializing their own work
        if state.outstanding_subtasks + state.pending_subtasks == 0 {
            state.currently_active = false;
            trace!(target: "tessera::ctx", ctx = %self.ctx_id, "context deactivated");
        }
    }

    fn is_active_context(&self) -> bool {
        self.state.lock().currently_active
    }

    // local fields ------------------------------------------------------------------------------

    fn add_local_field(
        &self,
        field_space: u32,
        fid: FieldId,
        size: usize,
        serdez_id: u32,
    ) -> Result<(), RuntimeError> {
        if fid.as_raw() >= tessera_core::MAX_FIELDS {
            return Err(RuntimeError::LocalFieldLimit { fid });
        }
        let mut state = self.state.lock();
        state.local_fields.push(LocalFieldInfo {
            field_space,
            fid,
            size,
            serdez_id,
            reclaim: self.children_committed.event(),
        });
        Ok(())
    }

    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        match &self.variant {
            ContextVariant::Remote { enclosing_fields, .. } => {
                out.extend(enclosing_fields.iter().cloned());
            },
            _ => {
                if let Some(parent) = self.find_parent_context() {
                    parent.find_enclosing_local_fields(out);
                }
            },
        }
        let state = self.state.lock();
        out.extend(state.local_fields.iter().cloned());
    }

    // inline mappings ---------------------------------------------------------------------------

    fn register_inline_mapping(&self, req: RegionRequirement) {
        self.state.lock().inline_regions.push(req);
    }

    fn unregister_inline_mapping(&self, region: LogicalRegion) {
        self.state.lock().inline_regions.retain(|req| req.region != region);
    }

    fn has_conflicting_regions(&self, reqs: &[RegionRequirement]) -> Option<(usize, bool)> {
        let rt = self.runtime();
        let state = self.state.lock();
        for (index, req) in reqs.iter().enumerate() {
            for inline in &state.inline_regions {
                if !rt.forest().regions_overlap(&inline.region, &req.region) {
                    continue;
                }
                if !inline.fields.overlaps(&req.fields) {
                    continue;
                }
                if check_dependence_type(inline, req)
                    == tessera_core::DependenceType::NoDependence
                {
                    continue;
                }
                let parent_conflict = inline.region == req.parent;
                return Some((index, parent_conflict));
            }
        }
        None
    }

    fn find_safe_cast_domain(&self, rt: &Arc<Runtime>, index_space: u64) -> Option<Domain> {
        {
            let state = self.state.lock();
            if let Some(domain) = state.safe_cast_domains.get(&index_space) {
                return Some(*domain);
            }
        }
        let domain = rt.forest().domain_of(index_space)?;
        self.state.lock().safe_cast_domains.insert(index_space, domain);
        Some(domain)
    }

    // completion --------------------------------------------------------------------------------

    fn children_complete_event(&self) -> Event {
        self.children_complete.event()
    }

    fn children_committed_event(&self) -> Event {
        self.children_committed.event()
    }

    fn end_task(&self) {
        {
            let mut state = self.state.lock();
            state.owner_finished = true;
        }
        self.check_completion();
    }

    // introspection -----------------------------------------------------------------------------

    fn children_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.executing.len(), state.executed.len(), state.complete.len())
    }

    fn total_children(&self) -> u64 {
        self.state.lock().total_children_count
    }

    fn committed_children(&self) -> u64 {
        self.state.lock().committed_children_count
    }
}

// LEAF CONTEXT
// ================================================================================================

/// The context of a leaf task: child operations are a contract violation.
pub struct LeafContext {
    ctx_id: ContextId,
    owner_uid: UniqueId,
    task_name: String,
    depth: u32,
    rt: Weak<Runtime>,
    parent: Option<ContextId>,
}

impl LeafContext {
    pub(crate) fn new(
        rt: &Arc<Runtime>,
        ctx_id: ContextId,
        owner_uid: UniqueId,
        task_name: String,
        depth: u32,
        parent: Option<ContextId>,
    ) -> Self {
        Self { ctx_id, owner_uid, task_name, depth, rt: Arc::downgrade(rt), parent }
    }

    fn violation(&self) -> RuntimeError {
        RuntimeError::LeafContextViolation {
            task: self.task_name.clone(),
            uid: self.owner_uid,
        }
    }
}

impl TaskContext for LeafContext {
    fn context_id(&self) -> ContextId {
        self.ctx_id
    }

    fn owner_uid(&self) -> UniqueId {
        self.owner_uid
    }

    fn task_name(&self) -> &str {
        &self.task_name
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn config(&self) -> ContextConfig {
        ContextConfig::default()
    }

    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        let parent = self.parent?;
        self.rt.upgrade()?.find_context(parent)
    }

    fn is_leaf(&self) -> bool {
        true
    }

    fn register_new_child_operation(&self, _op: &ArcOp) -> Result<u64, RuntimeError> {
        Err(self.violation())
    }

    fn add_to_dependence_queue(&self, _op: ArcOp, _op_pre: Event) -> Result<(), RuntimeError> {
        Err(self.violation())
    }

    fn register_child_executed(&self, op: &ArcOp) {
        warn!(target: "tessera::ctx", uid = %op.core().unique_id(),
            "child lifecycle call on leaf context");
    }

    fn register_child_complete(&self, _op: &ArcOp) {}

    fn register_child_commit(&self, _op: &ArcOp) {}

    fn unregister_child_operation(&self, _op: &ArcOp) {}

    fn analyze_region_dependences(&self, _rt: &Arc<Runtime>, _op: &ArcOp) {}

    fn check_privilege(
        &self,
        _rt: &Arc<Runtime>,
        _req: &RegionRequirement,
        _index: usize,
    ) -> Result<(), RuntimeError> {
        Err(self.violation())
    }

    fn update_current_fence(&self, _op: &ArcOp) {}

    fn perform_fence_analysis(&self, _op: &ArcOp, _execution_fence: bool) {}

    fn begin_trace(&self, _rt: &Arc<Runtime>, _tid: TraceId) -> Result<(), RuntimeError> {
        Err(self.violation())
    }

    fn end_trace(&self, _rt: &Arc<Runtime>, _tid: TraceId) -> Result<(), RuntimeError> {
        Err(self.violation())
    }

    fn find_trace(&self, _tid: TraceId) -> Option<Arc<Trace>> {
        None
    }

    fn issue_frame(&self, _termination: Event) -> Result<(), RuntimeError> {
        Err(self.violation())
    }

    fn finish_frame(&self) {}

    fn increment_pending(&self) {}

    fn decrement_pending(&self) {}

    fn increment_outstanding(&self) {}

    fn decrement_outstanding(&self) {}

    fn is_active_context(&self) -> bool {
        false
    }

    fn add_local_field(
        &self,
        _field_space: u32,
        _fid: FieldId,
        _size: usize,
        _serdez_id: u32,
    ) -> Result<(), RuntimeError> {
        Err(self.violation())
    }

    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        if let Some(parent) = self.find_parent_context() {
            parent.find_enclosing_local_fields(out);
        }
    }

    fn register_inline_mapping(&self, _req: RegionRequirement) {}

    fn unregister_inline_mapping(&self, _region: LogicalRegion) {}

    fn has_conflicting_regions(&self, _reqs: &[RegionRequirement]) -> Option<(usize, bool)> {
        None
    }

    fn find_safe_cast_domain(&self, rt: &Arc<Runtime>, index_space: u64) -> Option<Domain> {
        rt.forest().domain_of(index_space)
    }

    fn children_complete_event(&self) -> Event {
        Event::NO_EVENT
    }

    fn children_committed_event(&self) -> Event {
        Event::NO_EVENT
    }

    fn end_task(&self) {}

    fn children_counts(&self) -> (usize, usize, usize) {
        (0, 0, 0)
    }

    fn total_children(&self) -> u64 {
        0
    }

    fn committed_children(&self) -> u64 {
        0
    }
}

// INLINE CONTEXT
// ================================================================================================

/// The context of an inlined task: every query redirects to the enclosing
/// context that physically runs the task.
pub struct InlineContext {
    enclosing: Arc<dyn TaskContext>,
    owner_uid: UniqueId,
    task_name: String,
}

impl InlineContext {
    pub fn new(enclosing: Arc<dyn TaskContext>, owner_uid: UniqueId, task_name: String) -> Self {
        Self { enclosing, owner_uid, task_name }
    }
}

impl TaskContext for InlineContext {
    fn context_id(&self) -> ContextId {
        self.enclosing.context_id()
    }

    fn owner_uid(&self) -> UniqueId {
        self.owner_uid
    }

    fn task_name(&self) -> &str {
        &self.task_name
    }

    fn depth(&self) -> u32 {
        self.enclosing.depth()
    }

    fn config(&self) -> ContextConfig {
        self.enclosing.config()
    }

    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        Some(Arc::clone(&self.enclosing))
    }

    fn register_new_child_operation(&self, op: &ArcOp) -> Result<u64, RuntimeError> {
        self.enclosing.register_new_child_operation(op)
    }

    fn add_to_dependence_queue(&self, op: ArcOp, op_pre: Event) -> Result<(), RuntimeError> {
        self.enclosing.add_to_dependence_queue(op, op_pre)
    }

    fn register_child_executed(&self, op: &ArcOp) {
        self.enclosing.register_child_executed(op)
    }

    fn register_child_complete(&self, op: &ArcOp) {
        self.enclosing.register_child_complete(op)
    }

    fn register_child_commit(&self, op: &ArcOp) {
        self.enclosing.register_child_commit(op)
    }

    fn unregister_child_operation(&self, op: &ArcOp) {
        self.enclosing.unregister_child_operation(op)
    }

    fn analyze_region_dependences(&self, rt: &Arc<Runtime>, op: &ArcOp) {
        self.enclosing.analyze_region_dependences(rt, op)
    }

    fn check_privilege(
        &self,
        rt: &Arc<Runtime>,
        req: &RegionRequirement,
        index: usize,
    ) -> Result<(), RuntimeError> {
        self.enclosing.check_privilege(rt, req, index)
    }

    fn update_current_fence(&self, op: &ArcOp) {
        self.enclosing.update_current_fence(op)
    }

    fn perform_fence_analysis(&self, op: &ArcOp, execution_fence: bool) {
        self.enclosing.perform_fence_analysis(op, execution_fence)
    }

    fn begin_trace(&self, rt: &Arc<Runtime>, tid: TraceId) -> Result<(), RuntimeError> {
        self.enclosing.begin_trace(rt, tid)
    }

    fn end_trace(&self, rt: &Arc<Runtime>, tid: TraceId) -> Result<(), RuntimeError> {
        self.enclosing.end_trace(rt, tid)
    }

    fn find_trace(&self, tid: TraceId) -> Option<Arc<Trace>> {
        self.enclosing.find_trace(tid)
    }

    fn issue_frame(&self, termination: Event) -> Result<(), RuntimeError> {
        self.enclosing.issue_frame(termination)
    }

    fn finish_frame(&self) {
        self.enclosing.finish_frame()
    }

    fn increment_pending(&self) {
        self.enclosing.increment_pending()
    }

    fn decrement_pending(&self) {
        self.enclosing.decrement_pending()
    }

    fn increment_outstanding(&self) {
        self.enclosing.increment_outstanding()
    }

    fn decrement_outstanding(&self) {
        self.enclosing.decrement_outstanding()
    }

    fn is_active_context(&self) -> bool {
        self.enclosing.is_active_context()
    }

    fn add_local_field(
        &self,
        field_space: u32,
        fid: FieldId,
        size: usize,
        serdez_id: u32,
    ) -> Result<(), RuntimeError> {
        self.enclosing.add_local_field(field_space, fid, size, serdez_id)
    }

    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        self.enclosing.find_enclosing_local_fields(out)
    }

    fn register_inline_mapping(&self, req: RegionRequirement) {
        self.enclosing.register_inline_mapping(req)
    }

    fn unregister_inline_mapping(&self, region: LogicalRegion) {
        self.enclosing.unregister_inline_mapping(region)
    }

    fn has_conflicting_regions(&self, reqs: &[RegionRequirement]) -> Option<(usize, bool)> {
        self.enclosing.has_conflicting_regions(reqs)
    }

    fn find_safe_cast_domain(&self, rt: &Arc<Runtime>, index_space: u64) -> Option<Domain> {
        self.enclosing.find_safe_cast_domain(rt, index_space)
    }

    fn children_complete_event(&self) -> Event {
        self.enclosing.children_complete_event()
    }

    fn children_committed_event(&self) -> Event {
        self.enclosing.children_committed_event()
    }

    fn end_task(&self) {
        self.enclosing.end_task()
    }

    fn children_counts(&self) -> (usize, usize, usize) {
        self.enclosing.children_counts()
    }

    fn total_children(&self) -> u64 {
        self.enclosing.total_children()
    }

    fn committed_children(&self) -> u64 {
        self.enclosing.committed_children()
    }
}

// REMOTE CONTEXT SNAPSHOT
// ================================================================================================

/// The wire form of a context shipped to another node: identity plus the
/// local fields visible from the enclosing chain.
#[derive(Clone, Debug)]
pub struct RemoteContextSnapshot {
    pub owner_uid: UniqueId,
    pub task_name: String,
    pub depth: u32,
    pub source_node: NodeId,
    pub enclosing_fields: Vec<LocalFieldInfo>,
}

impl RemoteContextSnapshot {
    /// Captures the state a remote node needs to reconstruct this context.
    pub fn capture(ctx: &dyn TaskContext, source_node: NodeId) -> Self {
        let mut enclosing_fields = Vec::new();
        ctx.find_enclosing_local_fields(&mut enclosing_fields);
        Self {
            owner_uid: ctx.owner_uid(),
            task_name: ctx.task_name().to_string(),
            depth: ctx.depth(),
            source_node,
            enclosing_fields,
        }
    }
}

impl Serializable for RemoteContextSnapshot {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.owner_uid.write_into(target);
        write_string(target, &self.task_name);
        target.write_u32(self.depth);
        self.source_node.write_into(target);
        target.write_u32(self.enclosing_fields.len() as u32);
        for field in &self.enclosing_fields {
            field.write_into(target);
        }
    }
}

impl Deserializable for RemoteContextSnapshot {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let owner_uid = UniqueId::read_from(source)?;
        let task_name = read_string(source)?;
        let depth = source.read_u32()?;
        let source_node = NodeId::read_from(source)?;
        let count = source.read_u32()? as usize;
        let mut enclosing_fields = Vec::with_capacity(count);
        for _ in 0..count {
            enclosing_fields.push(LocalFieldInfo::read_from(source)?);
        }
        Ok(Self { owner_uid, task_name, depth, source_node, enclosing_fields })
    }
}
