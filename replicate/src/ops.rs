use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use tessera_core::{
    CollectiveId, Domain, DomainPoint, Event, MapperId, RegionRequirement, ShardId, ShardingId,
};
use tessera_runtime::{
    ArcOp, DependentPartitionKind, FieldDescriptor, MappableDesc, MustEpochMapInput, OpCore,
    OpKind, OperationLike, PendingPartitionKind, Runtime, RuntimeError, launch_operation,
    ops::{DeletionTarget, TimingKind},
};
use tracing::{debug, info};

use crate::{
    concrete::{
        ConstraintChoice, ConstraintMappings, DescriptorSet, FieldDescriptorExchange,
        FieldDescriptorGather, FutureBroadcast, FutureExchange, FutureMapPayload,
        FutureNameExchange, FutureValue, MustEpochCompletionExchange,
        MustEpochDependenceExchange, MustEpochMappingBroadcast, MustEpochMappingExchange,
        MustEpochMappingPayload, PointOwnerMap, ShardSet, ShardingGatherCollective,
        VersioningAdvance, VersioningInfoBroadcast,
    },
    collective::AllGather,
    manager::ShardContext,
    sharding::ShardingFunction,
};

// SHARDING SELECTION
// ================================================================================================

/// Invokes the mapper's select-sharding-functor callback for an operation
/// and resolves the chosen function.
///
/// Every shard contributes its choice to a gather at shard zero, which
/// verifies agreement once all contributions arrive; disagreement, an
/// invalid functor id, or an unregistered functor are mapper contract
/// violations and fatal.
fn select_sharding_function(
    rt: &Arc<Runtime>,
    shard: &Arc<ShardContext>,
    desc: &MappableDesc,
    agreement_id: CollectiveId,
) -> Arc<ShardingFunction> {
    let mapper = rt.find_mapper(MapperId::new(0));
    let output = match desc.kind {
        OpKind::Copy => mapper.select_copy_sharding_functor(desc),
        OpKind::Fill => mapper.select_fill_sharding_functor(desc),
        OpKind::DependentPartition => mapper.select_partition_sharding_functor(desc),
        _ => mapper.select_task_sharding_functor(desc),
    };
    if output.chosen_functor == ShardingId::INVALID {
        rt.report_fatal(RuntimeError::InvalidShardingFunctor {
            mapper: mapper.name().to_string(),
            kind: desc.kind,
            task: desc.task_name.clone(),
            uid: desc.uid,
        });
    }

    let agreement =
        ShardingGatherCollective::with_id(shard, agreement_id, ShardId::new(0));
    agreement.contribute(output.chosen_functor);
    if agreement.is_target() {
        agreement.validate_async(
            output.chosen_functor,
            RuntimeError::InconsistentShardingFunctor {
                mapper: mapper.name().to_string(),
                kind: desc.kind,
                task: desc.task_name.clone(),
                uid: desc.uid,
            },
        );
    }

    match shard.manager().find_sharding_function(output.chosen_functor) {
        Some(function) => function,
        None => rt.report_fatal(RuntimeError::InvalidShardingFunctor {
            mapper: mapper.name().to_string(),
            kind: desc.kind,
            task: desc.task_name.clone(),
            uid: desc.uid,
        }),
    }
}

// REPL INDIVIDUAL TASK
// ================================================================================================

type FutureBody = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;
type SharedFuture = Arc<Mutex<Option<Vec<u8>>>>;

/// One shard's view of a replicated individual task.
///
/// The sharding function picks the owning shard for the task's point; the
/// owner maps and executes normally and broadcasts versioning state and the
/// future value, while the other shards short-circuit their mapping against
/// those broadcasts.
pub struct ReplIndividualTask {
    core: OpCore,
    shard: Arc<ShardContext>,
    task_name: &'static str,
    point: DomainPoint,
    domain: Domain,
    body: FutureBody,
    sharding_collective_id: CollectiveId,
    versioning_collective_id: CollectiveId,
    future_collective_id: CollectiveId,
    owner_shard: Mutex<ShardId>,
    versioning: Mutex<Option<VersioningInfoBroadcast>>,
    future: SharedFuture,
}

impl ReplIndividualTask {
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        task_name: &'static str,
        regions: Vec<RegionRequirement>,
        point: DomainPoint,
        domain: Domain,
        body: impl Fn() -> Vec<u8> + Send + Sync + 'static,
    ) -> Result<Arc<ReplIndividualTask>, RuntimeError> {
        // collective sites are allocated in program order, identically on
        // every shard
        let sharding_collective_id = shard.next_collective_id();
        let versioning_collective_id = shard.next_collective_id();
        let future_collective_id = shard.next_collective_id();
        let task = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), regions),
            shard: Arc::clone(shard),
            task_name,
            point,
            domain,
            body: Arc::new(body),
            sharding_collective_id,
            versioning_collective_id,
            future_collective_id,
            owner_shard: Mutex::new(ShardId::INVALID),
            versioning: Mutex::new(None),
            future: Arc::new(Mutex::new(None)),
        });
        let op: ArcOp = task.clone();
        launch_operation(rt, op, Event::NO_EVENT)?;
        Ok(task)
    }

    pub fn owner_shard(&self) -> ShardId {
        *self.owner_shard.lock()
    }

    /// The broadcast future value; identical on every shard once the task
    /// completes.
    pub fn future(&self) -> Option<Vec<u8>> {
        self.future.lock().clone()
    }

    fn desc(&self) -> MappableDesc {
        MappableDesc {
            uid: self.core.unique_id(),
            kind: OpKind::Task,
            task_name: self.task_name.to_string(),
        }
    }
}

impl OperationLike for ReplIndividualTask {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Task
    }

    fn logging_name(&self) -> &'static str {
        self.task_name
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let function =
            select_sharding_function(rt, &self.shard, &self.desc(), self.sharding_collective_id);
        let owner = function.find_owner(&self.point, &self.domain);
        *self.owner_shard.lock() = owner;
        info!(target: "tessera::repl", uid = %self.core.unique_id(),
            shard = %self.shard.shard_id(), %owner, "individual task owner selected");

        let versioning =
            VersioningInfoBroadcast::with_id(&self.shard, self.versioning_collective_id, owner);
        if owner == self.shard.shard_id() {
            // the owner maps normally and publishes its advance states
            let mut advance = VersioningAdvance::default();
            for (index, req) in self.core.regions().iter().enumerate() {
                if req.privilege.is_write() {
                    advance
                        .states
                        .entry(index as u32)
                        .or_default()
                        .push(self.core.unique_id().as_raw());
                }
            }
            versioning.broadcast_states(advance);
            *self.versioning.lock() = Some(versioning);
            self.core.complete_mapping(rt, Event::NO_EVENT);
        } else {
            // non-owning shards wait for the owner's version state instead
            // of re-running dependence analysis
            let ready = versioning.done_event();
            *self.versioning.lock() = Some(versioning);
            self.core.complete_mapping(rt, ready);
        }
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        if self.owner_shard() == self.shard.shard_id() {
            let value = (self.body)();
            *self.future.lock() = Some(value.clone());
            self.shard.manager().handle_future(value);
        }
        self.core.complete_execution(rt, Event::NO_EVENT);
    }

    fn trigger_complete(&self, rt: &Arc<Runtime>) {
        // exchange the future value before completing
        let owner = self.owner_shard();
        let broadcast = FutureBroadcast::with_id(&self.shard, self.future_collective_id, owner);

        if owner == self.shard.shard_id() {
            let value = self.future.lock().clone().unwrap_or_default();
            broadcast.broadcast(FutureValue(value));
            self.core.finalize_complete(rt);
        } else {
            let op = self.core.op();
            let rt = Arc::clone(rt);
            let future = Arc::clone(&self.future);
            let shard = Arc::clone(&self.shard);
            let receiver = Arc::clone(&broadcast);
            broadcast.done_event().add_waiter(Box::new(move |_poisoned: bool| {
                let value = receiver.wait_value().0;
                // latch the future on this node's manager too, so the node
                // holding the original task observes it
                shard.manager().handle_future(value.clone());
                *future.lock() = Some(value);
                op.core().finalize_complete(&rt);
            }));
        }
    }
}

// REPL INDEX TASK
// ================================================================================================

type PointBody = Arc<dyn Fn(DomainPoint) -> Vec<u8> + Send + Sync>;
type ReductionFold = Arc<dyn Fn(&mut Vec<u8>, &[u8]) + Send + Sync>;
type SharedFutureMap = Arc<Mutex<BTreeMap<u64, Vec<u8>>>>;

/// One shard's view of a replicated index task: the launch domain is
/// restricted to the points this shard owns; results flow back through a
/// future-map exchange, or through a reduction exchange folded in shard-id
/// order for bitwise determinism.
pub struct ReplIndexTask {
    core: OpCore,
    shard: Arc<ShardContext>,
    task_name: &'static str,
    domain: Domain,
    point_body: PointBody,
    reduction: Option<ReductionFold>,
    sharding_collective_id: CollectiveId,
    exchange_collective_id: CollectiveId,
    owned_points: Mutex<Vec<DomainPoint>>,
    future_map: SharedFutureMap,
    reduced: SharedFuture,
}

impl ReplIndexTask {
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        task_name: &'static str,
        regions: Vec<RegionRequirement>,
        domain: Domain,
        point_body: impl Fn(DomainPoint) -> Vec<u8> + Send + Sync + 'static,
        reduction: Option<ReductionFold>,
    ) -> Result<Arc<ReplIndexTask>, RuntimeError> {
        let sharding_collective_id = shard.next_collective_id();
        let exchange_collective_id = shard.next_collective_id();
        let task = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), regions),
            shard: Arc::clone(shard),
            task_name,
            domain,
            point_body: Arc::new(point_body),
            reduction,
            sharding_collective_id,
            exchange_collective_id,
            owned_points: Mutex::new(Vec::new()),
            future_map: Arc::new(Mutex::new(BTreeMap::new())),
            reduced: Arc::new(Mutex::new(None)),
        });
        let op: ArcOp = task.clone();
        launch_operation(rt, op, Event::NO_EVENT)?;
        Ok(task)
    }

    pub fn owned_points(&self) -> Vec<DomainPoint> {
        self.owned_points.lock().clone()
    }

    /// The merged future map; identical on every shard once complete.
    pub fn future_map(&self) -> BTreeMap<u64, Vec<u8>> {
        self.future_map.lock().clone()
    }

    /// The folded reduction value; identical on every shard once complete.
    pub fn reduced_value(&self) -> Option<Vec<u8>> {
        self.reduced.lock().clone()
    }

    fn desc(&self) -> MappableDesc {
        MappableDesc {
            uid: self.core.unique_id(),
            kind: OpKind::IndexTask,
            task_name: self.task_name.to_string(),
        }
    }
}

impl OperationLike for ReplIndexTask {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::IndexTask
    }

    fn logging_name(&self) -> &'static str {
        self.task_name
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let function =
            select_sharding_function(rt, &self.shard, &self.desc(), self.sharding_collective_id);
        // restrict the launch to the points this shard owns
        let points = function.shard_points(self.shard.shard_id(), &self.domain);
        debug!(target: "tessera::repl", shard = %self.shard.shard_id(), owned = points.len(),
            "index task restricted");
        *self.owned_points.lock() = points;
        self.core.complete_mapping(rt, Event::NO_EVENT);
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let points = self.owned_points();
        let mut local_results = BTreeMap::new();
        for point in points {
            let value = (self.point_body)(point);
            local_results.insert(self.domain.linearize(&point), value);
        }

        match &self.reduction {
            Some(fold) => {
                // fold the local points in domain order, then exchange the
                // per-shard partials
                let mut partial = Vec::new();
                for value in local_results.values() {
                    fold(&mut partial, value);
                }
                let exchange = FutureExchange::with_id(
                    &self.shard,
                    self.exchange_collective_id,
                    partial,
                );
                exchange.perform();

                let done = exchange.done_event();
                let reduced = Arc::clone(&self.reduced);
                let fold = Arc::clone(fold);
                done.add_waiter(Box::new(move |_poisoned: bool| {
                    // apply the partial results in shard-id order so every
                    // shard folds bitwise identically
                    let value = exchange.reduce_futures(|acc, item| fold(acc, item));
                    *reduced.lock() = Some(value);
                }));
                self.core.complete_execution(rt, done);
            },
            None => {
                let initial = FutureMapPayload { points: local_results };
                let exchange: Arc<FutureNameExchange> =
                    AllGather::with_id(&self.shard, self.exchange_collective_id, initial);
                exchange.perform();

                let done = exchange.done_event();
                let future_map = Arc::clone(&self.future_map);
                let shard = Arc::clone(&self.shard);
                let receiver = Arc::clone(&exchange);
                done.add_waiter(Box::new(move |_poisoned: bool| {
                    let merged = receiver.wait_result().points;
                    shard.manager().record_future_map(shard.shard_id(), merged.clone());
                    *future_map.lock() = merged;
                }));
                self.core.complete_execution(rt, done);
            },
        }
    }
}

// REPL FILL AND COPY
// ================================================================================================

/// A replicated fill: the sharding function selects the one shard that
/// performs the fill; the others observe it through the versioning
/// broadcast only.
pub struct ReplFillOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    value: Vec<u8>,
    sharding_collective_id: CollectiveId,
    versioning_collective_id: CollectiveId,
    owner_shard: Mutex<ShardId>,
    versioning: Mutex<Option<VersioningInfoBroadcast>>,
}

impl ReplFillOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        regions: Vec<RegionRequirement>,
        value: Vec<u8>,
    ) -> Result<Arc<ReplFillOp>, RuntimeError> {
        let sharding_collective_id = shard.next_collective_id();
        let versioning_collective_id = shard.next_collective_id();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), regions),
            shard: Arc::clone(shard),
            value,
            sharding_collective_id,
            versioning_collective_id,
            owner_shard: Mutex::new(ShardId::INVALID),
            versioning: Mutex::new(None),
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }

    pub fn owner_shard(&self) -> ShardId {
        *self.owner_shard.lock()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl OperationLike for ReplFillOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Fill
    }

    fn logging_name(&self) -> &'static str {
        "ReplFill"
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let desc = MappableDesc {
            uid: self.core.unique_id(),
            kind: OpKind::Fill,
            task_name: "ReplFill".to_string(),
        };
        let function =
            select_sharding_function(rt, &self.shard, &desc, self.sharding_collective_id);
        let point = DomainPoint::new_1d(0);
        let domain = Domain::new_1d(0, 0);
        let owner = function.find_owner(&point, &domain);
        *self.owner_shard.lock() = owner;

        let versioning =
            VersioningInfoBroadcast::with_id(&self.shard, self.versioning_collective_id, owner);
        if owner == self.shard.shard_id() {
            let mut advance = VersioningAdvance::default();
            for (index, req) in self.core.regions().iter().enumerate() {
                if req.privilege.is_write() {
                    advance
                        .states
                        .entry(index as u32)
                        .or_default()
                        .push(self.core.unique_id().as_raw());
                }
            }
            versioning.broadcast_states(advance);
            *self.versioning.lock() = Some(versioning);
            self.core.complete_mapping(rt, Event::NO_EVENT);
        } else {
            let ready = versioning.done_event();
            *self.versioning.lock() = Some(versioning);
            self.core.complete_mapping(rt, ready);
        }
    }
}

/// A replicated copy; structured exactly like [`ReplFillOp`], with the
/// owner shard additionally driving a transfer when a payload is attached.
pub struct ReplCopyOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    payload: Option<tessera_runtime::ops::CopyPayload>,
    sharding_collective_id: CollectiveId,
    versioning_collective_id: CollectiveId,
    owner_shard: Mutex<ShardId>,
    versioning: Mutex<Option<VersioningInfoBroadcast>>,
}

impl ReplCopyOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        regions: Vec<RegionRequirement>,
        payload: Option<tessera_runtime::ops::CopyPayload>,
    ) -> Result<Arc<ReplCopyOp>, RuntimeError> {
        let sharding_collective_id = shard.next_collective_id();
        let versioning_collective_id = shard.next_collective_id();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), regions),
            shard: Arc::clone(shard),
            payload,
            sharding_collective_id,
            versioning_collective_id,
            owner_shard: Mutex::new(ShardId::INVALID),
            versioning: Mutex::new(None),
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }

    pub fn owner_shard(&self) -> ShardId {
        *self.owner_shard.lock()
    }
}

impl OperationLike for ReplCopyOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Copy
    }

    fn logging_name(&self) -> &'static str {
        "ReplCopy"
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let desc = MappableDesc {
            uid: self.core.unique_id(),
            kind: OpKind::Copy,
            task_name: "ReplCopy".to_string(),
        };
        let function =
            select_sharding_function(rt, &self.shard, &desc, self.sharding_collective_id);
        let point = DomainPoint::new_1d(0);
        let domain = Domain::new_1d(0, 0);
        let owner = function.find_owner(&point, &domain);
        *self.owner_shard.lock() = owner;

        let versioning =
            VersioningInfoBroadcast::with_id(&self.shard, self.versioning_collective_id, owner);
        if owner == self.shard.shard_id() {
            versioning.broadcast_states(VersioningAdvance::default());
            *self.versioning.lock() = Some(versioning);
            self.core.complete_mapping(rt, Event::NO_EVENT);
        } else {
            let ready = versioning.done_event();
            *self.versioning.lock() = Some(versioning);
            self.core.complete_mapping(rt, ready);
        }
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        if self.owner_shard() != self.shard.shard_id() {
            self.core.complete_execution(rt, Event::NO_EVENT);
            return;
        }
        match &self.payload {
            Some(payload) => {
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
                    .expect("replicated copy rejected by the DMA system");
                self.core.complete_execution(rt, fence);
            },
            None => self.core.complete_execution(rt, Event::NO_EVENT),
        }
    }
}

// REPL DELETION
// ================================================================================================

/// A replicated deletion: every shard registers the bookkeeping locally,
/// but only shard zero performs the destructive region-tree mutation, after
/// all shards have arrived at the deletion barrier.
pub struct ReplDeletionOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    target: DeletionTarget,
    /// Drawn at launch so every shard sees the same generation for the
    /// same deletion site.
    barrier: tessera_core::Barrier,
}

impl ReplDeletionOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        target: DeletionTarget,
    ) -> Result<Arc<ReplDeletionOp>, RuntimeError> {
        let barrier = shard.manager().next_deletion_barrier();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), Vec::new()),
            shard: Arc::clone(shard),
            target,
            barrier,
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for ReplDeletionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Deletion
    }

    fn logging_name(&self) -> &'static str {
        "ReplDeletion"
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let barrier = self.barrier.clone();
        barrier.arrive(1);

        if self.shard.shard_id() == ShardId::new(0) {
            // the destructive mutation happens exactly once, after every
            // shard has reached this deletion
            let op = self.core.op();
            let rt2 = Arc::clone(rt);
            let target = self.target.clone();
            let gate = tessera_core::UserEvent::new();
            let effects = gate.event();
            barrier.completion().add_waiter(Box::new(move |_poisoned: bool| {
                match &target {
                    DeletionTarget::IndexSpace(space) => {
                        rt2.forest().destroy_index_space(*space)
                    },
                    DeletionTarget::FieldSpace(space) => {
                        rt2.forest().destroy_field_space(*space)
                    },
                    DeletionTarget::Fields { field_space, fields } => {
                        rt2.forest().free_fields(*field_space, *fields)
                    },
                    DeletionTarget::Region(region) => rt2.forest().destroy_region(*region),
                }
                debug!(target: "tessera::repl", uid = %op.core().unique_id(),
                    "replicated deletion applied");
                gate.trigger();
            }));
            self.core.complete_execution(rt, effects);
        } else {
            // non-zero shards record the deletion locally only
            self.core.complete_execution(rt, barrier.completion());
        }
    }
}

// REPL TIMING
// ================================================================================================

/// A replicated timing measurement: shard zero reads the clock and
/// broadcasts the value so every shard observes the same measurement.
pub struct ReplTimingOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    measurement: TimingKind,
    preconditions: Vec<Event>,
    broadcast_collective_id: CollectiveId,
    result: SharedFuture,
}

impl ReplTimingOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        measurement: TimingKind,
        preconditions: Vec<Event>,
    ) -> Result<Arc<ReplTimingOp>, RuntimeError> {
        let broadcast_collective_id = shard.next_collective_id();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), Vec::new()),
            shard: Arc::clone(shard),
            measurement,
            preconditions,
            broadcast_collective_id,
            result: Arc::new(Mutex::new(None)),
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }

    /// The measured value, identical on every shard once complete.
    pub fn result(&self) -> Option<i64> {
        self.result
            .lock()
            .as_ref()
            .map(|bytes| i64::from_le_bytes(bytes[..8].try_into().expect("short timing value")))
    }

    fn measure_now(&self) -> i64 {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        match self.measurement {
            TimingKind::Seconds => elapsed.as_secs() as i64,
            TimingKind::MicroSeconds => elapsed.as_micros() as i64,
            TimingKind::NanoSeconds => elapsed.as_nanos() as i64,
        }
    }
}

impl OperationLike for ReplTimingOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Timing
    }

    fn logging_name(&self) -> &'static str {
        "ReplTiming"
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let wait_on = Event::merge(&self.preconditions);
        self.core.complete_mapping(rt, wait_on);
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let owner = ShardId::new(0);
        let broadcast =
            FutureBroadcast::with_id(&self.shard, self.broadcast_collective_id, owner);
        if self.shard.shard_id() == owner {
            let value = self.measure_now().to_le_bytes().to_vec();
            *self.result.lock() = Some(value.clone());
            broadcast.broadcast(FutureValue(value));
            self.core.complete_execution(rt, Event::NO_EVENT);
        } else {
            let done = broadcast.done_event();
            let result = Arc::clone(&self.result);
            let receiver = Arc::clone(&broadcast);
            done.add_waiter(Box::new(move |_poisoned: bool| {
                *result.lock() = Some(receiver.wait_value().0);
            }));
            self.core.complete_execution(rt, done);
        }
    }
}

// REPL MUST EPOCH
// ================================================================================================

type MustEpochPointBody = Arc<dyn Fn(DomainPoint) -> Vec<u8> + Send + Sync>;

/// A replicated must-epoch launch: the mapper's output is either broadcast
/// from shard zero or merged across shards with a deterministic tie-break;
/// point ownership and completion are exchanged so every shard observes the
/// same epoch.
pub struct ReplMustEpochOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    task_names: Vec<&'static str>,
    constraint_count: usize,
    domain: Domain,
    point_body: MustEpochPointBody,
    sharding_collective_id: CollectiveId,
    mapping_broadcast_id: CollectiveId,
    mapping_exchange_id: CollectiveId,
    dependence_exchange_id: CollectiveId,
    completion_exchange_id: CollectiveId,
    constraint_mappings: Arc<Mutex<BTreeMap<u32, ConstraintChoice>>>,
    point_owners: Arc<Mutex<BTreeMap<u64, u32>>>,
    results: SharedFutureMap,
}

impl ReplMustEpochOp {
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        task_names: Vec<&'static str>,
        constraint_count: usize,
        domain: Domain,
        point_body: impl Fn(DomainPoint) -> Vec<u8> + Send + Sync + 'static,
    ) -> Result<Arc<ReplMustEpochOp>, RuntimeError> {
        let sharding_collective_id = shard.next_collective_id();
        let mapping_broadcast_id = shard.next_collective_id();
        let mapping_exchange_id = shard.next_collective_id();
        let dependence_exchange_id = shard.next_collective_id();
        let completion_exchange_id = shard.next_collective_id();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), Vec::new()),
            shard: Arc::clone(shard),
            task_names,
            constraint_count,
            domain,
            point_body: Arc::new(point_body),
            sharding_collective_id,
            mapping_broadcast_id,
            mapping_exchange_id,
            dependence_exchange_id,
            completion_exchange_id,
            constraint_mappings: Arc::new(Mutex::new(BTreeMap::new())),
            point_owners: Arc::new(Mutex::new(BTreeMap::new())),
            results: Arc::new(Mutex::new(BTreeMap::new())),
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }

    /// The merged constraint mappings, identical on every shard.
    pub fn constraint_mappings(&self) -> BTreeMap<u32, ConstraintChoice> {
        self.constraint_mappings.lock().clone()
    }

    /// The exchanged point-to-shard ownership, identical on every shard.
    pub fn point_owners(&self) -> BTreeMap<u64, u32> {
        self.point_owners.lock().clone()
    }

    pub fn results(&self) -> BTreeMap<u64, Vec<u8>> {
        self.results.lock().clone()
    }
}

impl OperationLike for ReplMustEpochOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::MustEpoch
    }

    fn logging_name(&self) -> &'static str {
        "ReplMustEpoch"
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let mapper = rt.find_mapper(MapperId::new(0));
        let desc = MappableDesc {
            uid: self.core.unique_id(),
            kind: OpKind::MustEpoch,
            task_name: "ReplMustEpoch".to_string(),
        };
        let sharding = mapper.select_must_epoch_sharding_functor(&desc);
        if sharding.chosen_functor == ShardingId::INVALID {
            rt.report_fatal(RuntimeError::InvalidShardingFunctor {
                mapper: mapper.name().to_string(),
                kind: OpKind::MustEpoch,
                task: desc.task_name.clone(),
                uid: desc.uid,
            });
        }
        let agreement = ShardingGatherCollective::with_id(
            &self.shard,
            self.sharding_collective_id,
            ShardId::new(0),
        );
        agreement.contribute(sharding.chosen_functor);
        if agreement.is_target() {
            agreement.validate_async(
                sharding.chosen_functor,
                RuntimeError::InconsistentShardingFunctor {
                    mapper: mapper.name().to_string(),
                    kind: OpKind::MustEpoch,
                    task: desc.task_name,
                    uid: desc.uid,
                },
            );
        }
        let function = self
            .shard
            .manager()
            .find_sharding_function(sharding.chosen_functor)
            .unwrap_or_else(|| {
                rt.report_fatal(RuntimeError::InvalidShardingFunctor {
                    mapper: mapper.name().to_string(),
                    kind: OpKind::MustEpoch,
                    task: "ReplMustEpoch".to_string(),
                    uid: self.core.unique_id(),
                })
            });

        let local = self.shard.shard_id();
        let input = MustEpochMapInput {
            tasks: self
                .task_names
                .iter()
                .map(|name| MappableDesc {
                    uid: self.core.unique_id(),
                    kind: OpKind::Task,
                    task_name: name.to_string(),
                })
                .collect(),
            constraint_count: self.constraint_count,
            shard_mapping: self.shard.manager().shard_mapping(),
            local_shard: local,
        };
        let output = mapper.map_must_epoch(&input);

        // exchange point ownership so every shard can wire the epoch's
        // mapping dependences; mapping is not complete until both the
        // mapping merge and the ownership exchange have landed
        let mut owners = PointOwnerMap::default();
        for point in self.domain.points() {
            let owner = function.find_owner(&point, &self.domain);
            if owner == local {
                owners.owners.insert(self.domain.linearize(&point), owner.as_raw());
            }
        }
        let dependence: Arc<MustEpochDependenceExchange> =
            AllGather::with_id(&self.shard, self.dependence_exchange_id, owners);
        dependence.perform();
        let point_owners = Arc::clone(&self.point_owners);
        let dependence_receiver = Arc::clone(&dependence);
        let dependence_done = dependence.done_event();
        dependence_done.add_waiter(Box::new(move |_poisoned: bool| {
            *point_owners.lock() = dependence_receiver.wait_result().owners;
        }));

        let mappings = Arc::clone(&self.constraint_mappings);
        if sharding.collective_map_must_epoch {
            // every shard maps and the results merge with a deterministic
            // tie-break
            let mut initial = ConstraintMappings::default();
            for (constraint, mapping) in output.constraint_mappings.iter().enumerate() {
                if *mapping == 0 {
                    continue;
                }
                initial.choices.insert(
                    constraint as u32,
                    ConstraintChoice {
                        weight: output.weights.get(constraint).copied().unwrap_or(0) as i64,
                        origin_shard: local.as_raw(),
                        mapping: *mapping,
                    },
                );
            }
            let exchange: Arc<MustEpochMappingExchange> =
                AllGather::with_id(&self.shard, self.mapping_exchange_id, initial);
            exchange.perform();
            let done = exchange.done_event();
            let receiver = Arc::clone(&exchange);
            done.add_waiter(Box::new(move |_poisoned: bool| {
                *mappings.lock() = receiver.wait_result().choices;
            }));
            self.core.complete_mapping(rt, Event::merge(&[done, dependence_done]));
        } else {
            // shard zero maps alone and broadcasts its output
            let broadcast: Arc<MustEpochMappingBroadcast> = MustEpochMappingBroadcast::with_id(
                &self.shard,
                self.mapping_broadcast_id,
                ShardId::new(0),
            );
            if local == ShardId::new(0) {
                broadcast.broadcast(MustEpochMappingPayload {
                    task_processors: output.task_processors.clone(),
                    constraint_mappings: output.constraint_mappings.clone(),
                    weights: output.weights.iter().map(|weight| *weight as i64).collect(),
                });
            }
            let done = broadcast.done_event();
            let receiver = Arc::clone(&broadcast);
            done.add_waiter(Box::new(move |_poisoned: bool| {
                let payload = receiver.wait_value();
                let mut merged = BTreeMap::new();
                for (constraint, mapping) in payload.constraint_mappings.iter().enumerate() {
                    merged.insert(
                        constraint as u32,
                        ConstraintChoice {
                            weight: payload.weights.get(constraint).copied().unwrap_or(0),
                            origin_shard: 0,
                            mapping: *mapping,
                        },
                    );
                }
                *mappings.lock() = merged;
            }));
            self.core.complete_mapping(rt, Event::merge(&[done, dependence_done]));
        }
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let local = self.shard.shard_id();
        // run the points this shard owns
        let owned: Vec<DomainPoint> = self
            .domain
            .points()
            .filter(|point| {
                self.point_owners.lock().get(&self.domain.linearize(point)).copied()
                    == Some(local.as_raw())
            })
            .collect();
        {
            let mut results = self.results.lock();
            for point in owned {
                results.insert(self.domain.linearize(&point), (self.point_body)(point));
            }
        }

        // all shards rendezvous on completion of the epoch
        let mut initial = ShardSet::default();
        initial.shards.insert(local.as_raw());
        let completion: Arc<MustEpochCompletionExchange> =
            AllGather::with_id(&self.shard, self.completion_exchange_id, initial);
        completion.perform();
        self.core.complete_execution(rt, completion.done_event());
    }
}

// REPL DEPENDENT PARTITION
// ================================================================================================

/// The thunk of a replicated dependent partition: how the per-shard field
/// descriptors are combined and who invokes the partition primitive.
pub enum PartitionThunk {
    /// All-to-all exchange; every shard invokes the primitive with the full
    /// descriptor set.
    ByField,
    /// Gather to a designated shard which alone invokes the primitive.
    ByImage { range: bool },
    /// Gather flavor for preimages.
    ByPreimage { range: bool },
}

impl PartitionThunk {
    fn kind(&self) -> DependentPartitionKind {
        match self {
            Self::ByField => DependentPartitionKind::ByField,
            Self::ByImage { range: false } => DependentPartitionKind::ByImage,
            Self::ByImage { range: true } => DependentPartitionKind::ByImageRange,
            Self::ByPreimage { range: false } => DependentPartitionKind::ByPreimage,
            Self::ByPreimage { range: true } => DependentPartitionKind::ByPreimageRange,
        }
    }
}

/// A replicated dependent-partition operation.
pub struct ReplDependentPartitionOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    thunk: PartitionThunk,
    parent: tessera_core::LogicalRegion,
    color_space: Domain,
    local_descriptors: Vec<FieldDescriptor>,
    sharding_collective_id: CollectiveId,
    exchange_collective_id: CollectiveId,
    /// Drawn at launch so every shard sees the same generation for the
    /// same partition site.
    barrier: tessera_core::Barrier,
}

impl ReplDependentPartitionOp {
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        thunk: PartitionThunk,
        parent: tessera_core::LogicalRegion,
        color_space: Domain,
        local_descriptors: Vec<FieldDescriptor>,
    ) -> Result<Arc<ReplDependentPartitionOp>, RuntimeError> {
        let sharding_collective_id = shard.next_collective_id();
        let exchange_collective_id = shard.next_collective_id();
        let barrier = shard.manager().next_pending_partition_barrier();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), Vec::new()),
            shard: Arc::clone(shard),
            thunk,
            parent,
            color_space,
            local_descriptors,
            sharding_collective_id,
            exchange_collective_id,
            barrier,
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }
}

impl OperationLike for ReplDependentPartitionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::DependentPartition
    }

    fn logging_name(&self) -> &'static str {
        "ReplDependentPartition"
    }

    fn trigger_mapping(&self, rt: &Arc<Runtime>) {
        let desc = MappableDesc {
            uid: self.core.unique_id(),
            kind: OpKind::DependentPartition,
            task_name: "ReplDependentPartition".to_string(),
        };
        // partitions are sharded too, so the functor agreement check runs
        // even though the thunk decides who computes
        let _function =
            select_sharding_function(rt, &self.shard, &desc, self.sharding_collective_id);
        self.core.complete_mapping(rt, Event::NO_EVENT);
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let kind = self.thunk.kind();
        let barrier = self.barrier.clone();
        let mut contribution = DescriptorSet::default();
        contribution.descriptors.extend(self.local_descriptors.iter().copied());

        match &self.thunk {
            PartitionThunk::ByField => {
                // all-to-all: every shard ends with the full descriptor set
                // and invokes the primitive identically
                let exchange: Arc<FieldDescriptorExchange> =
                    AllGather::with_id(&self.shard, self.exchange_collective_id, contribution);
                exchange.perform();

                let rt2 = Arc::clone(rt);
                let parent = self.parent;
                let color_space = self.color_space;
                let receiver = Arc::clone(&exchange);
                let barrier2 = barrier.clone();
                exchange.done_event().add_waiter(Box::new(move |_poisoned: bool| {
                    let merged: Vec<FieldDescriptor> =
                        receiver.wait_result().descriptors.into_iter().collect();
                    rt2.forest().create_dependent_partition(
                        kind,
                        parent,
                        color_space,
                        &merged,
                    );
                    barrier2.arrive(1);
                }));
                self.core.complete_execution(rt, barrier.completion());
            },
            PartitionThunk::ByImage { .. } | PartitionThunk::ByPreimage { .. } => {
                // gather to the designated shard, which alone computes the
                // partition; everyone else waits at the barrier
                let target = ShardId::new(0);
                let gather: Arc<FieldDescriptorGather> = FieldDescriptorGather::with_id(
                    &self.shard,
                    self.exchange_collective_id,
                    target,
                );
                gather.contribute(contribution);

                if self.shard.shard_id() == target {
                    let rt2 = Arc::clone(rt);
                    let parent = self.parent;
                    let color_space = self.color_space;
                    let receiver = Arc::clone(&gather);
                    let barrier2 = barrier.clone();
                    gather.done_event().add_waiter(Box::new(move |_poisoned: bool| {
                        let mut merged = DescriptorSet::default();
                        for set in receiver.wait_items() {
                            merged.descriptors.extend(set.descriptors);
                        }
                        let descriptors: Vec<FieldDescriptor> =
                            merged.descriptors.into_iter().collect();
                        rt2.forest().create_dependent_partition(
                            kind,
                            parent,
                            color_space,
                            &descriptors,
                        );
                        barrier2.arrive(1);
                    }));
                } else {
                    barrier.arrive(1);
                }
                self.core.complete_execution(rt, barrier.completion());
            },
        }
    }
}

// REPL PENDING PARTITION
// ================================================================================================

/// A replicated pending partition: each shard fills in the subspaces for
/// its slice of the color space with pure local index-space math. Unlike
/// dependent partitions there is no collective exchange at all; the
/// pending-partition barrier is the only cross-shard synchronization.
pub struct ReplPendingPartitionOp {
    core: OpCore,
    shard: Arc<ShardContext>,
    kind: PendingPartitionKind,
    parent: tessera_core::LogicalRegion,
    color_space: Domain,
    /// Drawn at launch so every shard sees the same generation for the
    /// same partition site.
    barrier: tessera_core::Barrier,
}

impl ReplPendingPartitionOp {
    pub fn launch(
        rt: &Arc<Runtime>,
        shard: &Arc<ShardContext>,
        kind: PendingPartitionKind,
        parent: tessera_core::LogicalRegion,
        color_space: Domain,
    ) -> Result<Arc<ReplPendingPartitionOp>, RuntimeError> {
        let barrier = shard.manager().next_pending_partition_barrier();
        let op = Arc::new(Self {
            core: OpCore::new(rt, shard.context().context_id(), Vec::new()),
            shard: Arc::clone(shard),
            kind,
            parent,
            color_space,
            barrier,
        });
        let arc: ArcOp = op.clone();
        launch_operation(rt, arc, Event::NO_EVENT)?;
        Ok(op)
    }

    /// The colors this shard computes: its round-robin slice of the color
    /// space, identical on every shard by construction.
    pub fn owned_colors(&self) -> Vec<DomainPoint> {
        let total = self.shard.total_shards() as u64;
        let local = self.shard.shard_id().as_raw() as u64;
        self.color_space
            .points()
            .filter(|color| self.color_space.linearize(color) % total == local)
            .collect()
    }
}

impl OperationLike for ReplPendingPartitionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::PendingPartition
    }

    fn logging_name(&self) -> &'static str {
        "ReplPendingPartition"
    }

    fn trigger_execution(&self, rt: &Arc<Runtime>) {
        let colors = self.owned_colors();
        debug!(target: "tessera::repl", shard = %self.shard.shard_id(), kind = ?self.kind,
            colors = colors.len(), "pending partition slice");
        rt.forest().compute_pending_partition(self.kind, self.parent, self.color_space, &colors);
        let barrier = self.barrier.clone();
        barrier.arrive(1);
        self.core.complete_execution(rt, barrier.completion());
    }
}

// RE-EXPORT HELPERS
// ================================================================================================

/// Shorthand used by tests and front ends: folds little-endian i64 values
/// by addition, a bitwise-deterministic reduction.
pub fn sum_i64_fold() -> ReductionFold {
    Arc::new(|acc: &mut Vec<u8>, value: &[u8]| {
        let current = if acc.is_empty() {
            0
        } else {
            i64::from_le_bytes(acc[..8].try_into().expect("short accumulator"))
        };
        let incoming = i64::from_le_bytes(value[..8].try_into().expect("short contribution"));
        *acc = (current + incoming).to_le_bytes().to_vec();
    })
}
