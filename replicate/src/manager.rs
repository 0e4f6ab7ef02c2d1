use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use parking_lot::{Mutex, RwLock};
use tessera_core::{
    Barrier, BarrierSpace, CollectiveId, DistributedId, Event, MessageHandler, MessageKind,
    NodeId, ReplicationId, ShardId, ShardingId, TaskId, UserEvent,
    utils::{Deserializable, Serializable},
};
use tessera_runtime::{Runtime, TaskContext};
use tracing::{debug, info, warn};

use crate::{
    collective::Collective,
    messages::{
        CloneBarrierMessage, CollectiveMessage, CompositeViewRequestMessage,
        FutureMapRequestMessage, ReplicateDeleteMessage, ReplicateLaunchMessage,
        ReplicatePostMappedMessage, ReplicateTriggerCommitMessage,
        ReplicateTriggerCompleteMessage, TopViewRequestMessage, TopViewResponseMessage,
    },
    sharding::ShardingFunction,
};

// SHARD CONTEXT
// ================================================================================================

/// The per-shard view of a control-replicated task: the shard's own task
/// context plus the collective-id sequence shared with its sibling shards.
///
/// Collective ids are allocated in program order; since every shard runs the
/// same program, identical sites draw identical ids without coordination.
pub struct ShardContext {
    shard_id: ShardId,
    manager: Arc<ShardManager>,
    ctx: Arc<dyn TaskContext>,
    next_collective: AtomicU64,
    /// Top views this shard materialized, as (manager did, view did).
    created_top_views: Mutex<Vec<(DistributedId, DistributedId)>>,
}

impl ShardContext {
    fn new(shard_id: ShardId, manager: Arc<ShardManager>, ctx: Arc<dyn TaskContext>) -> Arc<Self> {
        Arc::new(Self {
            shard_id,
            manager,
            ctx,
            next_collective: AtomicU64::new(0),
            created_top_views: Mutex::new(Vec::new()),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn total_shards(&self) -> u32 {
        self.manager.total_shards()
    }

    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    /// This shard's task context; child operations launch here.
    pub fn context(&self) -> &Arc<dyn TaskContext> {
        &self.ctx
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.manager.runtime()
    }

    /// Allocates the next collective id at this site.
    pub fn next_collective_id(&self) -> CollectiveId {
        CollectiveId::new(self.next_collective.fetch_add(1, Ordering::SeqCst))
    }

    pub fn collective_radix(&self) -> u32 {
        self.manager.collective_radix()
    }

    /// Materializes the instance top view for a physical manager through
    /// this shard's context.
    pub fn create_instance_top_view(&self, manager_did: DistributedId) -> DistributedId {
        let view_did = self.runtime().allocate_distributed_id();
        debug!(target: "tessera::repl", shard = %self.shard_id, %manager_did, %view_did,
            "created instance top view");
        self.created_top_views.lock().push((manager_did, view_did));
        view_did
    }

    /// The top views this shard has materialized so far.
    pub fn created_top_views(&self) -> Vec<(DistributedId, DistributedId)> {
        self.created_top_views.lock().clone()
    }
}

// REPL BODY
// ================================================================================================

/// The body every shard of a replicated task runs. Registered per node
/// under a [`TaskId`], the way task variants are registered with a runtime.
pub trait ReplBody: Send + Sync {
    fn run(&self, rt: &Arc<Runtime>, shard: &Arc<ShardContext>);
}

impl<F> ReplBody for F
where
    F: Fn(&Arc<Runtime>, &Arc<ShardContext>) + Send + Sync,
{
    fn run(&self, rt: &Arc<Runtime>, shard: &Arc<ShardContext>) {
        self(rt, shard)
    }
}

// SHARD MANAGER
// ================================================================================================

/// The per-phase barriers shared by all shards of a launch.
#[derive(Clone)]
pub struct ReplBarriers {
    pub startup: Barrier,
    pub pending_partition: Barrier,
    pub future_map: Barrier,
    pub creation: Barrier,
    pub deletion: Barrier,
}

impl ReplBarriers {
    fn allocate(space: &BarrierSpace, arrivals: usize) -> Self {
        Self {
            startup: space.create_barrier(arrivals),
            pending_partition: space.create_barrier(arrivals),
            future_map: space.create_barrier(arrivals),
            creation: space.create_barrier(arrivals),
            deletion: space.create_barrier(arrivals),
        }
    }
}

struct ManagerState {
    local_mapped: usize,
    remote_mapped: usize,
    local_complete: usize,
    remote_complete: usize,
    local_commit: usize,
    remote_commit: usize,
    remote_constituents: usize,
    expected_local: usize,
    first_future: bool,
    future: Option<Vec<u8>>,
    future_maps: HashMap<ShardId, BTreeMap<u64, Vec<u8>>>,
    top_views: HashMap<DistributedId, DistributedId>,
    top_view_waiters: HashMap<DistributedId, Vec<UserEvent>>,
    clone_barriers: HashMap<u32, tessera_core::BarrierToken>,
    unique_shard_spaces: BTreeSet<NodeId>,
}

/// Owns the lifecycle of one control-replicated task launch on one node:
/// shard creation and routing, collective message delivery, quorum
/// aggregation toward the origin, and the sharding-function cache.
pub struct ShardManager {
    rt: Weak<Runtime>,
    repl_id: ReplicationId,
    task_id: TaskId,
    total_shards: u32,
    control_replicated: bool,
    top_level: bool,
    owner_node: NodeId,
    collective_radix: u32,
    barriers: ReplBarriers,
    address_spaces: RwLock<Vec<NodeId>>,
    shard_mapping: RwLock<Vec<u64>>,
    local_shards: Mutex<Vec<Arc<ShardContext>>>,
    state: Mutex<ManagerState>,
    collectives: Mutex<HashMap<(ShardId, CollectiveId), Weak<dyn Collective>>>,
    pending_collectives: Mutex<HashMap<(ShardId, CollectiveId), Vec<Vec<u8>>>>,
    sharding_functions: Mutex<HashMap<ShardingId, Arc<ShardingFunction>>>,
    /// Rolling barrier generations handed to successive deletion and
    /// dependent-partition sites; every shard advances them in lockstep.
    deletion_barrier_seq: Mutex<Barrier>,
    pending_partition_barrier_seq: Mutex<Barrier>,
    creation_barrier_seq: Mutex<Barrier>,
    /// Aggregate lifecycle events, meaningful on the origin node.
    mapped: UserEvent,
    completed: UserEvent,
    committed: UserEvent,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    self_ref: Mutex<Weak<ShardManager>>,
}

impl ShardManager {
    /// Creates the origin-side manager for a fresh launch. `shard_nodes`
    /// maps each shard to the node that will run it.
    pub fn new_origin(
        rt: &Arc<Runtime>,
        task_id: TaskId,
        shard_nodes: Vec<NodeId>,
        shard_mapping: Vec<u64>,
        control_replicated: bool,
        top_level: bool,
    ) -> Arc<Self> {
        let total_shards = shard_nodes.len() as u32;
        assert!(total_shards > 0, "a replicated launch needs at least one shard");
        let repl_id = rt.allocate_replication_id();
        let barriers = ReplBarriers::allocate(rt.barrier_space(), total_shards as usize);
        Self::build(
            rt,
            repl_id,
            task_id,
            total_shards,
            control_replicated,
            top_level,
            rt.node(),
            barriers,
            shard_nodes,
            shard_mapping,
        )
    }

    /// Reconstructs a manager on a remote node from a launch envelope.
    pub fn from_launch(rt: &Arc<Runtime>, msg: &ReplicateLaunchMessage, from: NodeId) -> Arc<Self> {
        let space = rt.barrier_space();
        let resolve = |token| space.resolve(token).expect("barrier token from unknown space");
        let barriers = ReplBarriers {
            startup: resolve(msg.startup_barrier),
            pending_partition: resolve(msg.pending_partition_barrier),
            future_map: resolve(msg.future_map_barrier),
            creation: resolve(msg.creation_barrier),
            deletion: resolve(msg.deletion_barrier),
        };
        Self::build(
            rt,
            msg.repl_id,
            msg.task_id,
            msg.total_shards,
            msg.control_replicated,
            msg.top_level,
            from,
            barriers,
            msg.address_space_mapping.clone(),
            msg.shard_mapping.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        rt: &Arc<Runtime>,
        repl_id: ReplicationId,
        task_id: TaskId,
        total_shards: u32,
        control_replicated: bool,
        top_level: bool,
        owner_node: NodeId,
        barriers: ReplBarriers,
        address_spaces: Vec<NodeId>,
        shard_mapping: Vec<u64>,
    ) -> Arc<Self> {
        let deletion_seq = barriers.deletion.clone();
        let pending_partition_seq = barriers.pending_partition.clone();
        let creation_seq = barriers.creation.clone();
        let manager = Arc::new(Self {
            rt: Arc::downgrade(rt),
            repl_id,
            task_id,
            total_shards,
            control_replicated,
            top_level,
            owner_node,
            collective_radix: rt.config().collective_radix.max(2) as u32,
            barriers,
            address_spaces: RwLock::new(address_spaces),
            shard_mapping: RwLock::new(shard_mapping),
            local_shards: Mutex::new(Vec::new()),
            state: Mutex::new(ManagerState {
                local_mapped: 0,
                remote_mapped: 0,
                local_complete: 0,
                remote_complete: 0,
                local_commit: 0,
                remote_commit: 0,
                remote_constituents: 0,
                expected_local: 0,
                first_future: true,
                future: None,
                future_maps: HashMap::new(),
                top_views: HashMap::new(),
                top_view_waiters: HashMap::new(),
                clone_barriers: HashMap::new(),
                unique_shard_spaces: BTreeSet::new(),
            }),
            collectives: Mutex::new(HashMap::new()),
            pending_collectives: Mutex::new(HashMap::new()),
            sharding_functions: Mutex::new(HashMap::new()),
            deletion_barrier_seq: Mutex::new(deletion_seq),
            pending_partition_barrier_seq: Mutex::new(pending_partition_seq),
            creation_barrier_seq: Mutex::new(creation_seq),
            mapped: UserEvent::new(),
            completed: UserEvent::new(),
            committed: UserEvent::new(),
            threads: Mutex::new(Vec::new()),
            self_ref: Mutex::new(Weak::new()),
        });
        *manager.self_ref.lock() = Arc::downgrade(&manager);
        manager
    }

    // PUBLIC ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn repl_id(&self) -> ReplicationId {
        self.repl_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn is_control_replicated(&self) -> bool {
        self.control_replicated
    }

    pub fn is_top_level(&self) -> bool {
        self.top_level
    }

    pub fn collective_radix(&self) -> u32 {
        self.collective_radix
    }

    pub fn barriers(&self) -> &ReplBarriers {
        &self.barriers
    }

    /// Hands out the next deletion-barrier generation; shards call this in
    /// lockstep so every shard of one deletion site sees the same
    /// generation.
    pub fn next_deletion_barrier(&self) -> Barrier {
        let mut seq = self.deletion_barrier_seq.lock();
        let current = seq.clone();
        *seq = seq.advance();
        current
    }

    /// Hands out the next pending-partition barrier generation.
    pub fn next_pending_partition_barrier(&self) -> Barrier {
        let mut seq = self.pending_partition_barrier_seq.lock();
        let current = seq.clone();
        *seq = seq.advance();
        current
    }

    /// Hands out the next creation barrier generation.
    pub fn next_creation_barrier(&self) -> Barrier {
        let mut seq = self.creation_barrier_seq.lock();
        let current = seq.clone();
        *seq = seq.advance();
        current
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime dropped while shard manager alive")
    }

    pub fn barrier_space(&self) -> Arc<BarrierSpace> {
        Arc::clone(self.runtime().barrier_space())
    }

    /// The node each shard runs on.
    pub fn address_spaces(&self) -> Vec<NodeId> {
        self.address_spaces.read().clone()
    }

    /// The shards this node runs, in launch order.
    pub fn local_shards(&self) -> Vec<Arc<ShardContext>> {
        self.local_shards.lock().clone()
    }

    pub fn set_shard_mapping(&self, mapping: Vec<u64>) {
        *self.shard_mapping.write() = mapping;
    }

    pub fn shard_mapping(&self) -> Vec<u64> {
        self.shard_mapping.read().clone()
    }

    /// Triggered when every shard on every node has mapped.
    pub fn mapped_event(&self) -> Event {
        self.mapped.event()
    }

    /// Triggered when every shard on every node has completed.
    pub fn completion_event(&self) -> Event {
        self.completed.event()
    }

    /// Triggered when every shard on every node has committed.
    pub fn commit_event(&self) -> Event {
        self.committed.event()
    }

    fn arc_self(&self) -> Arc<ShardManager> {
        self.self_ref.lock().upgrade().expect("shard manager outlived its arc")
    }

    // LAUNCH
    // --------------------------------------------------------------------------------------------

    /// Origin-side launch: groups shards by target node, ships one launch
    /// envelope per remote node, and starts the local shards.
    pub fn launch(&self, body: Arc<dyn ReplBody>) {
        let rt = self.runtime();
        let address_spaces = self.address_spaces.read().clone();
        let mut shard_groups: BTreeMap<NodeId, Vec<ShardId>> = BTreeMap::new();
        for (shard, node) in address_spaces.iter().enumerate() {
            shard_groups.entry(*node).or_default().push(ShardId::new(shard as u32));
        }

        // quorum expectations must be in place before any constituent can
        // report back
        let local_group = shard_groups.remove(&rt.node()).unwrap_or_default();
        {
            let mut state = self.state.lock();
            state.expected_local = local_group.len();
            state.remote_constituents = shard_groups.len();
        }

        for (node, shards) in shard_groups {
            let msg = ReplicateLaunchMessage {
                repl_id: self.repl_id,
                task_id: self.task_id,
                total_shards: self.total_shards,
                control_replicated: self.control_replicated,
                top_level: self.top_level,
                startup_barrier: self.barriers.startup.token(),
                address_space_mapping: address_spaces.clone(),
                pending_partition_barrier: self.barriers.pending_partition.token(),
                future_map_barrier: self.barriers.future_map.token(),
                creation_barrier: self.barriers.creation.token(),
                deletion_barrier: self.barriers.deletion.token(),
                shard_mapping: self.shard_mapping.read().clone(),
                shards,
            };
            info!(target: "tessera::repl", repl = %self.repl_id, target = %node,
                "distributing shards");
            rt.fabric().send(node, MessageKind::ReplicateLaunch, msg.to_bytes());
        }

        self.launch_local_shards(local_group, body);
    }

    /// Remote-side launch of this node's constituents.
    pub fn unpack_shards_and_launch(&self, shards: Vec<ShardId>, body: Arc<dyn ReplBody>) {
        self.launch_local_shards(shards, body);
    }

    fn launch_local_shards(&self, shards: Vec<ShardId>, body: Arc<dyn ReplBody>) {
        let rt = self.runtime();
        self.state.lock().expected_local = shards.len();
        for shard_id in shards {
            let ctx = rt.create_inner_context(
                rt.allocate_unique_id(),
                format!("shard{}-repl{}", shard_id, self.repl_id),
                0,
                None,
            );
            let shard = ShardContext::new(shard_id, self.arc_self(), ctx);
            self.local_shards.lock().push(Arc::clone(&shard));
            self.launch_shard(shard, Arc::clone(&body), Arc::clone(&rt));
        }
    }

    fn launch_shard(&self, shard: Arc<ShardContext>, body: Arc<dyn ReplBody>, rt: Arc<Runtime>) {
        let manager = self.arc_self();
        let handle = thread::Builder::new()
            .name(format!("shard-{}-{}", self.repl_id, shard.shard_id()))
            .spawn(move || {
                // all shards rendezvous before any of them starts issuing
                // operations
                manager.barriers.startup.arrive(1);
                manager.barriers.startup.wait();
                debug!(target: "tessera::repl", repl = %manager.repl_id,
                    shard = %shard.shard_id(), "shard started");

                body.run(&rt, &shard);

                manager.handle_post_mapped(true);
                shard.context().end_task();
                shard.context().children_complete_event().wait();
                manager.trigger_task_complete(true);
                shard.context().children_committed_event().wait();
                manager.trigger_task_commit(true);
            })
            .expect("failed to spawn shard thread");
        self.threads.lock().push(handle);
    }

    /// Joins the local shard threads; used by tests and teardown.
    pub fn join_local_shards(&self) {
        let threads = core::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    // QUORUM AGGREGATION
    // --------------------------------------------------------------------------------------------

    pub fn handle_post_mapped(&self, local: bool) {
        let notify = {
            let mut state = self.state.lock();
            if local {
                state.local_mapped += 1;
                debug_assert!(state.local_mapped <= state.expected_local);
            } else {
                state.remote_mapped += 1;
                debug_assert!(state.remote_mapped <= state.remote_constituents);
            }
            state.local_mapped == state.expected_local
                && state.remote_mapped == state.remote_constituents
        };
        if notify {
            self.forward_or_trigger(MessageKind::ReplicatePostMapped, &self.mapped);
        }
    }

    pub fn trigger_task_complete(&self, local: bool) {
        let notify = {
            let mut state = self.state.lock();
            if local {
                state.local_complete += 1;
            } else {
                state.remote_complete += 1;
            }
            state.local_complete == state.expected_local
                && state.remote_complete == state.remote_constituents
        };
        if notify {
            self.forward_or_trigger(MessageKind::ReplicateTriggerComplete, &self.completed);
        }
    }

    pub fn trigger_task_commit(&self, local: bool) {
        let notify = {
            let mut state = self.state.lock();
            if local {
                state.local_commit += 1;
            } else {
                state.remote_commit += 1;
            }
            state.local_commit == state.expected_local
                && state.remote_commit == state.remote_constituents
        };
        if notify {
            self.forward_or_trigger(MessageKind::ReplicateTriggerCommit, &self.committed);
        }
    }

    fn forward_or_trigger(&self, kind: MessageKind, event: &UserEvent) {
        let rt = self.runtime();
        if self.owner_node == rt.node() {
            event.trigger();
        } else {
            let payload = match kind {
                MessageKind::ReplicatePostMapped => {
                    ReplicatePostMappedMessage { repl_id: self.repl_id }.to_bytes()
                },
                MessageKind::ReplicateTriggerComplete => {
                    ReplicateTriggerCompleteMessage { repl_id: self.repl_id }.to_bytes()
                },
                MessageKind::ReplicateTriggerCommit => {
                    ReplicateTriggerCommitMessage { repl_id: self.repl_id }.to_bytes()
                },
                other => unreachable!("not a quorum message kind: {other:?}"),
            };
            rt.fabric().send(self.owner_node, kind, payload);
        }
    }

    /// First-future-wins latch for the replicated task's result.
    pub fn handle_future(&self, value: Vec<u8>) {
        let mut state = self.state.lock();
        if state.first_future {
            state.first_future = false;
            state.future = Some(value);
        }
    }

    pub fn future(&self) -> Option<Vec<u8>> {
        self.state.lock().future.clone()
    }

    // COLLECTIVE ROUTING
    // --------------------------------------------------------------------------------------------

    pub fn register_collective(&self, shard: ShardId, collective: &Arc<dyn Collective>) {
        let key = (shard, collective.collective_id());
        let queued = {
            let mut collectives = self.collectives.lock();
            collectives.insert(key, Arc::downgrade(collective));
            self.pending_collectives.lock().remove(&key).unwrap_or_default()
        };
        for payload in queued {
            collective.handle_collective_message(&payload);
        }
    }

    /// Routes one collective hop to the shard that must receive it,
    /// crossing nodes when needed.
    pub fn send_collective_message(
        &self,
        target: ShardId,
        collective_id: CollectiveId,
        payload: Vec<u8>,
    ) {
        let rt = self.runtime();
        let target_node = self.address_spaces.read()[target.as_raw() as usize];
        if target_node == rt.node() {
            self.deliver_collective(target, collective_id, payload);
        } else {
            let msg = CollectiveMessage {
                repl_id: self.repl_id,
                target_shard: target,
                collective_id,
                payload,
            };
            rt.fabric().send(target_node, MessageKind::CollectiveMessage, msg.to_bytes());
        }
    }

    pub fn deliver_collective(
        &self,
        target: ShardId,
        collective_id: CollectiveId,
        payload: Vec<u8>,
    ) {
        let key = (target, collective_id);
        let collective = self.collectives.lock().get(&key).and_then(Weak::upgrade);
        match collective {
            Some(collective) => collective.handle_collective_message(&payload),
            None => {
                // the receiving shard has not reached this collective site
                // yet; park the message
                self.pending_collectives.lock().entry(key).or_default().push(payload);
            },
        }
    }

    // SHARDING FUNCTIONS
    // --------------------------------------------------------------------------------------------

    /// Finds (or caches) the sharding function for a functor id. A missing
    /// functor is a mapper contract violation surfaced by the caller.
    pub fn find_sharding_function(&self, sid: ShardingId) -> Option<Arc<ShardingFunction>> {
        {
            let cache = self.sharding_functions.lock();
            if let Some(function) = cache.get(&sid) {
                return Some(Arc::clone(function));
            }
        }
        let functor = self.runtime().find_sharding_functor(sid)?;
        let mut cache = self.sharding_functions.lock();
        Some(Arc::clone(cache.entry(sid).or_insert_with(|| {
            Arc::new(ShardingFunction::new(functor, sid, self.total_shards))
        })))
    }

    // FUTURE MAPS AND TOP VIEWS
    // --------------------------------------------------------------------------------------------

    pub fn record_future_map(&self, shard: ShardId, map: BTreeMap<u64, Vec<u8>>) {
        self.state.lock().future_maps.insert(shard, map);
    }

    pub fn future_map_of(&self, shard: ShardId) -> Option<BTreeMap<u64, Vec<u8>>> {
        self.state.lock().future_maps.get(&shard).cloned()
    }

    /// Routes a physical-instance top-view request toward the node that
    /// owns the manager's distributed id; on that node the request is
    /// spread across local shards by hashing the id.
    pub fn create_instance_top_view(&self, manager_did: DistributedId, request_node: NodeId) {
        let rt = self.runtime();
        let owner = NodeId::new((manager_did.as_raw() >> 48) as u16);
        if owner == rt.node() {
            let cached = self.state.lock().top_views.get(&manager_did).copied();
            let view_did = match cached {
                Some(existing) => existing,
                None => {
                    // distribute view creation across local shards by
                    // hashing the manager's distributed id
                    let shard = {
                        let shards = self.local_shards.lock();
                        debug_assert!(!shards.is_empty(), "view request on a shard-less node");
                        let index = (manager_did.as_raw() as usize) % shards.len();
                        Arc::clone(&shards[index])
                    };
                    let view_did = shard.create_instance_top_view(manager_did);
                    // a concurrent request for the same manager may have won
                    let mut state = self.state.lock();
                    *state.top_views.entry(manager_did).or_insert(view_did)
                },
            };
            if request_node == rt.node() {
                self.finish_top_view(manager_did, view_did);
            } else {
                let msg = TopViewResponseMessage { repl_id: self.repl_id, manager_did, view_did };
                rt.fabric().send(request_node, MessageKind::TopViewResponse, msg.to_bytes());
            }
        } else {
            // pick the routing target: the owner if it hosts a shard,
            // otherwise round-robin over the shard spaces
            let target = {
                let mut state = self.state.lock();
                if state.unique_shard_spaces.is_empty() {
                    let spaces = self.address_spaces.read();
                    state.unique_shard_spaces.extend(spaces.iter().copied());
                }
                if state.unique_shard_spaces.contains(&owner) {
                    owner
                } else {
                    let spaces = self.address_spaces.read();
                    spaces[(manager_did.as_raw() as usize) % spaces.len()]
                }
            };
            let msg = TopViewRequestMessage {
                repl_id: self.repl_id,
                manager_did,
                request_node: rt.node(),
            };
            rt.fabric().send(target, MessageKind::TopViewRequest, msg.to_bytes());
        }
    }

    /// Returns an event that triggers once the top view for `manager_did`
    /// is known on this node.
    pub fn top_view_ready(&self, manager_did: DistributedId) -> Event {
        let mut state = self.state.lock();
        if state.top_views.contains_key(&manager_did) {
            return Event::NO_EVENT;
        }
        let waiter = UserEvent::new();
        let event = waiter.event();
        state.top_view_waiters.entry(manager_did).or_default().push(waiter);
        event
    }

    pub fn find_top_view(&self, manager_did: DistributedId) -> Option<DistributedId> {
        self.state.lock().top_views.get(&manager_did).copied()
    }

    pub(crate) fn finish_top_view(&self, manager_did: DistributedId, view_did: DistributedId) {
        let waiters = {
            let mut state = self.state.lock();
            state.top_views.insert(manager_did, view_did);
            state.top_view_waiters.remove(&manager_did).unwrap_or_default()
        };
        for waiter in waiters {
            waiter.trigger();
        }
    }

    pub fn record_clone_barrier(&self, close_index: u32, token: tessera_core::BarrierToken) {
        self.state.lock().clone_barriers.insert(close_index, token);
    }

    pub fn find_clone_barrier(&self, close_index: u32) -> Option<tessera_core::BarrierToken> {
        self.state.lock().clone_barriers.get(&close_index).copied()
    }

    /// Redistributes an advanced close barrier to every other shard space.
    pub fn broadcast_clone_barrier(&self, close_index: u32, barrier: &Barrier) {
        let rt = self.runtime();
        self.record_clone_barrier(close_index, barrier.token());
        let spaces: BTreeSet<NodeId> = self.address_spaces.read().iter().copied().collect();
        for node in spaces {
            if node == rt.node() {
                continue;
            }
            let msg = CloneBarrierMessage {
                repl_id: self.repl_id,
                close_index,
                barrier: barrier.token(),
            };
            rt.fabric().send(node, MessageKind::CloneBarrier, msg.to_bytes());
        }
    }
}

// REPLICATION SERVICE
// ================================================================================================

/// The per-node entry point for control replication: the registry of
/// replicated-task bodies, the table of live shard managers, and the
/// handler for every replication message kind.
pub struct ReplicationService {
    rt: Mutex<Weak<Runtime>>,
    managers: Mutex<HashMap<ReplicationId, Arc<ShardManager>>>,
    bodies: RwLock<HashMap<TaskId, Arc<dyn ReplBody>>>,
}

impl ReplicationService {
    /// Creates the service and installs it as the runtime's replication
    /// message handler.
    pub fn install(rt: &Arc<Runtime>) -> Arc<Self> {
        let service = Arc::new(Self {
            rt: Mutex::new(Arc::downgrade(rt)),
            managers: Mutex::new(HashMap::new()),
            bodies: RwLock::new(HashMap::new()),
        });
        rt.set_replication_handler(service.clone());
        service
    }

    fn runtime(&self) -> Arc<Runtime> {
        self.rt.lock().upgrade().expect("runtime dropped while replication service alive")
    }

    /// Registers the body shards of `task_id` will run. Must be called on
    /// every node that may host a shard.
    pub fn register_task(&self, task_id: TaskId, body: Arc<dyn ReplBody>) {
        self.bodies.write().insert(task_id, body);
    }

    pub fn find_manager(&self, repl_id: ReplicationId) -> Option<Arc<ShardManager>> {
        self.managers.lock().get(&repl_id).cloned()
    }

    /// Launches `task_id` control-replicated across the given shard →
    /// node assignment; returns the origin-side manager.
    pub fn launch_replicated(
        &self,
        task_id: TaskId,
        shard_nodes: Vec<NodeId>,
        shard_mapping: Vec<u64>,
    ) -> Arc<ShardManager> {
        let rt = self.runtime();
        let body = self
            .bodies
            .read()
            .get(&task_id)
            .cloned()
            .expect("replicated task body not registered on the origin node");
        let manager =
            ShardManager::new_origin(&rt, task_id, shard_nodes, shard_mapping, true, false);
        self.managers.lock().insert(manager.repl_id(), Arc::clone(&manager));
        manager.launch(body);
        manager
    }
}

impl MessageHandler for ReplicationService {
    fn handle_message(&self, from: NodeId, kind: MessageKind, payload: &[u8]) {
        match kind {
            MessageKind::ReplicateLaunch => {
                let msg = ReplicateLaunchMessage::read_from_bytes(payload)
                    .expect("malformed ReplicateLaunch");
                let rt = self.runtime();
                let body = self
                    .bodies
                    .read()
                    .get(&msg.task_id)
                    .cloned()
                    .expect("replicated task body not registered on a shard node");
                let manager = ShardManager::from_launch(&rt, &msg, from);
                self.managers.lock().insert(msg.repl_id, Arc::clone(&manager));
                manager.unpack_shards_and_launch(msg.shards.clone(), body);
            },
            MessageKind::ReplicateDelete => {
                let msg = ReplicateDeleteMessage::read_from_bytes(payload)
                    .expect("malformed ReplicateDelete");
                self.managers.lock().remove(&msg.repl_id);
            },
            MessageKind::ReplicatePostMapped => {
                let msg = ReplicatePostMappedMessage::read_from_bytes(payload)
                    .expect("malformed ReplicatePostMapped");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.handle_post_mapped(false);
                }
            },
            MessageKind::ReplicateTriggerComplete => {
                let msg = ReplicateTriggerCompleteMessage::read_from_bytes(payload)
                    .expect("malformed ReplicateTriggerComplete");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.trigger_task_complete(false);
                }
            },
            MessageKind::ReplicateTriggerCommit => {
                let msg = ReplicateTriggerCommitMessage::read_from_bytes(payload)
                    .expect("malformed ReplicateTriggerCommit");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.trigger_task_commit(false);
                }
            },
            MessageKind::CollectiveMessage => {
                let msg =
                    CollectiveMessage::read_from_bytes(payload).expect("malformed collective");
                match self.find_manager(msg.repl_id) {
                    Some(manager) => manager.deliver_collective(
                        msg.target_shard,
                        msg.collective_id,
                        msg.payload,
                    ),
                    None => warn!(target: "tessera::repl", repl = %msg.repl_id,
                        "collective message for unknown launch"),
                }
            },
            MessageKind::FutureMapRequest => {
                let msg = FutureMapRequestMessage::read_from_bytes(payload)
                    .expect("malformed FutureMapRequest");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    let map = manager.future_map_of(msg.target_shard).unwrap_or_default();
                    let blob = crate::concrete::encode_future_map(&map);
                    manager.send_collective_message(msg.reply_shard, msg.reply_collective, blob);
                }
            },
            MessageKind::CompositeViewRequest => {
                let msg = CompositeViewRequestMessage::read_from_bytes(payload)
                    .expect("malformed CompositeViewRequest");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.create_instance_top_view(msg.view_did, from);
                }
            },
            MessageKind::TopViewRequest => {
                let msg = TopViewRequestMessage::read_from_bytes(payload)
                    .expect("malformed TopViewRequest");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.create_instance_top_view(msg.manager_did, msg.request_node);
                }
            },
            MessageKind::TopViewResponse => {
                let msg = TopViewResponseMessage::read_from_bytes(payload)
                    .expect("malformed TopViewResponse");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.finish_top_view(msg.manager_did, msg.view_did);
                }
            },
            MessageKind::CloneBarrier => {
                let msg = CloneBarrierMessage::read_from_bytes(payload)
                    .expect("malformed CloneBarrier");
                if let Some(manager) = self.find_manager(msg.repl_id) {
                    manager.record_clone_barrier(msg.close_index, msg.barrier);
                }
            },
            other => warn!(target: "tessera::repl", ?other, "unexpected message kind"),
        }
    }
}
