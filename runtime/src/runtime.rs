use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tessera_core::{
    BarrierSpace, ContextId, DistributedId, MapperId, MemoryKind, MessageFabric, MessageHandler,
    MessageKind, NodeId, ReplicationId, ShardingId, UniqueId,
};
use tessera_transfer::{MemoryPool, XferDesQueue};
use tracing::error;

use crate::{
    RuntimeError,
    config::RuntimeConfig,
    context::{ContextVariant, InnerContext, LeafContext, RemoteContextSnapshot, TaskContext},
    forest::RegionTreeForest,
    mapper::{DefaultMapper, Mapper, ModuloShardingFunctor, ShardingFunctor},
};

// RUNTIME
// ================================================================================================

/// The per-node runtime context: arenas and registries for contexts,
/// mappers and sharding functors, plus the node's DMA queue and fabric
/// endpoint.
///
/// Everything that was ambient global state in older designs hangs off this
/// struct; tests construct as many independent runtimes as they need.
pub struct Runtime {
    node: NodeId,
    config: RuntimeConfig,
    fabric: Arc<dyn MessageFabric>,
    forest: Arc<dyn RegionTreeForest>,
    barrier_space: Arc<BarrierSpace>,
    pool: Arc<MemoryPool>,
    xfer_queue: Arc<XferDesQueue>,

    contexts: Mutex<HashMap<ContextId, Arc<dyn TaskContext>>>,
    mappers: RwLock<HashMap<MapperId, Arc<dyn Mapper>>>,
    sharding_functors: RwLock<HashMap<ShardingId, Arc<dyn ShardingFunctor>>>,
    /// Handler for control-replication messages, installed by the
    /// replication layer.
    repl_handler: RwLock<Option<Arc<dyn MessageHandler>>>,

    next_ctx_id: AtomicU32,
    next_uid: AtomicU64,
    next_did: AtomicU64,
    next_repl_id: AtomicU64,
}

impl Runtime {
    pub fn new(
        node: NodeId,
        fabric: Arc<dyn MessageFabric>,
        forest: Arc<dyn RegionTreeForest>,
        barrier_space: Arc<BarrierSpace>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(MemoryPool::new(node));
        let xfer_queue = XferDesQueue::new(node, Arc::clone(&fabric), Arc::clone(&pool), None);
        let rt = Arc::new(Self {
            node,
            config,
            fabric,
            forest,
            barrier_space,
            pool,
            xfer_queue,
            contexts: Mutex::new(HashMap::new()),
            mappers: RwLock::new(HashMap::new()),
            sharding_functors: RwLock::new(HashMap::new()),
            repl_handler: RwLock::new(None),
            next_ctx_id: AtomicU32::new(1),
            next_uid: AtomicU64::new(1),
            next_did: AtomicU64::new(1),
            next_repl_id: AtomicU64::new(1),
        });
        rt.register_mapper(MapperId::new(0), Arc::new(DefaultMapper));
        rt.register_sharding_functor(ShardingId::new(0), Arc::new(ModuloShardingFunctor));
        rt
    }

    // PUBLIC ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn fabric(&self) -> &Arc<dyn MessageFabric> {
        &self.fabric
    }

    pub fn forest(&self) -> &Arc<dyn RegionTreeForest> {
        &self.forest
    }

    pub fn barrier_space(&self) -> &Arc<BarrierSpace> {
        &self.barrier_space
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn xfer_queue(&self) -> &Arc<XferDesQueue> {
        &self.xfer_queue
    }

    // ID ALLOCATION
    // --------------------------------------------------------------------------------------------

    pub fn allocate_unique_id(&self) -> UniqueId {
        // spread node id into the high bits so ids never collide across the
        // machine
        let local = self.next_uid.fetch_add(1, Ordering::Relaxed);
        UniqueId::new(((self.node.as_raw() as u64) << 48) | local)
    }

    pub fn allocate_distributed_id(&self) -> DistributedId {
        let local = self.next_did.fetch_add(1, Ordering::Relaxed);
        DistributedId::new(((self.node.as_raw() as u64) << 48) | local)
    }

    pub fn allocate_replication_id(&self) -> ReplicationId {
        let local = self.next_repl_id.fetch_add(1, Ordering::Relaxed);
        ReplicationId::new(((self.node.as_raw() as u64) << 48) | local)
    }

    // CONTEXT MANAGEMENT
    // --------------------------------------------------------------------------------------------

    pub fn find_context(&self, ctx: ContextId) -> Option<Arc<dyn TaskContext>> {
        self.contexts.lock().get(&ctx).cloned()
    }

    /// Creates the root context of this node's context tree.
    pub fn create_top_level_context(self: &Arc<Self>, task_name: &str) -> Arc<dyn TaskContext> {
        let ctx_id = ContextId::new(self.next_ctx_id.fetch_add(1, Ordering::Relaxed));
        let ctx = InnerContext::create(
            self,
            ctx_id,
            self.allocate_unique_id(),
            task_name.to_string(),
            0,
            self.config.context,
            ContextVariant::Top,
        );
        let ctx: Arc<dyn TaskContext> = ctx;
        self.contexts.lock().insert(ctx_id, ctx.clone());
        ctx
    }

    pub fn create_inner_context(
        self: &Arc<Self>,
        owner_uid: UniqueId,
        task_name: String,
        depth: u32,
        parent: Option<ContextId>,
    ) -> Arc<dyn TaskContext> {
        let ctx_id = ContextId::new(self.next_ctx_id.fetch_add(1, Ordering::Relaxed));
        let ctx = InnerContext::create(
            self,
            ctx_id,
            owner_uid,
            task_name,
            depth,
            self.config.context,
            ContextVariant::Inner { parent },
        );
        let ctx: Arc<dyn TaskContext> = ctx;
        self.contexts.lock().insert(ctx_id, ctx.clone());
        ctx
    }

    pub fn create_leaf_context(
        self: &Arc<Self>,
        owner_uid: UniqueId,
        task_name: String,
        depth: u32,
        parent: Option<ContextId>,
    ) -> Arc<dyn TaskContext> {
        let ctx_id = ContextId::new(self.next_ctx_id.fetch_add(1, Ordering::Relaxed));
        let ctx: Arc<dyn TaskContext> =
            Arc::new(LeafContext::new(self, ctx_id, owner_uid, task_name, depth, parent));
        self.contexts.lock().insert(ctx_id, ctx.clone());
        ctx
    }

    /// Reconstructs a context shipped from another node.
    pub fn create_remote_context(
        self: &Arc<Self>,
        snapshot: RemoteContextSnapshot,
    ) -> Arc<dyn TaskContext> {
        let ctx_id = ContextId::new(self.next_ctx_id.fetch_add(1, Ordering::Relaxed));
        let ctx = InnerContext::create(
            self,
            ctx_id,
            snapshot.owner_uid,
            snapshot.task_name,
            snapshot.depth,
            self.config.context,
            ContextVariant::Remote {
                enclosing_fields: snapshot.enclosing_fields,
                source_node: snapshot.source_node,
            },
        );
        let ctx: Arc<dyn TaskContext> = ctx;
        self.contexts.lock().insert(ctx_id, ctx.clone());
        ctx
    }

    /// Retires a context whose owner task has committed.
    pub fn retire_context(&self, ctx: ContextId) {
        self.contexts.lock().remove(&ctx);
    }

    // MAPPERS AND SHARDING FUNCTORS
    // --------------------------------------------------------------------------------------------

    pub fn register_mapper(&self, id: MapperId, mapper: Arc<dyn Mapper>) {
        self.mappers.write().insert(id, mapper);
    }

    pub fn find_mapper(&self, id: MapperId) -> Arc<dyn Mapper> {
        self.mappers.read().get(&id).cloned().expect("no mapper registered under this id")
    }

    pub fn register_sharding_functor(&self, id: ShardingId, functor: Arc<dyn ShardingFunctor>) {
        self.sharding_functors.write().insert(id, functor);
    }

    pub fn find_sharding_functor(&self, id: ShardingId) -> Option<Arc<dyn ShardingFunctor>> {
        self.sharding_functors.read().get(&id).cloned()
    }

    // REPLICATION PLUMBING
    // --------------------------------------------------------------------------------------------

    /// Installs the handler for control-replication message kinds.
    pub fn set_replication_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.repl_handler.write() = Some(handler);
    }

    // FAILURE REPORTING
    // --------------------------------------------------------------------------------------------

    /// Reports an unrecoverable error. Mapper contract violations and trace
    /// violations land here: the error is logged with full context, then
    /// the process aborts.
    pub fn report_fatal(&self, err: RuntimeError) -> ! {
        error!(target: "tessera::ctx", node = %self.node, "{err}");
        panic!("{err}");
    }

    /// Stops this node's background machinery.
    pub fn shutdown(&self) {
        self.xfer_queue.shutdown();
    }

    /// Convenience for tests: a registered system memory of the given size.
    pub fn create_system_memory(&self, size: usize) -> tessera_core::MemoryHandle {
        self.pool.create_memory(MemoryKind::System, size)
    }
}

// MESSAGE DISPATCH
// ================================================================================================

impl MessageHandler for Runtime {
    fn handle_message(&self, from: NodeId, kind: MessageKind, payload: &[u8]) {
        match kind {
            MessageKind::XferDesCreate
            | MessageKind::XferDesDestroy
            | MessageKind::UpdatePreBytesWrite
            | MessageKind::UpdateNextBytesRead
            | MessageKind::XferDesRemoteWrite
            | MessageKind::XferDesRemoteWriteAck
            | MessageKind::NotifyXferDesComplete => {
                self.xfer_queue.handle_message(from, kind, payload)
            },
            _ => {
                let handler = self.repl_handler.read().clone();
                match handler {
                    Some(handler) => handler.handle_message(from, kind, payload),
                    None => error!(target: "tessera::ctx", node = %self.node, ?kind,
                        "replication message with no handler installed"),
                }
            },
        }
    }
}
