use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tessera_core::{
    Event, HandleTable, MemoryHandle, MessageFabric, MessageHandler, MessageKind, NodeId,
    RemoteHandle, UserEvent, XferDesId,
    utils::{Deserializable, Serializable},
};
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_MAX_NR, TransferError,
    channel::{Channel, GlobalChannel, MemcpyChannel, RemoteWriteChannel},
    iterator::IteratorDesc,
    memory::{MemoryPool, MemoryStore},
    messages::{
        NotifyXferDesCompleteMessage, UpdateNextBytesReadMessage, UpdatePreBytesWriteMessage,
        XferDesCreateMessage, XferDesDestroyMessage, XferDesRemoteWriteAckMessage,
        XferDesRemoteWriteMessage,
    },
    xferdes::{Request, UpdateRouter, XdFence, XferDes, XferKind, XferOrder},
};

// XFERDES SPEC
// ================================================================================================

/// Everything needed to create one transfer descriptor, on this node or a
/// remote one.
#[derive(Clone, Debug)]
pub struct XferDesSpec {
    /// Node that will execute the descriptor.
    pub target_node: NodeId,
    pub pre_xd_guid: XferDesId,
    pub next_xd_guid: XferDesId,
    /// Capacity of the downstream intermediate buffer, advertised as the
    /// initially writable window.
    pub next_max_rw_gap: u64,
    pub src_ib_offset: u64,
    pub src_ib_size: u64,
    pub mark_started: bool,
    pub src_mem: MemoryHandle,
    pub dst_mem: MemoryHandle,
    pub src_iter: IteratorDesc,
    pub dst_iter: IteratorDesc,
    pub max_req_size: u64,
    pub max_nr: usize,
    pub priority: i32,
    pub order: XferOrder,
    pub kind: XferKind,
}

// QUEUE STATE
// ================================================================================================

/// Updates that arrived before their descriptor was enqueued.
#[derive(Default)]
struct PendingUpdates {
    pre_writes: Vec<(u64, u64, u64)>,
    next_reads: Vec<(u64, u64)>,
}

enum XdSlot {
    Enqueued(Arc<XferDes>),
    Pending(PendingUpdates),
}

struct ChannelQueue {
    channel: Arc<dyn Channel>,
    /// Descriptors bound to this channel, kept sorted by descending
    /// priority.
    xds: Mutex<Vec<Arc<XferDes>>>,
}

// XFERDES QUEUE
// ================================================================================================

/// Owns the transfer descriptors resident on one node and drives them from
/// DMA worker threads.
pub struct XferDesQueue {
    node: NodeId,
    fabric: Arc<dyn MessageFabric>,
    pool: Arc<MemoryPool>,
    max_nr: usize,

    /// Completion fences for descriptors this node launched remotely.
    fences: HandleTable<UserEvent>,
    /// In-flight remote-write requests awaiting acks.
    pending_reqs: Arc<HandleTable<Request>>,
    remote_write_channel: Arc<RemoteWriteChannel>,
    channels: Vec<ChannelQueue>,

    next_index: AtomicU64,
    slots: Mutex<HashMap<XferDesId, XdSlot>>,

    /// Back-reference for message handlers that must re-enter through an
    /// owning `Arc`.
    self_ref: Mutex<std::sync::Weak<XferDesQueue>>,
    work_version: Mutex<u64>,
    work_cond: Condvar,
    shutdown: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl XferDesQueue {
    /// Creates a queue with the default channel set and two DMA workers.
    pub fn new(
        node: NodeId,
        fabric: Arc<dyn MessageFabric>,
        pool: Arc<MemoryPool>,
        global: Option<Arc<MemoryStore>>,
    ) -> Arc<Self> {
        Self::with_config(node, fabric, pool, global, 2, 16)
    }

    pub fn with_config(
        node: NodeId,
        fabric: Arc<dyn MessageFabric>,
        pool: Arc<MemoryPool>,
        global: Option<Arc<MemoryStore>>,
        worker_count: usize,
        channel_capacity: usize,
    ) -> Arc<Self> {
        let pending_reqs = Arc::new(HandleTable::new(node));
        let remote_write_channel = Arc::new(RemoteWriteChannel::new(
            Arc::clone(&pool),
            Arc::clone(&fabric),
            Arc::clone(&pending_reqs),
            channel_capacity,
        ));

        let mut channels: Vec<ChannelQueue> = Vec::new();
        channels.push(ChannelQueue {
            channel: Arc::new(MemcpyChannel::new(Arc::clone(&pool), channel_capacity)),
            xds: Mutex::new(Vec::new()),
        });
        if let Some(global) = global {
            channels.push(ChannelQueue {
                channel: Arc::new(GlobalChannel::new(
                    Arc::clone(&pool),
                    global,
                    channel_capacity,
                )),
                xds: Mutex::new(Vec::new()),
            });
        }
        channels.push(ChannelQueue {
            channel: Arc::clone(&remote_write_channel) as Arc<dyn Channel>,
            xds: Mutex::new(Vec::new()),
        });

        let queue = Arc::new(Self {
            node,
            fabric,
            pool,
            max_nr: DEFAULT_MAX_NR,
            fences: HandleTable::new(node),
            pending_reqs,
            remote_write_channel,
            channels,
            next_index: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(std::sync::Weak::new()),
            work_version: Mutex::new(0),
            work_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        *queue.self_ref.lock() = Arc::downgrade(&queue);
        queue.start_workers(worker_count);
        queue
    }

    // PUBLIC ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Allocates a fresh descriptor id executing on this node.
    pub fn allocate_guid(&self) -> XferDesId {
        XferDesId::new(self.node, self.next_index.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the descriptor if it is enqueued on this node.
    pub fn find(&self, guid: XferDesId) -> Option<Arc<XferDes>> {
        match self.slots.lock().get(&guid) {
            Some(XdSlot::Enqueued(xd)) => Some(Arc::clone(xd)),
            _ => None,
        }
    }

    // DESCRIPTOR CREATION
    // --------------------------------------------------------------------------------------------

    /// Creates the descriptor `guid` per `spec`, locally or by message to
    /// the executing node. Returns the completion fence event, which
    /// triggers on this node in either case.
    pub fn create_xfer_des(
        self: &Arc<Self>,
        guid: XferDesId,
        spec: XferDesSpec,
    ) -> Result<Event, TransferError> {
        let fence = UserEvent::new();
        if spec.target_node == self.node {
            debug!(target: "tessera::dma", %guid, kind = ?spec.kind, "create local xferdes");
            let xd = self.instantiate(guid, self.node, &spec, XdFence::Local(fence.clone()))?;
            self.enqueue_when_ready(xd);
        } else {
            debug!(target: "tessera::dma", %guid, kind = ?spec.kind, target = %spec.target_node,
                "create remote xferdes");
            let msg = XferDesCreateMessage {
                launch_node: self.node,
                guid,
                pre_xd_guid: spec.pre_xd_guid,
                next_xd_guid: spec.next_xd_guid,
                next_max_rw_gap: spec.next_max_rw_gap,
                src_ib_offset: spec.src_ib_offset,
                src_ib_size: spec.src_ib_size,
                mark_started: spec.mark_started,
                max_req_size: spec.max_req_size,
                max_nr: spec.max_nr as u32,
                priority: spec.priority,
                order: spec.order,
                kind: spec.kind,
                src_iter: spec.src_iter,
                dst_iter: spec.dst_iter,
                src_mem: spec.src_mem,
                dst_mem: spec.dst_mem,
                fence: self.fences.register(fence.clone()),
            };
            self.fabric.send(spec.target_node, MessageKind::XferDesCreate, msg.to_bytes());
        }
        Ok(fence.event())
    }

    /// Creates a descriptor on this node with caller-built iterators, for
    /// layouts that are not expressible as a wire descriptor.
    pub fn create_xfer_des_with_iterators(
        self: &Arc<Self>,
        guid: XferDesId,
        spec: XferDesSpec,
        src_iter: Box<dyn crate::TransferIterator>,
        dst_iter: Box<dyn crate::TransferIterator>,
    ) -> Result<Event, TransferError> {
        assert_eq!(spec.target_node, self.node, "boxed iterators cannot cross nodes");
        let fence = UserEvent::new();
        let xd = self.instantiate_with(
            guid,
            self.node,
            &spec,
            src_iter,
            dst_iter,
            XdFence::Local(fence.clone()),
        )?;
        self.enqueue_when_ready(xd);
        Ok(fence.event())
    }

    fn instantiate(
        self: &Arc<Self>,
        guid: XferDesId,
        launch_node: NodeId,
        spec: &XferDesSpec,
        fence: XdFence,
    ) -> Result<Arc<XferDes>, TransferError> {
        self.instantiate_with(
            guid,
            launch_node,
            spec,
            spec.src_iter.instantiate(),
            spec.dst_iter.instantiate(),
            fence,
        )
    }

    fn instantiate_with(
        self: &Arc<Self>,
        guid: XferDesId,
        launch_node: NodeId,
        spec: &XferDesSpec,
        src_iter: Box<dyn crate::TransferIterator>,
        dst_iter: Box<dyn crate::TransferIterator>,
        fence: XdFence,
    ) -> Result<Arc<XferDes>, TransferError> {
        if !self.channels.iter().any(|cq| cq.channel.serves(spec.kind)) {
            return Err(TransferError::NoChannelForKind(spec.kind));
        }
        Ok(XferDes::new(
            guid,
            launch_node,
            spec.pre_xd_guid,
            spec.next_xd_guid,
            spec.next_max_rw_gap,
            spec.src_ib_offset,
            spec.src_ib_size,
            spec.mark_started,
            spec.src_mem,
            spec.dst_mem,
            src_iter,
            dst_iter,
            spec.max_req_size,
            spec.max_nr,
            spec.priority,
            spec.order,
            spec.kind,
            Arc::clone(self) as Arc<dyn UpdateRouter>,
            fence,
        ))
    }

    /// Enqueues a descriptor, deferring until its iterators' metadata is
    /// resident.
    pub fn enqueue_when_ready(self: &Arc<Self>, xd: Arc<XferDes>) {
        let wait_on = xd.iterator_metadata();
        if wait_on.has_triggered() {
            self.enqueue_now(xd);
        } else {
            info!(target: "tessera::dma", guid = %xd.guid(), "deferring enqueue on metadata");
            let queue = Arc::clone(self);
            wait_on.add_waiter(Box::new(move |poisoned: bool| {
                assert!(!poisoned, "iterator metadata fetch poisoned");
                info!(target: "tessera::dma", guid = %xd.guid(), "xd metadata ready");
                queue.enqueue_now(xd);
            }));
        }
    }

    fn enqueue_now(self: &Arc<Self>, xd: Arc<XferDes>) {
        let guid = xd.guid();
        let channel_idx = self
            .channels
            .iter()
            .position(|cq| cq.channel.serves(xd.kind()))
            .expect("descriptor kind checked at creation");

        // drain any updates that raced ahead of the enqueue
        {
            let mut slots = self.slots.lock();
            if let Some(XdSlot::Pending(pending)) =
                slots.insert(guid, XdSlot::Enqueued(Arc::clone(&xd)))
            {
                for (offset, size, total) in pending.pre_writes {
                    xd.update_pre_bytes_write(offset, size, total);
                }
                for (offset, size) in pending.next_reads {
                    xd.update_next_bytes_read(offset, size);
                }
            }
        }

        let mut xds = self.channels[channel_idx].xds.lock();
        let pos = xds
            .iter()
            .position(|other| other.priority() < xd.priority())
            .unwrap_or(xds.len());
        xds.insert(pos, xd);
        drop(xds);
        self.wake_workers();
    }

    /// Destroys the descriptor named by `guid`, forwarding to its executing
    /// node if needed.
    pub fn destroy_xfer_des(&self, guid: XferDesId) {
        if guid.node() == self.node {
            debug!(target: "tessera::dma", %guid, "destroy xferdes");
            self.slots.lock().remove(&guid);
        } else {
            let msg = XferDesDestroyMessage { guid };
            self.fabric.send(guid.node(), MessageKind::XferDesDestroy, msg.to_bytes());
        }
    }

    // UPDATE DELIVERY
    // --------------------------------------------------------------------------------------------

    fn deliver_pre_bytes_write(&self, guid: XferDesId, offset: u64, size: u64, total: u64) {
        {
            let mut slots = self.slots.lock();
            match slots.entry(guid).or_insert_with(|| XdSlot::Pending(PendingUpdates::default()))
            {
                XdSlot::Enqueued(xd) => xd.update_pre_bytes_write(offset, size, total),
                XdSlot::Pending(pending) => pending.pre_writes.push((offset, size, total)),
            }
        }
        self.wake_workers();
    }

    fn deliver_next_bytes_read(&self, guid: XferDesId, offset: u64, size: u64) {
        {
            let mut slots = self.slots.lock();
            match slots.entry(guid).or_insert_with(|| XdSlot::Pending(PendingUpdates::default()))
            {
                XdSlot::Enqueued(xd) => xd.update_next_bytes_read(offset, size),
                XdSlot::Pending(pending) => pending.next_reads.push((offset, size)),
            }
        }
        self.wake_workers();
    }

    // WORKERS
    // --------------------------------------------------------------------------------------------

    fn start_workers(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock();
        for worker_idx in 0..count {
            let queue = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("dma-worker-{}-{worker_idx}", self.node))
                .spawn(move || queue.worker_loop(worker_idx, count))
                .expect("failed to spawn dma worker");
            workers.push(handle);
        }
    }

    fn worker_loop(self: Arc<Self>, worker_idx: usize, worker_count: usize) {
        info!(target: "tessera::dma", node = %self.node, worker_idx, "dma worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            let version = *self.work_version.lock();
            let mut progressed = false;
            for (channel_idx, cq) in self.channels.iter().enumerate() {
                // channels are partitioned across workers
                if channel_idx % worker_count != worker_idx {
                    continue;
                }
                progressed |= self.drive_channel(cq);
            }
            if !progressed {
                // nothing moved; sleep until new work or an update arrives
                let mut current = self.work_version.lock();
                if *current == version && !self.shutdown.load(Ordering::SeqCst) {
                    let _ = self.work_cond.wait_for(&mut current, Duration::from_millis(1));
                }
            }
        }
        info!(target: "tessera::dma", node = %self.node, worker_idx, "dma worker stopped");
    }

    fn drive_channel(&self, cq: &ChannelQueue) -> bool {
        cq.channel.pull();
        let mut slots_left = cq.channel.available();
        if slots_left == 0 {
            return false;
        }

        let xds: Vec<Arc<XferDes>> = cq.xds.lock().clone();
        if xds.is_empty() {
            return false;
        }

        let mut progressed = false;
        let mut finished: smallvec::SmallVec<[Arc<XferDes>; 4]> = smallvec::SmallVec::new();
        for xd in &xds {
            if xd.take_mark_start() {
                debug!(target: "tessera::dma", guid = %xd.guid(), "transfer started");
            }
            let reqs = xd.get_requests(slots_left.min(self.max_nr));
            if !reqs.is_empty() {
                let got = reqs.len();
                let submitted = cq.channel.submit(reqs);
                debug_assert_eq!(submitted, got);
                slots_left -= got;
                progressed = true;
            }
            if xd.is_completed() {
                finished.push(Arc::clone(xd));
                continue;
            }
            if slots_left == 0 {
                break;
            }
        }

        if !finished.is_empty() {
            {
                let mut queue = cq.xds.lock();
                queue.retain(|other| !finished.iter().any(|xd| xd.guid() == other.guid()));
            }
            for xd in finished {
                info!(target: "tessera::dma", guid = %xd.guid(), "finish xferdes");
                xd.mark_completed();
                progressed = true;
            }
        }
        progressed
    }

    fn wake_workers(&self) {
        let mut version = self.work_version.lock();
        *version += 1;
        self.work_cond.notify_all();
    }

    /// Stops the DMA workers; used at shutdown and by tests.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_workers();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

// UPDATE ROUTING
// ================================================================================================

impl UpdateRouter for XferDesQueue {
    fn update_pre_bytes_write(&self, guid: XferDesId, offset: u64, size: u64, pre_total: u64) {
        if guid.node() == self.node {
            self.deliver_pre_bytes_write(guid, offset, size, pre_total);
        } else {
            let msg = UpdatePreBytesWriteMessage {
                guid,
                span_start: offset,
                span_size: size,
                pre_bytes_total: pre_total,
            };
            self.fabric.send(guid.node(), MessageKind::UpdatePreBytesWrite, msg.to_bytes());
        }
    }

    fn update_next_bytes_read(&self, guid: XferDesId, offset: u64, size: u64) {
        if guid.node() == self.node {
            self.deliver_next_bytes_read(guid, offset, size);
        } else {
            let msg = UpdateNextBytesReadMessage { guid, span_start: offset, span_size: size };
            self.fabric.send(guid.node(), MessageKind::UpdateNextBytesRead, msg.to_bytes());
        }
    }

    fn notify_complete(&self, launch_node: NodeId, fence: RemoteHandle) {
        let msg = NotifyXferDesCompleteMessage { fence };
        self.fabric.send(launch_node, MessageKind::NotifyXferDesComplete, msg.to_bytes());
    }
}

// MESSAGE HANDLING
// ================================================================================================

impl MessageHandler for XferDesQueue {
    fn handle_message(&self, from: NodeId, kind: MessageKind, payload: &[u8]) {
        match kind {
            MessageKind::XferDesCreate => {
                let msg = XferDesCreateMessage::read_from_bytes(payload)
                    .expect("malformed XferDesCreate");
                let spec = XferDesSpec {
                    target_node: self.node,
                    pre_xd_guid: msg.pre_xd_guid,
                    next_xd_guid: msg.next_xd_guid,
                    next_max_rw_gap: msg.next_max_rw_gap,
                    src_ib_offset: msg.src_ib_offset,
                    src_ib_size: msg.src_ib_size,
                    mark_started: msg.mark_started,
                    src_mem: msg.src_mem,
                    dst_mem: msg.dst_mem,
                    src_iter: msg.src_iter.clone(),
                    dst_iter: msg.dst_iter.clone(),
                    max_req_size: msg.max_req_size,
                    max_nr: msg.max_nr as usize,
                    priority: msg.priority,
                    order: msg.order,
                    kind: msg.kind,
                };
                let this =
                    self.self_ref.lock().upgrade().expect("queue outlived its owning arc");
                let xd = this
                    .instantiate(msg.guid, msg.launch_node, &spec, XdFence::Remote(msg.fence))
                    .expect("remote descriptor kind unsupported on this node");
                this.enqueue_when_ready(xd);
            },
            MessageKind::XferDesDestroy => {
                let msg = XferDesDestroyMessage::read_from_bytes(payload)
                    .expect("malformed XferDesDestroy");
                self.slots.lock().remove(&msg.guid);
            },
            MessageKind::UpdatePreBytesWrite => {
                let msg = UpdatePreBytesWriteMessage::read_from_bytes(payload)
                    .expect("malformed UpdatePreBytesWrite");
                self.deliver_pre_bytes_write(
                    msg.guid,
                    msg.span_start,
                    msg.span_size,
                    msg.pre_bytes_total,
                );
            },
            MessageKind::UpdateNextBytesRead => {
                let msg = UpdateNextBytesReadMessage::read_from_bytes(payload)
                    .expect("malformed UpdateNextBytesRead");
                self.deliver_next_bytes_read(msg.guid, msg.span_start, msg.span_size);
            },
            MessageKind::XferDesRemoteWrite => {
                let msg = XferDesRemoteWriteMessage::read_from_bytes(payload)
                    .expect("malformed XferDesRemoteWrite");
                if !msg.payload.is_empty() {
                    let store = self
                        .pool
                        .get(msg.dst_mem)
                        .expect("remote write targeting unknown memory");
                    store.write(msg.dst_off, &msg.payload).expect("remote write out of bounds");
                }
                // the update for the consumer descriptor rides on the data
                // message; deliver it locally
                if msg.next_xd_guid.exists() {
                    self.deliver_pre_bytes_write(
                        msg.next_xd_guid,
                        msg.span_start,
                        msg.span_size,
                        msg.pre_bytes_total,
                    );
                }
                if !msg.payload.is_empty() {
                    let ack = XferDesRemoteWriteAckMessage { req: msg.req };
                    self.fabric.send(from, MessageKind::XferDesRemoteWriteAck, ack.to_bytes());
                }
            },
            MessageKind::XferDesRemoteWriteAck => {
                let msg = XferDesRemoteWriteAckMessage::read_from_bytes(payload)
                    .expect("malformed XferDesRemoteWriteAck");
                match self.pending_reqs.take(msg.req) {
                    Some(req) => {
                        req.xd.notify_request_read_done(&req);
                        req.xd.notify_request_write_done(&req);
                        self.remote_write_channel.notify_completion();
                        self.wake_workers();
                    },
                    None => warn!(target: "tessera::dma", "ack for unknown request"),
                }
            },
            MessageKind::NotifyXferDesComplete => {
                let msg = NotifyXferDesCompleteMessage::read_from_bytes(payload)
                    .expect("malformed NotifyXferDesComplete");
                match self.fences.take(msg.fence) {
                    Some(fence) => fence.trigger(),
                    None => warn!(target: "tessera::dma", "completion for unknown fence"),
                }
            },
            other => warn!(target: "tessera::dma", ?other, "unexpected message kind"),
        }
    }
}
