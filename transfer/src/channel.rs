use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tessera_core::{
    HandleTable, MemoryKind, MessageFabric, MessageKind, UNKNOWN_BYTE_TOTAL,
    utils::Serializable,
};
use tracing::trace;

use crate::{
    MemoryPool, MemoryStore, TransferError,
    messages::XferDesRemoteWriteMessage,
    xferdes::{Request, RequestDim, XferKind},
};

// CHANNEL
// ================================================================================================

/// A submitter/poller of requests for one family of transfer kinds.
///
/// `submit` may complete requests synchronously (memcpy, global get/put) or
/// leave them in flight to be retired by `pull` or by a message handler
/// (remote write). `available` is the backpressure signal: the DMA workers
/// never ask a descriptor for more requests than the channel has slots.
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns true if this channel executes descriptors of the given kind.
    fn serves(&self, kind: XferKind) -> bool;

    /// Returns the number of requests that may currently be submitted.
    fn available(&self) -> usize;

    /// Submits a batch of requests; returns how many were accepted.
    fn submit(&self, requests: Vec<Request>) -> usize;

    /// Drains any asynchronous completions.
    fn pull(&self);
}

// MEMCPY CHANNEL
// ================================================================================================

/// Copies between two memories resident on this node, synchronously in the
/// submitting thread.
pub struct MemcpyChannel {
    pool: Arc<MemoryPool>,
    capacity: usize,
}

impl MemcpyChannel {
    pub fn new(pool: Arc<MemoryPool>, capacity: usize) -> Self {
        Self { pool, capacity }
    }

    fn copy(&self, req: &Request) -> Result<(), TransferError> {
        let src = self.pool.get(req.xd.src_mem())?;
        let dst = self.pool.get(req.xd.dst_mem())?;
        match req.dim {
            RequestDim::D1 => dst.copy_from(req.dst_off, &src, req.src_off, req.nbytes),
            RequestDim::D2 { src_stride, dst_stride, nlines } => {
                for line in 0..nlines {
                    dst.copy_from(
                        req.dst_off + line * dst_stride,
                        &src,
                        req.src_off + line * src_stride,
                        req.nbytes,
                    )?;
                }
                Ok(())
            },
        }
    }
}

impl Channel for MemcpyChannel {
    fn name(&self) -> &'static str {
        "memcpy"
    }

    fn serves(&self, kind: XferKind) -> bool {
        kind == XferKind::MemCpy
    }

    fn available(&self) -> usize {
        self.capacity
    }

    fn submit(&self, requests: Vec<Request>) -> usize {
        let count = requests.len();
        for req in requests {
            if req.nbytes > 0 {
                self.copy(&req).expect("memcpy channel given unreachable memory");
            }
            req.xd.notify_request_read_done(&req);
            req.xd.notify_request_write_done(&req);
        }
        count
    }

    fn pull(&self) {}
}

// GLOBAL CHANNEL
// ================================================================================================

/// Gets and puts against the node-shared global memory segment,
/// synchronously in the submitting thread.
pub struct GlobalChannel {
    pool: Arc<MemoryPool>,
    global: Arc<MemoryStore>,
    capacity: usize,
}

impl GlobalChannel {
    pub fn new(pool: Arc<MemoryPool>, global: Arc<MemoryStore>, capacity: usize) -> Self {
        Self { pool, global, capacity }
    }
}

impl Channel for GlobalChannel {
    fn name(&self) -> &'static str {
        "global"
    }

    fn serves(&self, kind: XferKind) -> bool {
        matches!(kind, XferKind::GlobalRead | XferKind::GlobalWrite)
    }

    fn available(&self) -> usize {
        self.capacity
    }

    fn submit(&self, requests: Vec<Request>) -> usize {
        let count = requests.len();
        for req in requests {
            if req.nbytes > 0 {
                match req.xd.kind() {
                    XferKind::GlobalRead => {
                        let local = self
                            .pool
                            .get(req.xd.dst_mem())
                            .expect("global channel given unreachable memory");
                        local
                            .copy_from(req.dst_off, &self.global, req.src_off, req.nbytes)
                            .expect("global read out of bounds");
                    },
                    XferKind::GlobalWrite => {
                        let local = self
                            .pool
                            .get(req.xd.src_mem())
                            .expect("global channel given unreachable memory");
                        self.global
                            .copy_from(req.dst_off, &local, req.src_off, req.nbytes)
                            .expect("global write out of bounds");
                    },
                    other => unreachable!("global channel driving {other:?}"),
                }
            }
            req.xd.notify_request_read_done(&req);
            req.xd.notify_request_write_done(&req);
        }
        count
    }

    fn pull(&self) {}
}

// REMOTE WRITE CHANNEL
// ================================================================================================

/// Ships bytes to registered memory on another node. The data-carrying
/// message piggy-backs the byte-count update for the consumer descriptor on
/// the destination node; the in-flight slot is retired by the acknowledgement
/// handler.
pub struct RemoteWriteChannel {
    pool: Arc<MemoryPool>,
    fabric: Arc<dyn MessageFabric>,
    /// In-flight requests, echoed back by acks.
    pending: Arc<HandleTable<Request>>,
    capacity: AtomicUsize,
}

impl RemoteWriteChannel {
    pub fn new(
        pool: Arc<MemoryPool>,
        fabric: Arc<dyn MessageFabric>,
        pending: Arc<HandleTable<Request>>,
        capacity: usize,
    ) -> Self {
        Self { pool, fabric, pending, capacity: AtomicUsize::new(capacity) }
    }

    /// Returns one slot to the channel; called when an ack retires a request
    /// or a zero-byte request completes locally.
    pub fn notify_completion(&self) {
        self.capacity.fetch_add(1, Ordering::SeqCst);
    }
}

impl Channel for RemoteWriteChannel {
    fn name(&self) -> &'static str {
        "remote-write"
    }

    fn serves(&self, kind: XferKind) -> bool {
        kind == XferKind::RemoteWrite
    }

    fn available(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    fn submit(&self, requests: Vec<Request>) -> usize {
        let count = requests.len();
        for req in requests {
            debug_assert_eq!(
                req.xd.dst_mem().kind,
                MemoryKind::Registered,
                "remote write target must be registered memory"
            );
            // send a message if there is data, or a consumer descriptor that
            // needs the piggy-backed update
            if req.nbytes > 0 || req.xd.next_xd_guid().exists() {
                let src = self
                    .pool
                    .get(req.xd.src_mem())
                    .expect("remote write channel given unreachable source");
                let payload =
                    src.read(req.src_off, req.nbytes).expect("remote write source out of bounds");
                let pre_bytes_total = if req.xd.iteration_completed() {
                    req.xd.bytes_total()
                } else {
                    UNKNOWN_BYTE_TOTAL
                };
                // zero-byte messages are not acked, so only data-carrying
                // requests park an in-flight slot
                let req_handle = if req.nbytes > 0 {
                    self.pending.register(req.clone())
                } else {
                    tessera_core::RemoteHandle { owner: self.fabric.local_node(), id: 0 }
                };
                let msg = XferDesRemoteWriteMessage {
                    dst_mem: req.xd.dst_mem(),
                    dst_off: req.dst_off,
                    payload,
                    req: req_handle,
                    next_xd_guid: req.xd.next_xd_guid(),
                    span_start: req.seq_pos,
                    span_size: req.seq_count,
                    pre_bytes_total,
                };
                trace!(target: "tessera::dma", guid = %req.xd.guid(), nbytes = req.nbytes,
                    dst = %req.dst_node, "remote write");
                self.fabric.send(req.dst_node, MessageKind::XferDesRemoteWrite, msg.to_bytes());
            }
            // empty transfers complete locally instead of waiting for an ack
            if req.nbytes == 0 {
                req.xd.notify_request_read_done(&req);
                req.xd.notify_request_write_done(&req);
                self.notify_completion();
            }
            self.capacity.fetch_sub(1, Ordering::SeqCst);
        }
        count
    }

    fn pull(&self) {}
}
