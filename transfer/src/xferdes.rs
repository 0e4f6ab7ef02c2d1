use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tessera_core::{
    Event, MemoryHandle, NodeId, RemoteHandle, SequenceAssembler, UNKNOWN_BYTE_TOTAL, UserEvent,
    XferDesId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};
use tracing::{debug, info, trace};

use crate::iterator::{AddressInfo, TransferIterator};

// XFER KIND AND ORDER
// ================================================================================================

/// The kind of a transfer descriptor, which selects the channel that
/// executes its requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum XferKind {
    MemCpy = 0,
    GlobalRead = 1,
    GlobalWrite = 2,
    RemoteWrite = 3,
    DiskRead = 4,
    DiskWrite = 5,
    FileRead = 6,
    FileWrite = 7,
    GpuToFb = 8,
    GpuFromFb = 9,
    GpuInFb = 10,
    GpuPeerFb = 11,
    HdfRead = 12,
    HdfWrite = 13,
}

impl XferKind {
    pub fn from_u8(value: u8) -> Result<Self, DeserializationError> {
        Ok(match value {
            0 => Self::MemCpy,
            1 => Self::GlobalRead,
            2 => Self::GlobalWrite,
            3 => Self::RemoteWrite,
            4 => Self::DiskRead,
            5 => Self::DiskWrite,
            6 => Self::FileRead,
            7 => Self::FileWrite,
            8 => Self::GpuToFb,
            9 => Self::GpuFromFb,
            10 => Self::GpuInFb,
            11 => Self::GpuPeerFb,
            12 => Self::HdfRead,
            13 => Self::HdfWrite,
            other => {
                return Err(DeserializationError::InvalidValue(format!(
                    "invalid transfer kind {other}"
                )));
            },
        })
    }
}

impl Serializable for XferKind {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(*self as u8);
    }
}

impl Deserializable for XferKind {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Self::from_u8(source.read_u8()?)
    }
}

/// The request-generation order of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum XferOrder {
    SrcFifo = 0,
    DstFifo = 1,
    AnyOrder = 2,
}

impl Serializable for XferOrder {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(*self as u8);
    }
}

impl Deserializable for XferOrder {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        match source.read_u8()? {
            0 => Ok(Self::SrcFifo),
            1 => Ok(Self::DstFifo),
            2 => Ok(Self::AnyOrder),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid transfer order {other}"
            ))),
        }
    }
}

// REQUEST
// ================================================================================================

/// Dimensionality of one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestDim {
    D1,
    D2 { src_stride: u64, dst_stride: u64, nlines: u64 },
}

/// One channel-submittable chunk of a descriptor's byte timeline.
///
/// `seq_pos`/`seq_count` tag the contiguous span `[seq_pos, seq_pos +
/// seq_count)` of the transfer this request covers; completion notifications
/// feed those back into the descriptor's sequence assemblers.
#[derive(Clone)]
pub struct Request {
    pub xd: Arc<XferDes>,
    pub dim: RequestDim,
    pub src_off: u64,
    pub dst_off: u64,
    pub nbytes: u64,
    pub seq_pos: u64,
    pub seq_count: u64,
    /// Destination node, used by the remote-write channel.
    pub dst_node: NodeId,
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("xd", &self.xd.guid())
            .field("src_off", &self.src_off)
            .field("dst_off", &self.dst_off)
            .field("nbytes", &self.nbytes)
            .field("seq_pos", &self.seq_pos)
            .field("seq_count", &self.seq_count)
            .finish()
    }
}

// UPDATE ROUTER
// ================================================================================================

/// Routes byte-count updates and completion notices to descriptors that may
/// live on other nodes. Implemented by the descriptor queue.
pub trait UpdateRouter: Send + Sync {
    fn update_pre_bytes_write(&self, guid: XferDesId, offset: u64, size: u64, pre_total: u64);
    fn update_next_bytes_read(&self, guid: XferDesId, offset: u64, size: u64);
    fn notify_complete(&self, launch_node: NodeId, fence: RemoteHandle);
}

/// Where a descriptor's completion fence lives.
#[derive(Clone)]
pub enum XdFence {
    /// Fence owned by this node; triggered directly.
    Local(UserEvent),
    /// Fence owned by the launch node; triggered via message.
    Remote(RemoteHandle),
}

// XFERDES
// ================================================================================================

struct XdInner {
    src_iter: Box<dyn TransferIterator>,
    dst_iter: Box<dyn TransferIterator>,
    free_slots: usize,
}

/// A transfer descriptor: one hop of a transfer chain.
///
/// The descriptor owns paired source/destination iterators and four
/// sequence assemblers: `seq_read`/`seq_write` track its own progress,
/// `seq_pre_write` tracks how far its predecessor has filled the upstream
/// intermediate buffer, and `seq_next_read` tracks how far its successor
/// has drained the downstream one.
pub struct XferDes {
    guid: XferDesId,
    launch_node: NodeId,
    pre_xd_guid: XferDesId,
    next_xd_guid: XferDesId,
    src_mem: MemoryHandle,
    dst_mem: MemoryHandle,
    src_ib_offset: u64,
    src_ib_size: u64,
    max_req_size: u64,
    priority: i32,
    order: XferOrder,
    kind: XferKind,

    seq_read: SequenceAssembler,
    seq_write: SequenceAssembler,
    seq_pre_write: SequenceAssembler,
    seq_next_read: SequenceAssembler,

    /// Authoritative total from the predecessor; `UNKNOWN_BYTE_TOTAL` until
    /// the predecessor finishes iterating.
    pre_bytes_total: AtomicU64,
    bytes_total: AtomicU64,
    iteration_completed: AtomicBool,
    mark_start: AtomicBool,

    inner: Mutex<XdInner>,
    router: Arc<dyn UpdateRouter>,
    fence: XdFence,
}

#[allow(clippy::too_many_arguments)]
impl XferDes {
    pub fn new(
        guid: XferDesId,
        launch_node: NodeId,
        pre_xd_guid: XferDesId,
        next_xd_guid: XferDesId,
        next_max_rw_gap: u64,
        src_ib_offset: u64,
        src_ib_size: u64,
        mark_start: bool,
        src_mem: MemoryHandle,
        dst_mem: MemoryHandle,
        src_iter: Box<dyn TransferIterator>,
        dst_iter: Box<dyn TransferIterator>,
        max_req_size: u64,
        max_nr: usize,
        priority: i32,
        order: XferOrder,
        kind: XferKind,
        router: Arc<dyn UpdateRouter>,
        fence: XdFence,
    ) -> Arc<Self> {
        let xd = Arc::new(Self {
            guid,
            launch_node,
            pre_xd_guid,
            next_xd_guid,
            src_mem,
            dst_mem,
            src_ib_offset,
            src_ib_size,
            max_req_size,
            priority,
            order,
            kind,
            seq_read: SequenceAssembler::new(),
            seq_write: SequenceAssembler::new(),
            seq_pre_write: SequenceAssembler::new(),
            seq_next_read: SequenceAssembler::new(),
            pre_bytes_total: AtomicU64::new(UNKNOWN_BYTE_TOTAL),
            bytes_total: AtomicU64::new(0),
            iteration_completed: AtomicBool::new(false),
            mark_start: AtomicBool::new(mark_start),
            inner: Mutex::new(XdInner { src_iter, dst_iter, free_slots: max_nr }),
            router,
            fence,
        });
        // when writing into an intermediate buffer, the first gap's worth of
        // locations can be freely overwritten
        if xd.next_xd_guid.exists() {
            xd.seq_next_read.add_span(0, next_max_rw_gap);
        }
        xd
    }

    // PUBLIC ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn guid(&self) -> XferDesId {
        self.guid
    }

    pub fn kind(&self) -> XferKind {
        self.kind
    }

    pub fn order(&self) -> XferOrder {
        self.order
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn src_mem(&self) -> MemoryHandle {
        self.src_mem
    }

    pub fn dst_mem(&self) -> MemoryHandle {
        self.dst_mem
    }

    pub fn pre_xd_guid(&self) -> XferDesId {
        self.pre_xd_guid
    }

    /// Offset of the upstream intermediate buffer this descriptor reads
    /// from, within its source memory.
    pub fn src_ib_offset(&self) -> u64 {
        self.src_ib_offset
    }

    pub fn src_ib_size(&self) -> u64 {
        self.src_ib_size
    }

    pub fn next_xd_guid(&self) -> XferDesId {
        self.next_xd_guid
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::SeqCst)
    }

    pub fn pre_bytes_total(&self) -> u64 {
        self.pre_bytes_total.load(Ordering::SeqCst)
    }

    pub fn iteration_completed(&self) -> bool {
        self.iteration_completed.load(Ordering::SeqCst)
    }

    pub fn seq_read_contig(&self) -> u64 {
        self.seq_read.contig_amount()
    }

    pub fn seq_write_contig(&self) -> u64 {
        self.seq_write.contig_amount()
    }

    /// Takes the mark-start flag; true at most once, on the first scheduling
    /// of the first descriptor in the chain.
    pub fn take_mark_start(&self) -> bool {
        self.mark_start.swap(false, Ordering::SeqCst)
    }

    /// Returns an event that triggers once both iterators' layout metadata
    /// is resident.
    pub fn iterator_metadata(&self) -> Event {
        let mut inner = self.inner.lock();
        let src = inner.src_iter.request_metadata();
        let dst = inner.dst_iter.request_metadata();
        Event::merge(&[src, dst])
    }

    // REQUEST GENERATION
    // --------------------------------------------------------------------------------------------

    /// Generates up to `nr` requests against the iterator pair.
    ///
    /// Respects free request slots, `max_req_size`, the predecessor window
    /// (`seq_pre_write`), the successor window (`seq_next_read`) and the
    /// authoritative `pre_bytes_total` cap. Returns fewer than `nr` requests
    /// when the descriptor cannot currently make progress; it will be driven
    /// again when the next byte-count update arrives.
    pub fn get_requests(self: &Arc<Self>, nr: usize) -> Vec<Request> {
        let mut reqs = Vec::new();
        let mut inner = self.inner.lock();

        while reqs.len() < nr && inner.free_slots > 0 {
            if self.iteration_completed.load(Ordering::SeqCst) {
                break;
            }
            let bytes_total = self.bytes_total.load(Ordering::SeqCst);
            let pre_total = self.pre_bytes_total.load(Ordering::SeqCst);

            // empty transfers produce a single zero-byte request
            let src_drained = if self.pre_xd_guid.exists() {
                pre_total == 0
            } else {
                inner.src_iter.done()
            };
            if bytes_total == 0 && src_drained {
                info!(target: "tessera::xd", guid = %self.guid, "empty transfer");
                debug_assert!(self.next_xd_guid.exists() || inner.dst_iter.done());
                self.iteration_completed.store(true, Ordering::SeqCst);
                inner.free_slots -= 1;
                reqs.push(Request {
                    xd: Arc::clone(self),
                    dim: RequestDim::D1,
                    src_off: 0,
                    dst_off: 0,
                    nbytes: 0,
                    seq_pos: 0,
                    seq_count: 0,
                    dst_node: self.dst_mem.owner,
                });
                break;
            }

            let mut max_bytes = self.max_req_size;
            if self.pre_xd_guid.exists() {
                // never run ahead of what the predecessor will produce
                let pre_max = pre_total - bytes_total;
                if pre_max == 0 {
                    if bytes_total == 0 {
                        // an unsynchronized pre_bytes_total=0 update raced the
                        // empty-transfer check; loop so the top of the loop
                        // sees it
                        continue;
                    }
                    // the final bytes should have completed the iteration
                    debug_assert!(false, "pre_bytes_total reached mid-iteration");
                    self.iteration_completed.store(true, Ordering::SeqCst);
                    break;
                }
                if pre_max < max_bytes {
                    trace!(target: "tessera::xd", guid = %self.guid, max_bytes, pre_max,
                        "predecessor limits transfer");
                    max_bytes = pre_max;
                }
            }

            // tentative source step, checked against the predecessor window
            let mut src_info = AddressInfo::default();
            let src_bytes = inner.src_iter.step(max_bytes, &mut src_info, true);
            let src_bytes_avail = if self.pre_xd_guid.exists() {
                let avail = self.seq_pre_write.span_exists(bytes_total, src_bytes);
                if avail == 0 {
                    // no data from the predecessor yet; re-woken by the next
                    // update_pre_bytes_write
                    inner.src_iter.cancel_step();
                    break;
                }
                avail
            } else {
                src_bytes
            };

            // destination step, tentative only when a successor must first
            // drain the intermediate buffer
            let dst_tentative = self.next_xd_guid.exists();
            let mut dst_info = AddressInfo::default();
            let mut dst_bytes = inner.dst_iter.step(src_bytes_avail, &mut dst_info, dst_tentative);
            if self.next_xd_guid.exists() {
                let dst_avail = self.seq_next_read.span_exists(bytes_total, dst_bytes);
                if dst_avail == 0 {
                    // successor has not freed the buffer space yet
                    inner.dst_iter.cancel_step();
                    inner.src_iter.cancel_step();
                    break;
                }
                if dst_avail == dst_bytes {
                    inner.dst_iter.confirm_step();
                } else {
                    inner.dst_iter.cancel_step();
                    let redo = inner.dst_iter.step(dst_avail, &mut dst_info, false);
                    debug_assert_eq!(redo, dst_avail);
                    dst_bytes = redo;
                }
            }

            // reconcile: the source step can always be re-issued smaller
            let matched = if dst_bytes == src_bytes {
                inner.src_iter.confirm_step();
                src_bytes
            } else {
                debug_assert!(dst_bytes < src_bytes);
                inner.src_iter.cancel_step();
                let redo = inner.src_iter.step(dst_bytes, &mut src_info, false);
                debug_assert_eq!(redo, dst_bytes);
                redo
            };

            inner.free_slots -= 1;
            let req = Request {
                xd: Arc::clone(self),
                dim: RequestDim::D1,
                src_off: src_info.base_offset,
                dst_off: dst_info.base_offset,
                nbytes: matched,
                seq_pos: bytes_total,
                seq_count: matched,
                dst_node: self.dst_mem.owner,
            };
            let new_total = bytes_total + matched;
            self.bytes_total.store(new_total, Ordering::SeqCst);

            let pre_total = self.pre_bytes_total.load(Ordering::SeqCst);
            if inner.src_iter.done() || inner.dst_iter.done() || new_total == pre_total {
                debug_assert!(!self.iteration_completed.load(Ordering::SeqCst));
                self.iteration_completed.store(true, Ordering::SeqCst);
                // iterators without an intermediate buffer must end together
                debug_assert!(self.pre_xd_guid.exists() || inner.src_iter.done());
                debug_assert!(self.next_xd_guid.exists() || inner.dst_iter.done());
                debug_assert!(!self.pre_xd_guid.exists() || pre_total == new_total);
            }

            trace!(target: "tessera::xd", guid = %self.guid, src_off = req.src_off,
                dst_off = req.dst_off, nbytes = req.nbytes, "generated request");
            reqs.push(req);
        }
        reqs
    }

    // COMPLETION ACCOUNTING
    // --------------------------------------------------------------------------------------------

    /// Records that the read half of a request finished, and forwards the
    /// freed intermediate-buffer space to the predecessor.
    pub fn notify_request_read_done(&self, req: &Request) {
        self.update_bytes_read(req.seq_pos, req.seq_count);
    }

    /// Records that the write half of a request finished, forwards the newly
    /// valid bytes to the successor, and recycles the request slot.
    pub fn notify_request_write_done(&self, req: &Request) {
        self.update_bytes_write(req.seq_pos, req.seq_count);
        self.inner.lock().free_slots += 1;
    }

    fn update_bytes_read(&self, offset: u64, size: u64) {
        let inc_amt = self.seq_read.add_span(offset, size);
        debug!(target: "tessera::xd", guid = %self.guid, offset, size, inc_amt, "bytes_read");
        if self.pre_xd_guid.exists() && inc_amt > 0 {
            // tell the predecessor which offsets may be overwritten; shift by
            // the intermediate-buffer size to express the circular window
            self.router.update_next_bytes_read(
                self.pre_xd_guid,
                offset + self.src_ib_size,
                inc_amt,
            );
        }
    }

    fn update_bytes_write(&self, offset: u64, size: u64) {
        let inc_amt = self.seq_write.add_span(offset, size);
        debug!(target: "tessera::xd", guid = %self.guid, offset, size, inc_amt, "bytes_write");
        if self.kind == XferKind::RemoteWrite {
            // the remote-write message carries the update to the destination
            // node with lower latency; no standalone message
            return;
        }
        if self.next_xd_guid.exists() && inc_amt > 0 {
            let total = if self.iteration_completed.load(Ordering::SeqCst) {
                self.bytes_total.load(Ordering::SeqCst)
            } else {
                UNKNOWN_BYTE_TOTAL
            };
            self.router.update_pre_bytes_write(self.next_xd_guid, offset, inc_amt, total);
        }
    }

    /// Handles an `UpdatePreBytesWrite` from the predecessor.
    pub fn update_pre_bytes_write(&self, offset: u64, size: u64, pre_total: u64) {
        if pre_total != UNKNOWN_BYTE_TOTAL {
            let previous = self
                .pre_bytes_total
                .compare_exchange(
                    UNKNOWN_BYTE_TOTAL,
                    pre_total,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .unwrap_or_else(|current| current);
            debug_assert!(
                previous == UNKNOWN_BYTE_TOTAL || previous == pre_total,
                "predecessor byte total changed"
            );
        }
        let inc_amt = self.seq_pre_write.add_span(offset, size);
        debug!(target: "tessera::xd", guid = %self.guid, offset, size, inc_amt, pre_total,
            "pre_write");
    }

    /// Handles an `UpdateNextBytesRead` from the successor.
    pub fn update_next_bytes_read(&self, offset: u64, size: u64) {
        let inc_amt = self.seq_next_read.add_span(offset, size);
        debug!(target: "tessera::xd", guid = %self.guid, offset, size, inc_amt, "next_read");
    }

    // COMPLETION
    // --------------------------------------------------------------------------------------------

    /// True once iteration finished and every generated byte has been
    /// written. Stable once observed true.
    pub fn is_completed(&self) -> bool {
        if !self.iteration_completed.load(Ordering::SeqCst) {
            return false;
        }
        let total = self.bytes_total.load(Ordering::SeqCst);
        self.seq_write.span_exists(0, total) == total
    }

    /// Signals the completion fence; across nodes this sends a
    /// `NotifyXferDesComplete` back to the launch node.
    pub fn mark_completed(&self) {
        info!(target: "tessera::xd", guid = %self.guid, total = self.bytes_total(),
            "transfer descriptor complete");
        match &self.fence {
            XdFence::Local(fence) => fence.trigger(),
            XdFence::Remote(handle) => self.router.notify_complete(self.launch_node, *handle),
        }
    }
}

impl core::fmt::Debug for XferDes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XferDes")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("bytes_total", &self.bytes_total())
            .field("iteration_completed", &self.iteration_completed())
            .finish()
    }
}
