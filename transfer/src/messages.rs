use tessera_core::{
    MemoryHandle, NodeId, RemoteHandle, XferDesId,
    utils::{
        ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, read_blob,
        write_blob,
    },
};

use crate::{
    iterator::IteratorDesc,
    xferdes::{XferKind, XferOrder},
};

// XFERDES CREATE
// ================================================================================================

/// Creates a transfer descriptor on the node that will execute it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XferDesCreateMessage {
    pub launch_node: NodeId,
    pub guid: XferDesId,
    pub pre_xd_guid: XferDesId,
    pub next_xd_guid: XferDesId,
    pub next_max_rw_gap: u64,
    pub src_ib_offset: u64,
    pub src_ib_size: u64,
    pub mark_started: bool,
    pub max_req_size: u64,
    pub max_nr: u32,
    pub priority: i32,
    pub order: XferOrder,
    pub kind: XferKind,
    pub src_iter: IteratorDesc,
    pub dst_iter: IteratorDesc,
    pub src_mem: MemoryHandle,
    pub dst_mem: MemoryHandle,
    pub fence: RemoteHandle,
}

impl Serializable for XferDesCreateMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.launch_node.write_into(target);
        self.guid.write_into(target);
        self.pre_xd_guid.write_into(target);
        self.next_xd_guid.write_into(target);
        target.write_u64(self.next_max_rw_gap);
        target.write_u64(self.src_ib_offset);
        target.write_u64(self.src_ib_size);
        target.write_bool(self.mark_started);
        target.write_u64(self.max_req_size);
        target.write_u32(self.max_nr);
        target.write_u32(self.priority as u32);
        self.order.write_into(target);
        self.kind.write_into(target);
        self.src_iter.write_into(target);
        self.dst_iter.write_into(target);
        self.src_mem.write_into(target);
        self.dst_mem.write_into(target);
        self.fence.write_into(target);
    }
}

impl Deserializable for XferDesCreateMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            launch_node: NodeId::read_from(source)?,
            guid: XferDesId::read_from(source)?,
            pre_xd_guid: XferDesId::read_from(source)?,
            next_xd_guid: XferDesId::read_from(source)?,
            next_max_rw_gap: source.read_u64()?,
            src_ib_offset: source.read_u64()?,
            src_ib_size: source.read_u64()?,
            mark_started: source.read_bool()?,
            max_req_size: source.read_u64()?,
            max_nr: source.read_u32()?,
            priority: source.read_u32()? as i32,
            order: XferOrder::read_from(source)?,
            kind: XferKind::read_from(source)?,
            src_iter: IteratorDesc::read_from(source)?,
            dst_iter: IteratorDesc::read_from(source)?,
            src_mem: MemoryHandle::read_from(source)?,
            dst_mem: MemoryHandle::read_from(source)?,
            fence: RemoteHandle::read_from(source)?,
        })
    }
}

// XFERDES DESTROY
// ================================================================================================

/// Destroys the descriptor named by `guid` on its executing node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XferDesDestroyMessage {
    pub guid: XferDesId,
}

impl Serializable for XferDesDestroyMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.guid.write_into(target);
    }
}

impl Deserializable for XferDesDestroyMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self { guid: XferDesId::read_from(source)? })
    }
}

// BYTE-COUNT UPDATES
// ================================================================================================

/// Producer → consumer: bytes `[span_start, span_start + span_size)` of the
/// shared intermediate buffer are now valid. Carries the producer's final
/// byte total once it is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdatePreBytesWriteMessage {
    pub guid: XferDesId,
    pub span_start: u64,
    pub span_size: u64,
    /// `UNKNOWN_BYTE_TOTAL` until the producer finishes iterating.
    pub pre_bytes_total: u64,
}

impl Serializable for UpdatePreBytesWriteMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.guid.write_into(target);
        target.write_u64(self.span_start);
        target.write_u64(self.span_size);
        target.write_u64(self.pre_bytes_total);
    }
}

impl Deserializable for UpdatePreBytesWriteMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            guid: XferDesId::read_from(source)?,
            span_start: source.read_u64()?,
            span_size: source.read_u64()?,
            pre_bytes_total: source.read_u64()?,
        })
    }
}

/// Consumer → producer: bytes `[span_start, span_start + span_size)` of the
/// producer's circular view are free for overwrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateNextBytesReadMessage {
    pub guid: XferDesId,
    pub span_start: u64,
    pub span_size: u64,
}

impl Serializable for UpdateNextBytesReadMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.guid.write_into(target);
        target.write_u64(self.span_start);
        target.write_u64(self.span_size);
    }
}

impl Deserializable for UpdateNextBytesReadMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            guid: XferDesId::read_from(source)?,
            span_start: source.read_u64()?,
            span_size: source.read_u64()?,
        })
    }
}

// REMOTE WRITE
// ================================================================================================

/// A remote write: the payload plus the piggy-backed byte-count update for
/// the consumer descriptor on the destination node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XferDesRemoteWriteMessage {
    pub dst_mem: MemoryHandle,
    pub dst_off: u64,
    pub payload: Vec<u8>,
    /// Echoed in the ack; resolved on the sending node.
    pub req: RemoteHandle,
    pub next_xd_guid: XferDesId,
    pub span_start: u64,
    pub span_size: u64,
    pub pre_bytes_total: u64,
}

impl Serializable for XferDesRemoteWriteMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.dst_mem.write_into(target);
        target.write_u64(self.dst_off);
        write_blob(target, &self.payload);
        self.req.write_into(target);
        self.next_xd_guid.write_into(target);
        target.write_u64(self.span_start);
        target.write_u64(self.span_size);
        target.write_u64(self.pre_bytes_total);
    }
}

impl Deserializable for XferDesRemoteWriteMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            dst_mem: MemoryHandle::read_from(source)?,
            dst_off: source.read_u64()?,
            payload: read_blob(source)?,
            req: RemoteHandle::read_from(source)?,
            next_xd_guid: XferDesId::read_from(source)?,
            span_start: source.read_u64()?,
            span_size: source.read_u64()?,
            pre_bytes_total: source.read_u64()?,
        })
    }
}

/// Acknowledges a remote write; retires the in-flight request slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XferDesRemoteWriteAckMessage {
    pub req: RemoteHandle,
}

impl Serializable for XferDesRemoteWriteAckMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.req.write_into(target);
    }
}

impl Deserializable for XferDesRemoteWriteAckMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self { req: RemoteHandle::read_from(source)? })
    }
}

// COMPLETION NOTICE
// ================================================================================================

/// Tells the launch node that a remotely executed descriptor finished; the
/// launch node triggers the fence the handle names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotifyXferDesCompleteMessage {
    pub fence: RemoteHandle,
}

impl Serializable for NotifyXferDesCompleteMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.fence.write_into(target);
    }
}

impl Deserializable for NotifyXferDesCompleteMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self { fence: RemoteHandle::read_from(source)? })
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use tessera_core::{MemoryKind, UNKNOWN_BYTE_TOTAL};

    use super::*;

    #[test]
    fn create_message_round_trips() {
        let msg = XferDesCreateMessage {
            launch_node: NodeId::new(1),
            guid: XferDesId::new(NodeId::new(2), 5),
            pre_xd_guid: XferDesId::NO_GUID,
            next_xd_guid: XferDesId::new(NodeId::new(2), 6),
            next_max_rw_gap: 128 << 10,
            src_ib_offset: 0,
            src_ib_size: 0,
            mark_started: true,
            max_req_size: 1 << 20,
            max_nr: 8,
            priority: -3,
            order: XferOrder::SrcFifo,
            kind: XferKind::MemCpy,
            src_iter: IteratorDesc::Linear { base: 0, total: 1 << 20 },
            dst_iter: IteratorDesc::Wrapping { base: 0, size: 128 << 10 },
            src_mem: MemoryHandle::new(NodeId::new(2), MemoryKind::System, 0),
            dst_mem: MemoryHandle::new(NodeId::new(2), MemoryKind::System, 1),
            fence: RemoteHandle { owner: NodeId::new(1), id: 77 },
        };
        let bytes = msg.to_bytes();
        assert_eq!(XferDesCreateMessage::read_from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn update_messages_round_trip() {
        let pre = UpdatePreBytesWriteMessage {
            guid: XferDesId::new(NodeId::new(0), 1),
            span_start: 64,
            span_size: 32,
            pre_bytes_total: UNKNOWN_BYTE_TOTAL,
        };
        assert_eq!(
            UpdatePreBytesWriteMessage::read_from_bytes(&pre.to_bytes()).unwrap(),
            pre
        );

        let next = UpdateNextBytesReadMessage {
            guid: XferDesId::new(NodeId::new(0), 1),
            span_start: 96,
            span_size: 32,
        };
        assert_eq!(
            UpdateNextBytesReadMessage::read_from_bytes(&next.to_bytes()).unwrap(),
            next
        );
    }

    #[test]
    fn remote_write_round_trips() {
        let msg = XferDesRemoteWriteMessage {
            dst_mem: MemoryHandle::new(NodeId::new(3), MemoryKind::Registered, 0),
            dst_off: 4096,
            payload: vec![0xab; 64],
            req: RemoteHandle { owner: NodeId::new(0), id: 9 },
            next_xd_guid: XferDesId::NO_GUID,
            span_start: 0,
            span_size: 64,
            pre_bytes_total: 64,
        };
        assert_eq!(XferDesRemoteWriteMessage::read_from_bytes(&msg.to_bytes()).unwrap(), msg);
    }
}
