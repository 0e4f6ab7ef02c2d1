use crate::{
    NodeId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};

// MESSAGE KINDS
// ================================================================================================

/// Discriminates node-to-node message envelopes. The payload layout for each
/// kind is defined by the subsystem that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    // transfer pipeline
    XferDesCreate = 0,
    XferDesDestroy = 1,
    UpdatePreBytesWrite = 2,
    UpdateNextBytesRead = 3,
    XferDesRemoteWrite = 4,
    XferDesRemoteWriteAck = 5,
    NotifyXferDesComplete = 6,

    // control replication
    ReplicateLaunch = 16,
    ReplicateDelete = 17,
    ReplicatePostMapped = 18,
    ReplicateTriggerComplete = 19,
    ReplicateTriggerCommit = 20,
    CollectiveMessage = 21,
    FutureMapRequest = 22,
    CompositeViewRequest = 23,
    TopViewRequest = 24,
    TopViewResponse = 25,
    CloneBarrier = 26,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Result<Self, DeserializationError> {
        match value {
            0 => Ok(Self::XferDesCreate),
            1 => Ok(Self::XferDesDestroy),
            2 => Ok(Self::UpdatePreBytesWrite),
            3 => Ok(Self::UpdateNextBytesRead),
            4 => Ok(Self::XferDesRemoteWrite),
            5 => Ok(Self::XferDesRemoteWriteAck),
            6 => Ok(Self::NotifyXferDesComplete),
            16 => Ok(Self::ReplicateLaunch),
            17 => Ok(Self::ReplicateDelete),
            18 => Ok(Self::ReplicatePostMapped),
            19 => Ok(Self::ReplicateTriggerComplete),
            20 => Ok(Self::ReplicateTriggerCommit),
            21 => Ok(Self::CollectiveMessage),
            22 => Ok(Self::FutureMapRequest),
            23 => Ok(Self::CompositeViewRequest),
            24 => Ok(Self::TopViewRequest),
            25 => Ok(Self::TopViewResponse),
            26 => Ok(Self::CloneBarrier),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid message kind {other}"
            ))),
        }
    }
}

impl Serializable for MessageKind {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(*self as u8);
    }
}

impl Deserializable for MessageKind {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Self::from_u8(source.read_u8()?)
    }
}

// FABRIC TRAITS
// ================================================================================================

/// Sends serialized envelopes to other nodes. Implementations must deliver
/// messages between the same (source, target) pair in send order.
pub trait MessageFabric: Send + Sync {
    /// Returns the node this fabric endpoint belongs to.
    fn local_node(&self) -> NodeId;

    /// Returns the number of nodes in the machine.
    fn node_count(&self) -> usize;

    /// Sends one envelope. Sending to the local node is allowed and loops
    /// back through the local dispatcher.
    fn send(&self, target: NodeId, kind: MessageKind, payload: Vec<u8>);
}

/// A subsystem that consumes incoming envelopes of some message kinds.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, from: NodeId, kind: MessageKind, payload: &[u8]);
}
