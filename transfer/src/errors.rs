use tessera_core::{MemoryHandle, XferDesId};

// TRANSFER ERROR
// ================================================================================================

/// Errors raised while constructing or driving a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("memory {0:?} is not registered with this node's pool")]
    UnknownMemory(MemoryHandle),
    #[error("memory {mem:?} access [{offset}, {offset_end}) exceeds size {size}", offset_end = offset + len)]
    OutOfBounds { mem: MemoryHandle, offset: u64, len: u64, size: u64 },
    #[error("no channel serves transfer kind {0:?}")]
    NoChannelForKind(crate::XferKind),
    #[error("transfer descriptor {0} is not resident on this node")]
    UnknownDescriptor(XferDesId),
    #[error("destination memory of a remote write must be registered memory, got {0:?}")]
    UnregisteredRemoteTarget(MemoryHandle),
}
