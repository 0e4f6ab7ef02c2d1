//! The Tessera data-movement pipeline.
//!
//! A transfer is described by a chain of [`XferDes`] transfer descriptors,
//! one per hop, linked through bounded circular intermediate buffers. Each
//! descriptor lazily generates [`Request`]s against a pair of source and
//! destination iterators and hands them to a kind-specific [`Channel`] for
//! submission. Completion flows back through `SequenceAssembler`s; adjacent
//! descriptors on different nodes synchronize with explicit byte-count
//! update messages.
//!
//! [`XferDesQueue`] owns the descriptors on a node and drives them from a
//! set of DMA worker threads.

mod channel;
mod errors;
mod iterator;
mod memory;
mod messages;
mod queue;
mod xferdes;

#[cfg(test)]
mod tests;

// RE-EXPORTS
// ================================================================================================

pub use channel::{Channel, GlobalChannel, MemcpyChannel, RemoteWriteChannel};
pub use errors::TransferError;
pub use iterator::{
    AddressInfo, IteratorDesc, LinearIterator, StridedIterator, TransferIterator,
    WrappingIterator,
};
pub use memory::{MemoryPool, MemoryStore};
pub use messages::{
    NotifyXferDesCompleteMessage, UpdateNextBytesReadMessage, UpdatePreBytesWriteMessage,
    XferDesCreateMessage, XferDesDestroyMessage, XferDesRemoteWriteAckMessage,
    XferDesRemoteWriteMessage,
};
pub use queue::{XferDesQueue, XferDesSpec};
pub use xferdes::{Request, RequestDim, UpdateRouter, XdFence, XferDes, XferKind, XferOrder};

/// Default per-channel cap on the size of one generated request.
pub const DEFAULT_MAX_REQ_SIZE: u64 = 1 << 20;

/// Default number of preallocated request slots per transfer descriptor.
pub const DEFAULT_MAX_NR: usize = 8;
