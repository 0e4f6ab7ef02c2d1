//! Core types shared by every layer of the Tessera runtime: identifiers,
//! the event/barrier completion facade, the byte-range sequence assembler
//! used by the transfer pipeline, field masks, privileges and region
//! requirements, and the wire-serialization helpers.
//!
//! This crate has no knowledge of operations, contexts, shards, or
//! channels. Higher layers (`tessera-transfer`, `tessera-runtime`,
//! `tessera-replicate`) build on these primitives.

mod domain;
mod event;
mod fabric;
mod fields;
mod handles;
mod ids;
mod memory;
mod privilege;
mod sequence;

pub mod utils;

// RE-EXPORTS
// ================================================================================================

pub use domain::{Domain, DomainPoint, MAX_POINT_DIM};
pub use event::{Barrier, BarrierSpace, BarrierToken, Event, EventWaiter, UserEvent};
pub use fabric::{MessageFabric, MessageHandler, MessageKind};
pub use fields::{FieldMask, MAX_FIELDS};
pub use handles::{HandleTable, RemoteHandle};
pub use ids::{
    CollectiveId, ContextId, DistributedId, FieldId, MapperId, NodeId, ProjectionId,
    ReductionOpId, ReplicationId, ShardId, ShardingId, TaskId, TraceId, UniqueId, XferDesId,
};
pub use memory::{MemoryHandle, MemoryKind, RegionInstanceId};
pub use privilege::{
    CoherenceMode, DependenceType, LogicalPartition, LogicalRegion, PrivilegeMode,
    RegionRequirement, check_dependence_type,
};
pub use sequence::SequenceAssembler;

/// Sentinel for a byte total that has not yet been finalized by an upstream
/// producer.
pub const UNKNOWN_BYTE_TOTAL: u64 = u64::MAX;
