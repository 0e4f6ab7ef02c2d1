//! Control replication for the Tessera runtime: one logical task runs as N
//! cooperating shards with identical observable behavior.
//!
//! The [`ShardManager`] owns shard lifecycle and message routing for one
//! launch; the collective primitives ([`Broadcast`], [`Gather`],
//! [`AllGather`], [`BarrierExchange`]) carry versioning, mapping and future
//! data between shards; and the `Repl*` operations are the replicated
//! variants of the runtime's operations, interposing a sharding step and
//! the collectives the original operations never needed.

mod collective;
mod concrete;
mod manager;
mod messages;
mod ops;
mod sharding;

#[cfg(test)]
mod tests;

// RE-EXPORTS
// ================================================================================================

pub use collective::{
    AllGather, BarrierExchange, BarrierWindow, Broadcast, Collective, CollectiveItem,
    ExchangePayload, Gather,
};
pub use concrete::{
    ConstraintChoice, ConstraintMappings, CrossProductCollective, DescriptorSet,
    FieldDescriptorExchange, FieldDescriptorGather, FutureBroadcast, FutureContributions,
    FutureExchange, FutureMapPayload, FutureNameExchange, FutureValue,
    MustEpochCompletionExchange, MustEpochDependenceExchange, MustEpochMappingBroadcast,
    MustEpochMappingExchange, MustEpochMappingPayload, PartitionHandleSet, PointOwnerMap,
    ShardSet, ShardSyncTree, ShardingGatherCollective, VersioningAdvance,
    VersioningInfoBroadcast,
};
pub use manager::{ReplBarriers, ReplBody, ReplicationService, ShardContext, ShardManager};
pub use messages::{
    CloneBarrierMessage, CollectiveMessage, CompositeViewRequestMessage,
    FutureMapRequestMessage, ReplicateDeleteMessage, ReplicateLaunchMessage,
    ReplicatePostMappedMessage, ReplicateTriggerCommitMessage,
    ReplicateTriggerCompleteMessage, TopViewRequestMessage, TopViewResponseMessage,
};
pub use ops::{
    PartitionThunk, ReplCopyOp, ReplDependentPartitionOp, ReplDeletionOp, ReplFillOp,
    ReplIndexTask, ReplIndividualTask, ReplMustEpochOp, ReplPendingPartitionOp, ReplTimingOp,
    sum_i64_fold,
};
pub use sharding::ShardingFunction;
