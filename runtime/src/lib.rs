//! The Tessera task runtime core: operations and their dependence pipeline,
//! task contexts with admission control, dependence-trace record/replay,
//! the mapper callback surface, the opaque region-tree facade, and the
//! node-to-node message fabric.
//!
//! Control replication lives in `tessera-replicate`; the data-movement
//! pipeline the runtime drives lives in `tessera-transfer`.

mod config;
mod context;
mod errors;
mod fabric;
mod forest;
mod mapper;
mod operation;
mod runtime;
mod trace;

pub mod ops;

#[cfg(test)]
mod tests;

// RE-EXPORTS
// ================================================================================================

pub use config::{ContextConfig, RuntimeConfig};
pub use context::{
    ContextVariant, InlineContext, InnerContext, LeafContext, LocalFieldInfo,
    RemoteContextSnapshot, TaskContext,
};
pub use errors::RuntimeError;
pub use fabric::LocalCluster;
pub use forest::{
    DependentPartitionKind, FieldDescriptor, InMemoryForest, PendingPartitionKind,
    RegionTreeForest,
};
pub use mapper::{
    ArcMapper, DefaultMapper, FixedShardingMapper, MappableDesc, Mapper, MustEpochMapInput,
    MustEpochMapOutput, MustEpochShardingOutput, ModuloShardingFunctor,
    SelectShardingFunctorOutput, ShardingFunctor,
};
pub use operation::{
    ArcOp, DependenceEdge, OpCore, OpKind, OpStatus, OperationLike, launch_operation,
};
pub use runtime::Runtime;
pub use trace::{AliasedChildren, DependenceRecord, Trace};
