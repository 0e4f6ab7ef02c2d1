use std::sync::Arc;

use tessera_core::{Domain, DomainPoint, ShardId, ShardingId, UniqueId};

use crate::operation::OpKind;

// SHARDING FUNCTOR
// ================================================================================================

/// A pure function mapping a point of a launch domain to the shard that
/// owns it. Every shard must compute identical outputs for identical
/// inputs.
pub trait ShardingFunctor: Send + Sync {
    fn shard(&self, point: DomainPoint, domain: Domain, total_shards: u32) -> ShardId;
}

/// The default functor: linearized point index modulo the shard count.
pub struct ModuloShardingFunctor;

impl ShardingFunctor for ModuloShardingFunctor {
    fn shard(&self, point: DomainPoint, domain: Domain, total_shards: u32) -> ShardId {
        ShardId::new((domain.linearize(&point) % total_shards as u64) as u32)
    }
}

// MAPPER CALLBACK SURFACE
// ================================================================================================

/// A description of the operation a mapper decision is being made for.
#[derive(Clone, Debug)]
pub struct MappableDesc {
    pub uid: UniqueId,
    pub kind: OpKind,
    pub task_name: String,
}

/// Output of the select-sharding-functor callbacks.
#[derive(Clone, Copy, Debug)]
pub struct SelectShardingFunctorOutput {
    /// `ShardingId::INVALID` means the mapper failed to choose.
    pub chosen_functor: ShardingId,
}

/// Output of the must-epoch sharding selection.
#[derive(Clone, Copy, Debug)]
pub struct MustEpochShardingOutput {
    pub chosen_functor: ShardingId,
    /// When true, every shard contributes mapping results which are merged;
    /// otherwise shard 0 maps alone and broadcasts.
    pub collective_map_must_epoch: bool,
}

/// Input to the must-epoch mapping callback.
#[derive(Clone, Debug)]
pub struct MustEpochMapInput {
    pub tasks: Vec<MappableDesc>,
    pub constraint_count: usize,
    /// Shard to node-local processor mapping, present under control
    /// replication.
    pub shard_mapping: Vec<u64>,
    pub local_shard: ShardId,
}

/// Output of the must-epoch mapping callback.
#[derive(Clone, Debug, Default)]
pub struct MustEpochMapOutput {
    /// Chosen processor per task, as an opaque processor id.
    pub task_processors: Vec<u64>,
    /// Chosen instance per constraint, as an opaque distributed id; zero
    /// means the constraint was left unmapped by this shard.
    pub constraint_mappings: Vec<u64>,
    /// Relative confidence per constraint; exchanged mappings keep the
    /// highest weight, ties broken by the lower shard id.
    pub weights: Vec<i32>,
}

/// The mapper policy surface invoked by the runtime and by replicated
/// operations. Implementations must be deterministic across shards.
pub trait Mapper: Send + Sync {
    fn name(&self) -> &'static str;

    fn select_task_sharding_functor(&self, task: &MappableDesc) -> SelectShardingFunctorOutput {
        let _ = task;
        SelectShardingFunctorOutput { chosen_functor: ShardingId::new(0) }
    }

    fn select_copy_sharding_functor(&self, copy: &MappableDesc) -> SelectShardingFunctorOutput {
        self.select_task_sharding_functor(copy)
    }

    fn select_fill_sharding_functor(&self, fill: &MappableDesc) -> SelectShardingFunctorOutput {
        self.select_task_sharding_functor(fill)
    }

    fn select_partition_sharding_functor(
        &self,
        partition: &MappableDesc,
    ) -> SelectShardingFunctorOutput {
        self.select_task_sharding_functor(partition)
    }

    fn select_must_epoch_sharding_functor(
        &self,
        op: &MappableDesc,
    ) -> MustEpochShardingOutput {
        let _ = op;
        MustEpochShardingOutput {
            chosen_functor: ShardingId::new(0),
            collective_map_must_epoch: false,
        }
    }

    fn map_must_epoch(&self, input: &MustEpochMapInput) -> MustEpochMapOutput {
        // deterministic default: round-robin processors, every constraint
        // mapped by its task count with unit weight
        MustEpochMapOutput {
            task_processors: (0..input.tasks.len() as u64).collect(),
            constraint_mappings: (1..=input.constraint_count as u64).collect(),
            weights: vec![0; input.constraint_count],
        }
    }
}

/// The stock mapper: modulo sharding, round-robin placement.
pub struct DefaultMapper;

impl Mapper for DefaultMapper {
    fn name(&self) -> &'static str {
        "default"
    }
}

/// A mapper wrapper fixing the sharding functor, for tests and specialized
/// launches.
pub struct FixedShardingMapper {
    pub functor: ShardingId,
}

impl Mapper for FixedShardingMapper {
    fn name(&self) -> &'static str {
        "fixed-sharding"
    }

    fn select_task_sharding_functor(&self, _task: &MappableDesc) -> SelectShardingFunctorOutput {
        SelectShardingFunctorOutput { chosen_functor: self.functor }
    }
}

/// Convenience alias used throughout the replication layer.
pub type ArcMapper = Arc<dyn Mapper>;
