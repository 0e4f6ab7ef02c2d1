use std::sync::Arc;

use tessera_core::{Domain, DomainPoint, ShardId, ShardingId};
use tessera_runtime::ShardingFunctor;

// SHARDING FUNCTION
// ================================================================================================

/// A sharding functor bound to a concrete shard count.
///
/// Every shard of a replicated task holds an equivalent instance and must
/// compute identical outputs for identical inputs; that agreement is what
/// lets non-owning shards skip work without any coordination.
pub struct ShardingFunction {
    functor: Arc<dyn ShardingFunctor>,
    sid: ShardingId,
    total_shards: u32,
}

impl ShardingFunction {
    pub fn new(functor: Arc<dyn ShardingFunctor>, sid: ShardingId, total_shards: u32) -> Self {
        Self { functor, sid, total_shards }
    }

    pub fn sharding_id(&self) -> ShardingId {
        self.sid
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    /// Returns the shard that owns a point of the launch domain.
    pub fn find_owner(&self, point: &DomainPoint, domain: &Domain) -> ShardId {
        let owner = self.functor.shard(*point, *domain, self.total_shards);
        debug_assert!(owner.as_raw() < self.total_shards, "functor produced out-of-range shard");
        owner
    }

    /// Returns the points of `domain` owned by `shard`, in domain order.
    pub fn shard_points(&self, shard: ShardId, domain: &Domain) -> Vec<DomainPoint> {
        domain
            .points()
            .filter(|point| self.find_owner(point, domain) == shard)
            .collect()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use tessera_runtime::ModuloShardingFunctor;

    use super::*;

    #[test]
    fn modulo_function_partitions_the_domain() {
        let func =
            ShardingFunction::new(Arc::new(ModuloShardingFunctor), ShardingId::new(0), 4);
        let domain = Domain::new_1d(0, 15);

        for shard in 0..4u32 {
            let points = func.shard_points(ShardId::new(shard), &domain);
            let coords: Vec<i64> = points.iter().map(|p| p.coord(0)).collect();
            let expected: Vec<i64> =
                (0..16).filter(|x| (*x as u64) % 4 == shard as u64).collect();
            assert_eq!(coords, expected);
        }
    }

    #[test]
    fn owners_cover_every_point_exactly_once() {
        let func =
            ShardingFunction::new(Arc::new(ModuloShardingFunctor), ShardingId::new(0), 3);
        let domain = Domain::new_1d(0, 10);
        let total: usize = (0..3u32)
            .map(|shard| func.shard_points(ShardId::new(shard), &domain).len())
            .sum();
        assert_eq!(total as u64, domain.volume());
    }
}
