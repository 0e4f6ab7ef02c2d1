use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tessera_core::{
    CollectiveId, Event, ShardId, ShardingId,
    utils::{
        ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, read_blob,
        write_blob,
    },
};
use tessera_runtime::FieldDescriptor;

use crate::{
    collective::{AllGather, Broadcast, CollectiveItem, ExchangePayload, Gather},
    manager::ShardContext,
};

// SHARDING GATHER
// ================================================================================================

/// Debug-time agreement check: every shard contributes the sharding functor
/// its mapper chose; the target shard verifies they all match.
pub struct ShardingGatherCollective {
    gather: Arc<Gather<ShardingId>>,
    target: ShardId,
    local: ShardId,
}

impl ShardingGatherCollective {
    pub fn new(ctx: &Arc<ShardContext>, target: ShardId) -> Self {
        Self { gather: Gather::new(ctx, target), target, local: ctx.shard_id() }
    }

    pub fn with_id(ctx: &Arc<ShardContext>, id: tessera_core::CollectiveId, target: ShardId) -> Self {
        Self { gather: Gather::with_id(ctx, id, target), target, local: ctx.shard_id() }
    }

    pub fn contribute(&self, sid: ShardingId) {
        self.gather.contribute(sid);
    }

    pub fn is_target(&self) -> bool {
        self.local == self.target
    }

    /// Target side: true if every shard picked `expected`. Blocks; only for
    /// callers on application threads.
    pub fn validate(&self, expected: ShardingId) -> bool {
        debug_assert!(self.is_target());
        self.gather.wait_items().iter().all(|sid| *sid == expected)
    }

    /// Target side: verifies agreement once all contributions are in,
    /// aborting with `violation` on a mismatch.
    pub fn validate_async(&self, expected: ShardingId, violation: tessera_runtime::RuntimeError) {
        debug_assert!(self.is_target());
        let gather = Arc::clone(&self.gather);
        self.gather.done_event().add_waiter(Box::new(move |_poisoned: bool| {
            let items = gather.wait_items();
            if !items.iter().all(|sid| *sid == expected) {
                panic!("{violation}");
            }
        }));
    }
}

// VERSIONING BROADCAST
// ================================================================================================

/// The version-state advance information the owner shard of a point
/// broadcasts so other shards can update their region-tree state without
/// re-running dependence analysis.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersioningAdvance {
    /// Per region-requirement index, the advanced version-state names.
    pub states: BTreeMap<u32, Vec<u64>>,
}

impl Serializable for VersioningAdvance {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.states.len() as u32);
        for (index, states) in &self.states {
            target.write_u32(*index);
            target.write_u32(states.len() as u32);
            for state in states {
                target.write_u64(*state);
            }
        }
    }
}

impl Deserializable for VersioningAdvance {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut states = BTreeMap::new();
        for _ in 0..count {
            let index = source.read_u32()?;
            let len = source.read_u32()? as usize;
            let mut entry = Vec::with_capacity(len);
            for _ in 0..len {
                entry.push(source.read_u64()?);
            }
            states.insert(index, entry);
        }
        Ok(Self { states })
    }
}

/// Broadcast of [`VersioningAdvance`] from the owner shard. The owner holds
/// its valid references until every shard acknowledges through the done
/// event.
pub struct VersioningInfoBroadcast {
    inner: Arc<Broadcast<VersioningAdvance>>,
    owner: ShardId,
    local: ShardId,
}

impl VersioningInfoBroadcast {
    pub fn new(ctx: &Arc<ShardContext>, owner: ShardId) -> Self {
        Self { inner: Broadcast::new(ctx, owner), owner, local: ctx.shard_id() }
    }

    pub fn with_id(ctx: &Arc<ShardContext>, id: CollectiveId, owner: ShardId) -> Self {
        Self { inner: Broadcast::with_id(ctx, id, owner), owner, local: ctx.shard_id() }
    }

    pub fn is_owner(&self) -> bool {
        self.local == self.owner
    }

    pub fn broadcast_states(&self, advance: VersioningAdvance) {
        self.inner.broadcast(advance);
    }

    pub fn done_event(&self) -> Event {
        self.inner.done_event()
    }

    pub fn wait_states(&self) -> VersioningAdvance {
        self.inner.wait_value()
    }
}

// FUTURE VALUES
// ================================================================================================

/// An opaque future value on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FutureValue(pub Vec<u8>);

impl Serializable for FutureValue {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        write_blob(target, &self.0);
    }
}

impl Deserializable for FutureValue {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self(read_blob(source)?))
    }
}

/// Broadcast of an individual task's future value from its owner shard.
pub type FutureBroadcast = Broadcast<FutureValue>;

/// Per-shard reduction contributions, folded in shard-id order on every
/// shard for bitwise determinism.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FutureContributions {
    pub per_shard: BTreeMap<u32, Vec<u8>>,
}

impl Serializable for FutureContributions {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.per_shard.len() as u32);
        for (shard, value) in &self.per_shard {
            target.write_u32(*shard);
            write_blob(target, value);
        }
    }
}

impl Deserializable for FutureContributions {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut per_shard = BTreeMap::new();
        for _ in 0..count {
            let shard = source.read_u32()?;
            per_shard.insert(shard, read_blob(source)?);
        }
        Ok(Self { per_shard })
    }
}

impl ExchangePayload for FutureContributions {
    fn merge(&mut self, other: Self) {
        self.per_shard.extend(other.per_shard);
    }
}

/// All-gather of per-shard partial reduction results.
pub struct FutureExchange {
    inner: Arc<AllGather<FutureContributions>>,
}

impl FutureExchange {
    pub fn new(ctx: &Arc<ShardContext>, local_value: Vec<u8>) -> Self {
        let mut initial = FutureContributions::default();
        initial.per_shard.insert(ctx.shard_id().as_raw(), local_value);
        Self { inner: AllGather::new(ctx, initial) }
    }

    pub fn with_id(
        ctx: &Arc<ShardContext>,
        id: CollectiveId,
        local_value: Vec<u8>,
    ) -> Self {
        let mut initial = FutureContributions::default();
        initial.per_shard.insert(ctx.shard_id().as_raw(), local_value);
        Self { inner: AllGather::with_id(ctx, id, initial) }
    }

    pub fn perform(&self) {
        self.inner.perform();
    }

    pub fn done_event(&self) -> Event {
        self.inner.done_event()
    }

    /// Folds every shard's contribution in ascending shard-id order.
    pub fn reduce_futures(&self, mut fold: impl FnMut(&mut Vec<u8>, &[u8])) -> Vec<u8> {
        let contributions = self.inner.wait_result();
        let mut accumulator = Vec::new();
        for value in contributions.per_shard.values() {
            fold(&mut accumulator, value);
        }
        accumulator
    }
}

/// Point results of an index launch, keyed by linearized point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FutureMapPayload {
    pub points: BTreeMap<u64, Vec<u8>>,
}

impl Serializable for FutureMapPayload {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.points.len() as u32);
        for (point, value) in &self.points {
            target.write_u64(*point);
            write_blob(target, value);
        }
    }
}

impl Deserializable for FutureMapPayload {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut points = BTreeMap::new();
        for _ in 0..count {
            let point = source.read_u64()?;
            points.insert(point, read_blob(source)?);
        }
        Ok(Self { points })
    }
}

impl ExchangePayload for FutureMapPayload {
    fn merge(&mut self, other: Self) {
        self.points.extend(other.points);
    }
}

/// All-gather of per-shard future-map fragments; afterwards every shard
/// holds the identical full map.
pub type FutureNameExchange = AllGather<FutureMapPayload>;

/// Encodes a future map the way [`FutureMapPayload`] travels on the wire.
pub fn encode_future_map(map: &BTreeMap<u64, Vec<u8>>) -> Vec<u8> {
    FutureMapPayload { points: map.clone() }.encode()
}

// FIELD DESCRIPTORS
// ================================================================================================

/// A mergeable set of field descriptors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    pub descriptors: BTreeSet<FieldDescriptor>,
}

impl Serializable for DescriptorSet {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.descriptors.len() as u32);
        for descriptor in &self.descriptors {
            descriptor.write_into(target);
        }
    }
}

impl Deserializable for DescriptorSet {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut descriptors = BTreeSet::new();
        for _ in 0..count {
            descriptors.insert(FieldDescriptor::read_from(source)?);
        }
        Ok(Self { descriptors })
    }
}

impl ExchangePayload for DescriptorSet {
    fn merge(&mut self, other: Self) {
        self.descriptors.extend(other.descriptors);
    }
}

/// All-to-all exchange of field descriptors (by-field dependent
/// partitions).
pub type FieldDescriptorExchange = AllGather<DescriptorSet>;

/// Gather of field descriptors to the shard performing the partition
/// computation (by-image / by-preimage flavors).
pub type FieldDescriptorGather = Gather<DescriptorSet>;

// CROSS PRODUCT
// ================================================================================================

/// Non-empty partition handles contributed by each shard of a pairwise
/// partition product.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionHandleSet {
    pub handles: BTreeSet<u64>,
}

impl Serializable for PartitionHandleSet {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.handles.len() as u32);
        for handle in &self.handles {
            target.write_u64(*handle);
        }
    }
}

impl Deserializable for PartitionHandleSet {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut handles = BTreeSet::new();
        for _ in 0..count {
            handles.insert(source.read_u64()?);
        }
        Ok(Self { handles })
    }
}

impl ExchangePayload for PartitionHandleSet {
    fn merge(&mut self, other: Self) {
        self.handles.extend(other.handles);
    }
}

/// All-gather of the non-empty partition handles of a cross product.
pub type CrossProductCollective = AllGather<PartitionHandleSet>;

// MUST-EPOCH COLLECTIVES
// ================================================================================================

/// Complete mapper output for a must-epoch launch, broadcast from one shard
/// when the mapper maps alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MustEpochMappingPayload {
    pub task_processors: Vec<u64>,
    pub constraint_mappings: Vec<u64>,
    pub weights: Vec<i64>,
}

impl Serializable for MustEpochMappingPayload {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.task_processors.len() as u32);
        for proc in &self.task_processors {
            target.write_u64(*proc);
        }
        target.write_u32(self.constraint_mappings.len() as u32);
        for mapping in &self.constraint_mappings {
            target.write_u64(*mapping);
        }
        target.write_u32(self.weights.len() as u32);
        for weight in &self.weights {
            target.write_u64(*weight as u64);
        }
    }
}

impl Deserializable for MustEpochMappingPayload {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut task_processors = Vec::with_capacity(count);
        for _ in 0..count {
            task_processors.push(source.read_u64()?);
        }
        let count = source.read_u32()? as usize;
        let mut constraint_mappings = Vec::with_capacity(count);
        for _ in 0..count {
            constraint_mappings.push(source.read_u64()?);
        }
        let count = source.read_u32()? as usize;
        let mut weights = Vec::with_capacity(count);
        for _ in 0..count {
            weights.push(source.read_u64()? as i64);
        }
        Ok(Self { task_processors, constraint_mappings, weights })
    }
}

/// Broadcast of one shard's complete must-epoch mapping.
pub type MustEpochMappingBroadcast = Broadcast<MustEpochMappingPayload>;

/// One shard's opinion on one constraint of a must-epoch mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstraintChoice {
    pub weight: i64,
    pub origin_shard: u32,
    pub mapping: u64,
}

impl ConstraintChoice {
    /// Deterministic merge: higher weight wins, ties broken by the lower
    /// origin shard.
    fn better_than(&self, other: &ConstraintChoice) -> bool {
        self.weight > other.weight
            || (self.weight == other.weight && self.origin_shard < other.origin_shard)
    }
}

/// Merged constraint mappings across shards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstraintMappings {
    pub choices: BTreeMap<u32, ConstraintChoice>,
}

impl Serializable for ConstraintMappings {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.choices.len() as u32);
        for (constraint, choice) in &self.choices {
            target.write_u32(*constraint);
            target.write_u64(choice.weight as u64);
            target.write_u32(choice.origin_shard);
            target.write_u64(choice.mapping);
        }
    }
}

impl Deserializable for ConstraintMappings {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut choices = BTreeMap::new();
        for _ in 0..count {
            let constraint = source.read_u32()?;
            let weight = source.read_u64()? as i64;
            let origin_shard = source.read_u32()?;
            let mapping = source.read_u64()?;
            choices.insert(constraint, ConstraintChoice { weight, origin_shard, mapping });
        }
        Ok(Self { choices })
    }
}

impl ExchangePayload for ConstraintMappings {
    fn merge(&mut self, other: Self) {
        for (constraint, incoming) in other.choices {
            match self.choices.get(&constraint) {
                Some(existing) if !incoming.better_than(existing) => {},
                _ => {
                    self.choices.insert(constraint, incoming);
                },
            }
        }
    }
}

/// All-gather of per-shard must-epoch mapping opinions with deterministic
/// tie-breaking.
pub type MustEpochMappingExchange = AllGather<ConstraintMappings>;

/// Point-to-owner assignments exchanged so every shard can wire the mapping
/// dependences of a must-epoch launch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PointOwnerMap {
    pub owners: BTreeMap<u64, u32>,
}

impl Serializable for PointOwnerMap {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.owners.len() as u32);
        for (point, shard) in &self.owners {
            target.write_u64(*point);
            target.write_u32(*shard);
        }
    }
}

impl Deserializable for PointOwnerMap {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut owners = BTreeMap::new();
        for _ in 0..count {
            let point = source.read_u64()?;
            owners.insert(point, source.read_u32()?);
        }
        Ok(Self { owners })
    }
}

impl ExchangePayload for PointOwnerMap {
    fn merge(&mut self, other: Self) {
        self.owners.extend(other.owners);
    }
}

/// All-gather of per-point mapping ownership for a must-epoch launch.
pub type MustEpochDependenceExchange = AllGather<PointOwnerMap>;

/// The set of shards whose constituents reached a lifecycle stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardSet {
    pub shards: BTreeSet<u32>,
}

impl Serializable for ShardSet {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.shards.len() as u32);
        for shard in &self.shards {
            target.write_u32(*shard);
        }
    }
}

impl Deserializable for ShardSet {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut shards = BTreeSet::new();
        for _ in 0..count {
            shards.insert(source.read_u32()?);
        }
        Ok(Self { shards })
    }
}

impl ExchangePayload for ShardSet {
    fn merge(&mut self, other: Self) {
        self.shards.extend(other.shards);
    }
}

/// All-gather of per-shard completion sets for a must-epoch launch.
pub type MustEpochCompletionExchange = AllGather<ShardSet>;

// SHARD SYNC TREE
// ================================================================================================

/// Wire token for the sync rendezvous.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncToken;

impl Serializable for SyncToken {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(0);
    }
}

impl Deserializable for SyncToken {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        source.read_u8()?;
        Ok(Self)
    }
}

/// One-shot rendezvous across all shards: a gather to shard 0 followed by a
/// broadcast back out. Used to synchronize lifecycle transitions.
pub struct ShardSyncTree {
    gather: Arc<Gather<SyncToken>>,
    broadcast: Arc<Broadcast<SyncToken>>,
    local: ShardId,
}

impl ShardSyncTree {
    pub fn new(ctx: &Arc<ShardContext>) -> Self {
        let origin = ShardId::new(0);
        Self {
            gather: Gather::new(ctx, origin),
            broadcast: Broadcast::new(ctx, origin),
            local: ctx.shard_id(),
        }
    }

    /// Blocks until every shard has arrived.
    pub fn synchronize(&self) {
        self.gather.contribute(SyncToken);
        if self.local == ShardId::new(0) {
            self.gather.done_event().wait();
            self.broadcast.broadcast(SyncToken);
        }
        self.broadcast.done_event().wait();
    }
}
