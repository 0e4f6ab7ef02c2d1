use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tessera_core::{
    Domain, FieldId, FieldMask, LogicalPartition, LogicalRegion, RegionInstanceId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};
use tracing::debug;

// FIELD DESCRIPTOR
// ================================================================================================

/// Names the field data used to compute a dependent partition: an instance
/// and the field within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldDescriptor {
    pub instance: RegionInstanceId,
    pub field: FieldId,
}

impl Serializable for FieldDescriptor {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.instance.write_into(target);
        self.field.write_into(target);
    }
}

impl Deserializable for FieldDescriptor {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            instance: RegionInstanceId::read_from(source)?,
            field: FieldId::read_from(source)?,
        })
    }
}

/// The flavor of a dependent-partition computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependentPartitionKind {
    ByField,
    ByImage,
    ByImageRange,
    ByPreimage,
    ByPreimageRange,
}

/// The flavor of a pending-partition computation. Unlike dependent
/// partitions these are pure index-space math and need no field data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PendingPartitionKind {
    Equal,
    Weighted,
    ByUnion,
    ByIntersection,
    ByDifference,
}

// REGION TREE FOREST
// ================================================================================================

/// The opaque region-tree analysis service.
///
/// The runtime core only needs aliasing/ancestry queries, deletion
/// mutations, and the partition-creation primitives that dependent
/// partitions invoke with their merged descriptors; everything else about
/// the region tree lives behind this trait.
pub trait RegionTreeForest: Send + Sync {
    /// Returns true if the two regions may share data.
    fn regions_overlap(&self, a: &LogicalRegion, b: &LogicalRegion) -> bool;

    /// Returns true if `child` is `ancestor` or a subregion of it.
    fn is_subregion(&self, child: &LogicalRegion, ancestor: &LogicalRegion) -> bool;

    /// Returns the dense domain of an index space, if known.
    fn domain_of(&self, index_space: u64) -> Option<Domain>;

    fn destroy_region(&self, region: LogicalRegion);
    fn destroy_index_space(&self, index_space: u64);
    fn destroy_field_space(&self, field_space: u32);
    fn free_fields(&self, field_space: u32, fields: FieldMask);

    /// Creates a partition from merged per-point field descriptors.
    fn create_dependent_partition(
        &self,
        kind: DependentPartitionKind,
        parent: LogicalRegion,
        color_space: Domain,
        descriptors: &[FieldDescriptor],
    ) -> LogicalPartition;

    /// Fills in the subspaces of a pending partition for the given colors.
    /// Pure local index-space math; callers may split the color space and
    /// compute disjoint slices independently.
    fn compute_pending_partition(
        &self,
        kind: PendingPartitionKind,
        parent: LogicalRegion,
        color_space: Domain,
        colors: &[tessera_core::DomainPoint],
    );
}

// IN-MEMORY FOREST
// ================================================================================================

struct ForestState {
    /// child index space -> parent index space
    parents: HashMap<u64, u64>,
    domains: HashMap<u64, Domain>,
    destroyed_regions: HashSet<LogicalRegion>,
    destroyed_index_spaces: HashSet<u64>,
    destroyed_field_spaces: HashSet<u32>,
    freed_fields: Vec<(u32, FieldMask)>,
    partitions: Vec<(DependentPartitionKind, LogicalRegion, Vec<FieldDescriptor>)>,
    pending_partitions: Vec<(PendingPartitionKind, LogicalRegion, Vec<tessera_core::DomainPoint>)>,
    next_partition: u64,
}

/// A self-contained forest for tests and single-process runs: ancestry via
/// an explicit parent map, and a record of every mutation for inspection.
pub struct InMemoryForest {
    state: Mutex<ForestState>,
}

impl InMemoryForest {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ForestState {
                parents: HashMap::new(),
                domains: HashMap::new(),
                destroyed_regions: HashSet::new(),
                destroyed_index_spaces: HashSet::new(),
                destroyed_field_spaces: HashSet::new(),
                freed_fields: Vec::new(),
                partitions: Vec::new(),
                pending_partitions: Vec::new(),
                next_partition: 1,
            }),
        }
    }

    /// Declares an index space with an optional parent and domain.
    pub fn declare_index_space(&self, space: u64, parent: Option<u64>, domain: Option<Domain>) {
        let mut state = self.state.lock();
        if let Some(parent) = parent {
            state.parents.insert(space, parent);
        }
        if let Some(domain) = domain {
            state.domains.insert(space, domain);
        }
    }

    pub fn destroyed_regions(&self) -> Vec<LogicalRegion> {
        self.state.lock().destroyed_regions.iter().copied().collect()
    }

    pub fn destroyed_index_spaces(&self) -> Vec<u64> {
        self.state.lock().destroyed_index_spaces.iter().copied().collect()
    }

    pub fn freed_fields(&self) -> Vec<(u32, FieldMask)> {
        self.state.lock().freed_fields.clone()
    }

    /// The dependent partitions created so far, in creation order.
    pub fn created_partitions(
        &self,
    ) -> Vec<(DependentPartitionKind, LogicalRegion, Vec<FieldDescriptor>)> {
        self.state.lock().partitions.clone()
    }

    /// The pending-partition slices computed so far, in computation order.
    pub fn pending_partition_computations(
        &self,
    ) -> Vec<(PendingPartitionKind, LogicalRegion, Vec<tessera_core::DomainPoint>)> {
        self.state.lock().pending_partitions.clone()
    }

    fn ancestor_chain_contains(&self, state: &ForestState, child: u64, ancestor: u64) -> bool {
        let mut current = child;
        loop {
            if current == ancestor {
                return true;
            }
            match state.parents.get(&current) {
                Some(&parent) => current = parent,
                None => return false,
            }
        }
    }
}

impl Default for InMemoryForest {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTreeForest for InMemoryForest {
    fn regions_overlap(&self, a: &LogicalRegion, b: &LogicalRegion) -> bool {
        if a.tree_id != b.tree_id {
            return false;
        }
        if a.index_space == b.index_space {
            return true;
        }
        let state = self.state.lock();
        self.ancestor_chain_contains(&state, a.index_space, b.index_space)
            || self.ancestor_chain_contains(&state, b.index_space, a.index_space)
    }

    fn is_subregion(&self, child: &LogicalRegion, ancestor: &LogicalRegion) -> bool {
        if child.tree_id != ancestor.tree_id {
            return false;
        }
        let state = self.state.lock();
        self.ancestor_chain_contains(&state, child.index_space, ancestor.index_space)
    }

    fn domain_of(&self, index_space: u64) -> Option<Domain> {
        self.state.lock().domains.get(&index_space).copied()
    }

    fn destroy_region(&self, region: LogicalRegion) {
        debug!(target: "tessera::forest", ?region, "destroy region");
        self.state.lock().destroyed_regions.insert(region);
    }

    fn destroy_index_space(&self, index_space: u64) {
        self.state.lock().destroyed_index_spaces.insert(index_space);
    }

    fn destroy_field_space(&self, field_space: u32) {
        self.state.lock().destroyed_field_spaces.insert(field_space);
    }

    fn free_fields(&self, field_space: u32, fields: FieldMask) {
        self.state.lock().freed_fields.push((field_space, fields));
    }

    fn create_dependent_partition(
        &self,
        kind: DependentPartitionKind,
        parent: LogicalRegion,
        _color_space: Domain,
        descriptors: &[FieldDescriptor],
    ) -> LogicalPartition {
        let mut state = self.state.lock();
        let index_partition = state.next_partition;
        state.next_partition += 1;
        state.partitions.push((kind, parent, descriptors.to_vec()));
        debug!(target: "tessera::forest", ?kind, ?parent, descriptors = descriptors.len(),
            index_partition, "create dependent partition");
        LogicalPartition { tree_id: parent.tree_id, index_partition, field_space: parent.field_space }
    }

    fn compute_pending_partition(
        &self,
        kind: PendingPartitionKind,
        parent: LogicalRegion,
        _color_space: Domain,
        colors: &[tessera_core::DomainPoint],
    ) {
        debug!(target: "tessera::forest", ?kind, ?parent, colors = colors.len(),
            "compute pending partition slice");
        self.state.lock().pending_partitions.push((kind, parent, colors.to_vec()));
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_determines_overlap() {
        let forest = InMemoryForest::new();
        forest.declare_index_space(1, None, None);
        forest.declare_index_space(2, Some(1), None);
        forest.declare_index_space(3, Some(1), None);

        let root = LogicalRegion::new(1, 1, 1);
        let left = LogicalRegion::new(1, 2, 1);
        let right = LogicalRegion::new(1, 3, 1);

        assert!(forest.regions_overlap(&root, &left));
        assert!(forest.is_subregion(&left, &root));
        assert!(!forest.is_subregion(&root, &left));
        // siblings do not alias in the dense double
        assert!(!forest.regions_overlap(&left, &right));
        // different trees never alias
        assert!(!forest.regions_overlap(&root, &LogicalRegion::new(2, 1, 1)));
    }
}
