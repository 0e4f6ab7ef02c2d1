use core::fmt;

use crate::{
    FieldMask, ProjectionId, ReductionOpId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};

// REGION HANDLES
// ================================================================================================

/// Names a logical region: a (tree, index space, field space) triple.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalRegion {
    pub tree_id: u32,
    pub index_space: u64,
    pub field_space: u32,
}

impl LogicalRegion {
    pub const fn new(tree_id: u32, index_space: u64, field_space: u32) -> Self {
        Self { tree_id, index_space, field_space }
    }
}

impl fmt::Debug for LogicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region({},{},{})", self.tree_id, self.index_space, self.field_space)
    }
}

impl Serializable for LogicalRegion {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.tree_id);
        target.write_u64(self.index_space);
        target.write_u32(self.field_space);
    }
}

impl Deserializable for LogicalRegion {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            tree_id: source.read_u32()?,
            index_space: source.read_u64()?,
            field_space: source.read_u32()?,
        })
    }
}

/// Names a logical partition of a region tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalPartition {
    pub tree_id: u32,
    pub index_partition: u64,
    pub field_space: u32,
}

impl fmt::Debug for LogicalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition({},{},{})", self.tree_id, self.index_partition, self.field_space)
    }
}

impl Serializable for LogicalPartition {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.tree_id);
        target.write_u64(self.index_partition);
        target.write_u32(self.field_space);
    }
}

impl Deserializable for LogicalPartition {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            tree_id: source.read_u32()?,
            index_partition: source.read_u64()?,
            field_space: source.read_u32()?,
        })
    }
}

// PRIVILEGES AND COHERENCE
// ================================================================================================

/// The access privilege an operation declares on a region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrivilegeMode {
    NoAccess,
    ReadOnly,
    ReadWrite,
    /// Write privilege that discards previous contents, so no true
    /// dependence on earlier writers is needed.
    WriteDiscard,
    Reduce(ReductionOpId),
}

impl PrivilegeMode {
    pub fn is_no_access(&self) -> bool {
        matches!(self, Self::NoAccess)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard)
    }

    pub fn is_write_discard(&self) -> bool {
        matches!(self, Self::WriteDiscard)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, Self::Reduce(_))
    }
}

impl Serializable for PrivilegeMode {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        match self {
            Self::NoAccess => target.write_u8(0),
            Self::ReadOnly => target.write_u8(1),
            Self::ReadWrite => target.write_u8(2),
            Self::WriteDiscard => target.write_u8(3),
            Self::Reduce(op) => {
                target.write_u8(4);
                op.write_into(target);
            },
        }
    }
}

impl Deserializable for PrivilegeMode {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        match source.read_u8()? {
            0 => Ok(Self::NoAccess),
            1 => Ok(Self::ReadOnly),
            2 => Ok(Self::ReadWrite),
            3 => Ok(Self::WriteDiscard),
            4 => Ok(Self::Reduce(ReductionOpId::read_from(source)?)),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid privilege mode {other}"
            ))),
        }
    }
}

/// The coherence an operation is willing to accept on a region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoherenceMode {
    Exclusive = 0,
    Atomic = 1,
    Simultaneous = 2,
    Relaxed = 3,
}

impl Serializable for CoherenceMode {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(*self as u8);
    }
}

impl Deserializable for CoherenceMode {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        match source.read_u8()? {
            0 => Ok(Self::Exclusive),
            1 => Ok(Self::Atomic),
            2 => Ok(Self::Simultaneous),
            3 => Ok(Self::Relaxed),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid coherence mode {other}"
            ))),
        }
    }
}

// REGION REQUIREMENT
// ================================================================================================

/// An operation's declaration of the data it touches: a region (or a
/// partition with a projection), a field set, a privilege and a coherence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRequirement {
    pub region: LogicalRegion,
    /// Set for index launches that project a partition onto per-point
    /// subregions.
    pub partition: Option<LogicalPartition>,
    pub projection: Option<ProjectionId>,
    pub fields: FieldMask,
    pub privilege: PrivilegeMode,
    pub coherence: CoherenceMode,
    /// The region from which privileges were derived in the parent task.
    pub parent: LogicalRegion,
}

impl RegionRequirement {
    /// A requirement on a whole region with privileges rooted at itself.
    pub fn new(
        region: LogicalRegion,
        fields: FieldMask,
        privilege: PrivilegeMode,
        coherence: CoherenceMode,
    ) -> Self {
        Self {
            region,
            partition: None,
            projection: None,
            fields,
            privilege,
            coherence,
            parent: region,
        }
    }
}

impl Serializable for RegionRequirement {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.region.write_into(target);
        self.partition.write_into(target);
        self.projection.write_into(target);
        self.fields.write_into(target);
        self.privilege.write_into(target);
        self.coherence.write_into(target);
        self.parent.write_into(target);
    }
}

impl Deserializable for RegionRequirement {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            region: LogicalRegion::read_from(source)?,
            partition: Option::read_from(source)?,
            projection: Option::read_from(source)?,
            fields: FieldMask::read_from(source)?,
            privilege: PrivilegeMode::read_from(source)?,
            coherence: CoherenceMode::read_from(source)?,
            parent: LogicalRegion::read_from(source)?,
        })
    }
}

// DEPENDENCE TYPES
// ================================================================================================

/// The kind of dependence between an earlier and a later region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DependenceType {
    NoDependence = 0,
    TrueDependence = 1,
    AntiDependence = 2,
    AtomicDependence = 3,
    SimultaneousDependence = 4,
}

impl Serializable for DependenceType {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(*self as u8);
    }
}

impl Deserializable for DependenceType {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        match source.read_u8()? {
            0 => Ok(Self::NoDependence),
            1 => Ok(Self::TrueDependence),
            2 => Ok(Self::AntiDependence),
            3 => Ok(Self::AtomicDependence),
            4 => Ok(Self::SimultaneousDependence),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid dependence type {other}"
            ))),
        }
    }
}

/// Downgrades a would-be dependence to an anti dependence when the earlier
/// use only read the data or is about to discard it.
fn check_for_anti_dependence(
    earlier: &RegionRequirement,
    _later: &RegionRequirement,
    actual: DependenceType,
) -> DependenceType {
    if earlier.privilege.is_read_only() || earlier.privilege.is_write_discard() {
        DependenceType::AntiDependence
    } else {
        actual
    }
}

/// Computes the dependence between two requirements on overlapping data,
/// `earlier` being the one registered first in program order.
///
/// The caller is responsible for checking that the regions and field masks
/// actually overlap; this function only consults privileges and coherence.
pub fn check_dependence_type(
    earlier: &RegionRequirement,
    later: &RegionRequirement,
) -> DependenceType {
    let (u1, u2) = (&earlier.privilege, &later.privilege);
    if u1.is_no_access() || u2.is_no_access() {
        return DependenceType::NoDependence;
    }
    if u1.is_read_only() && u2.is_read_only() {
        return DependenceType::NoDependence;
    }
    if let (PrivilegeMode::Reduce(op1), PrivilegeMode::Reduce(op2)) = (u1, u2) {
        // reductions with the same operator fold concurrently
        return if op1 == op2 {
            DependenceType::NoDependence
        } else {
            DependenceType::TrueDependence
        };
    }

    // at least one side writes or reduces against a reader/writer
    let (c1, c2) = (earlier.coherence, later.coherence);
    if c1 == CoherenceMode::Exclusive || c2 == CoherenceMode::Exclusive {
        check_for_anti_dependence(earlier, later, DependenceType::TrueDependence)
    } else if c1 == CoherenceMode::Atomic || c2 == CoherenceMode::Atomic {
        if c1 == CoherenceMode::Atomic && c2 == CoherenceMode::Atomic {
            check_for_anti_dependence(earlier, later, DependenceType::AtomicDependence)
        } else if (c1 == CoherenceMode::Atomic && u1.is_read_only())
            || (c2 == CoherenceMode::Atomic && u2.is_read_only())
        {
            DependenceType::NoDependence
        } else {
            check_for_anti_dependence(earlier, later, DependenceType::TrueDependence)
        }
    } else {
        // both sides asked for simultaneous or relaxed access
        DependenceType::SimultaneousDependence
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::FieldId;

    fn req(privilege: PrivilegeMode, coherence: CoherenceMode) -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion::new(1, 1, 1),
            FieldMask::from_field(FieldId::new(0)),
            privilege,
            coherence,
        )
    }

    #[rstest]
    #[case::readers_never_depend(
        PrivilegeMode::ReadOnly, CoherenceMode::Exclusive,
        PrivilegeMode::ReadOnly, CoherenceMode::Exclusive,
        DependenceType::NoDependence
    )]
    #[case::read_then_write_is_anti(
        PrivilegeMode::ReadOnly, CoherenceMode::Exclusive,
        PrivilegeMode::ReadWrite, CoherenceMode::Exclusive,
        DependenceType::AntiDependence
    )]
    #[case::write_then_read_is_true(
        PrivilegeMode::ReadWrite, CoherenceMode::Exclusive,
        PrivilegeMode::ReadOnly, CoherenceMode::Exclusive,
        DependenceType::TrueDependence
    )]
    #[case::discard_then_write_is_anti(
        PrivilegeMode::WriteDiscard, CoherenceMode::Exclusive,
        PrivilegeMode::ReadWrite, CoherenceMode::Exclusive,
        DependenceType::AntiDependence
    )]
    #[case::no_access_never_depends(
        PrivilegeMode::NoAccess, CoherenceMode::Exclusive,
        PrivilegeMode::ReadWrite, CoherenceMode::Exclusive,
        DependenceType::NoDependence
    )]
    #[case::atomic_writers_are_atomic(
        PrivilegeMode::ReadWrite, CoherenceMode::Atomic,
        PrivilegeMode::ReadWrite, CoherenceMode::Atomic,
        DependenceType::AtomicDependence
    )]
    #[case::atomic_reader_against_writer_passes(
        PrivilegeMode::ReadOnly, CoherenceMode::Atomic,
        PrivilegeMode::ReadWrite, CoherenceMode::Relaxed,
        DependenceType::NoDependence
    )]
    #[case::simultaneous_writers_share(
        PrivilegeMode::ReadWrite, CoherenceMode::Simultaneous,
        PrivilegeMode::ReadWrite, CoherenceMode::Simultaneous,
        DependenceType::SimultaneousDependence
    )]
    fn dependence_table(
        #[case] priv1: PrivilegeMode,
        #[case] coh1: CoherenceMode,
        #[case] priv2: PrivilegeMode,
        #[case] coh2: CoherenceMode,
        #[case] expected: DependenceType,
    ) {
        let earlier = req(priv1, coh1);
        let later = req(priv2, coh2);
        assert_eq!(check_dependence_type(&earlier, &later), expected);
    }

    #[test]
    fn matching_reductions_fold_concurrently() {
        let a = req(PrivilegeMode::Reduce(ReductionOpId::new(3)), CoherenceMode::Exclusive);
        let b = req(PrivilegeMode::Reduce(ReductionOpId::new(3)), CoherenceMode::Exclusive);
        assert_eq!(check_dependence_type(&a, &b), DependenceType::NoDependence);
        let c = req(PrivilegeMode::Reduce(ReductionOpId::new(4)), CoherenceMode::Exclusive);
        assert_eq!(check_dependence_type(&a, &c), DependenceType::TrueDependence);
    }

    #[test]
    fn requirement_round_trips() {
        let mut req = req(PrivilegeMode::Reduce(ReductionOpId::new(7)), CoherenceMode::Atomic);
        req.projection = Some(crate::ProjectionId::new(2));
        let bytes = req.to_bytes();
        assert_eq!(RegionRequirement::read_from_bytes(&bytes).unwrap(), req);
    }
}
