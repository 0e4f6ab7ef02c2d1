use core::fmt;

use crate::{
    FieldId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};

// FIELD MASK
// ================================================================================================

/// Maximum number of fields a mask can track per field space.
pub const MAX_FIELDS: u32 = 128;

/// A fixed-width bitmask over field allocation indexes.
///
/// Dependence analysis intersects masks to decide whether two region
/// requirements touch overlapping fields.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldMask(u128);

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: FieldMask = FieldMask(0);

    /// Returns a mask with the single field bit set.
    pub fn from_field(fid: FieldId) -> Self {
        let bit = fid.as_raw();
        assert!(bit < MAX_FIELDS, "field index {bit} exceeds mask width");
        Self(1u128 << bit)
    }

    /// Returns a mask covering all of the given fields.
    pub fn from_fields<I: IntoIterator<Item = FieldId>>(fields: I) -> Self {
        let mut mask = Self::EMPTY;
        for fid in fields {
            mask.set(fid);
        }
        mask
    }

    pub fn set(&mut self, fid: FieldId) {
        let bit = fid.as_raw();
        assert!(bit < MAX_FIELDS, "field index {bit} exceeds mask width");
        self.0 |= 1u128 << bit;
    }

    pub fn clear(&mut self, fid: FieldId) {
        let bit = fid.as_raw();
        if bit < MAX_FIELDS {
            self.0 &= !(1u128 << bit);
        }
    }

    pub fn contains(&self, fid: FieldId) -> bool {
        let bit = fid.as_raw();
        bit < MAX_FIELDS && (self.0 >> bit) & 1 == 1
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the intersection of two masks.
    pub fn overlap(&self, other: &FieldMask) -> FieldMask {
        FieldMask(self.0 & other.0)
    }

    /// Returns true if the two masks share any field.
    pub fn overlaps(&self, other: &FieldMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns the union of two masks.
    pub fn union(&self, other: &FieldMask) -> FieldMask {
        FieldMask(self.0 | other.0)
    }

    /// Returns the fields in `self` that are not in `other`.
    pub fn subtract(&self, other: &FieldMask) -> FieldMask {
        FieldMask(self.0 & !other.0)
    }

    /// Returns the number of fields set.
    pub fn pop_count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the set field indexes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = FieldId> + '_ {
        (0..MAX_FIELDS).filter(|bit| (self.0 >> bit) & 1 == 1).map(FieldId::new)
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask({:#034x})", self.0)
    }
}

impl Serializable for FieldMask {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.0 as u64);
        target.write_u64((self.0 >> 64) as u64);
    }
}

impl Deserializable for FieldMask {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let lo = source.read_u64()? as u128;
        let hi = source.read_u64()? as u128;
        Ok(Self(lo | (hi << 64)))
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_overlap() {
        let a = FieldMask::from_fields([FieldId::new(0), FieldId::new(3)]);
        let b = FieldMask::from_fields([FieldId::new(3), FieldId::new(64)]);
        assert!(a.overlaps(&b));
        assert_eq!(a.overlap(&b), FieldMask::from_field(FieldId::new(3)));
        assert_eq!(a.subtract(&b), FieldMask::from_field(FieldId::new(0)));
        assert!(!a.subtract(&a).overlaps(&a));
    }

    #[test]
    fn iter_returns_fields_in_order() {
        let mask = FieldMask::from_fields([FieldId::new(5), FieldId::new(1), FieldId::new(127)]);
        let fields: Vec<u32> = mask.iter().map(|f| f.as_raw()).collect();
        assert_eq!(fields, vec![1, 5, 127]);
        assert_eq!(mask.pop_count(), 3);
    }
}
