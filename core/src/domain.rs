use core::fmt;

use crate::utils::{
    ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable,
};

// DOMAIN POINT
// ================================================================================================

/// Maximum dimensionality of launch domains.
pub const MAX_POINT_DIM: usize = 3;

/// A point in an index-space launch domain, up to [`MAX_POINT_DIM`]
/// dimensions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainPoint {
    dim: u8,
    coords: [i64; MAX_POINT_DIM],
}

impl DomainPoint {
    pub fn new_1d(x: i64) -> Self {
        Self { dim: 1, coords: [x, 0, 0] }
    }

    pub fn new_2d(x: i64, y: i64) -> Self {
        Self { dim: 2, coords: [x, y, 0] }
    }

    pub fn new_3d(x: i64, y: i64, z: i64) -> Self {
        Self { dim: 3, coords: [x, y, z] }
    }

    pub fn dim(&self) -> usize {
        self.dim as usize
    }

    pub fn coord(&self, idx: usize) -> i64 {
        debug_assert!(idx < self.dim());
        self.coords[idx]
    }
}

impl fmt::Debug for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for idx in 0..self.dim() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", self.coords[idx])?;
        }
        write!(f, ")")
    }
}

impl Serializable for DomainPoint {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(self.dim);
        for coord in &self.coords {
            target.write_u64(*coord as u64);
        }
    }
}

impl Deserializable for DomainPoint {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let dim = source.read_u8()?;
        if dim as usize > MAX_POINT_DIM {
            return Err(DeserializationError::InvalidValue(format!(
                "point dimension {dim} exceeds maximum {MAX_POINT_DIM}"
            )));
        }
        let mut coords = [0i64; MAX_POINT_DIM];
        for coord in &mut coords {
            *coord = source.read_u64()? as i64;
        }
        Ok(Self { dim, coords })
    }
}

// DOMAIN
// ================================================================================================

/// A dense rectangular launch domain with inclusive bounds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Domain {
    lo: DomainPoint,
    hi: DomainPoint,
}

impl Domain {
    pub fn new(lo: DomainPoint, hi: DomainPoint) -> Self {
        assert_eq!(lo.dim(), hi.dim(), "domain bounds must share dimensionality");
        Self { lo, hi }
    }

    /// A 1-D domain `[lo, hi]` inclusive.
    pub fn new_1d(lo: i64, hi: i64) -> Self {
        Self::new(DomainPoint::new_1d(lo), DomainPoint::new_1d(hi))
    }

    pub fn lo(&self) -> DomainPoint {
        self.lo
    }

    pub fn hi(&self) -> DomainPoint {
        self.hi
    }

    pub fn dim(&self) -> usize {
        self.lo.dim()
    }

    pub fn is_empty(&self) -> bool {
        (0..self.dim()).any(|idx| self.hi.coord(idx) < self.lo.coord(idx))
    }

    /// Returns the number of points in the domain.
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (0..self.dim())
            .map(|idx| (self.hi.coord(idx) - self.lo.coord(idx) + 1) as u64)
            .product()
    }

    pub fn contains(&self, point: &DomainPoint) -> bool {
        point.dim() == self.dim()
            && (0..self.dim())
                .all(|idx| self.lo.coord(idx) <= point.coord(idx)
                    && point.coord(idx) <= self.hi.coord(idx))
    }

    /// Returns the zero-based row-major index of a point in the domain.
    pub fn linearize(&self, point: &DomainPoint) -> u64 {
        debug_assert!(self.contains(point));
        let mut index = 0u64;
        for idx in 0..self.dim() {
            let extent = (self.hi.coord(idx) - self.lo.coord(idx) + 1) as u64;
            index = index * extent + (point.coord(idx) - self.lo.coord(idx)) as u64;
        }
        index
    }

    /// Iterates all points of the domain in row-major order.
    pub fn points(&self) -> impl Iterator<Item = DomainPoint> + '_ {
        let volume = self.volume();
        (0..volume).map(move |mut linear| {
            let mut coords = [0i64; MAX_POINT_DIM];
            for idx in (0..self.dim()).rev() {
                let extent = (self.hi.coord(idx) - self.lo.coord(idx) + 1) as u64;
                coords[idx] = self.lo.coord(idx) + (linear % extent) as i64;
                linear /= extent;
            }
            DomainPoint { dim: self.lo.dim, coords }
        })
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}..={:?}", self.lo, self.hi)
    }
}

impl Serializable for Domain {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.lo.write_into(target);
        self.hi.write_into(target);
    }
}

impl Deserializable for Domain {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let lo = DomainPoint::read_from(source)?;
        let hi = DomainPoint::read_from(source)?;
        if lo.dim() != hi.dim() {
            return Err(DeserializationError::InvalidValue(
                "domain bounds with mismatched dimensionality".to_string(),
            ));
        }
        Ok(Self { lo, hi })
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_and_linearize_1d() {
        let dom = Domain::new_1d(0, 15);
        assert_eq!(dom.volume(), 16);
        assert_eq!(dom.linearize(&DomainPoint::new_1d(0)), 0);
        assert_eq!(dom.linearize(&DomainPoint::new_1d(15)), 15);
    }

    #[test]
    fn points_cover_2d_domain_in_row_major_order() {
        let dom = Domain::new(DomainPoint::new_2d(0, 0), DomainPoint::new_2d(1, 2));
        let points: Vec<DomainPoint> = dom.points().collect();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], DomainPoint::new_2d(0, 0));
        assert_eq!(points[1], DomainPoint::new_2d(0, 1));
        assert_eq!(points[5], DomainPoint::new_2d(1, 2));
        for (idx, point) in points.iter().enumerate() {
            assert_eq!(dom.linearize(point), idx as u64);
        }
    }

    #[test]
    fn empty_domain_has_zero_volume() {
        let dom = Domain::new_1d(5, 4);
        assert!(dom.is_empty());
        assert_eq!(dom.volume(), 0);
    }
}
