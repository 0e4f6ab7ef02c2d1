use tessera_core::{
    Event,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};

// ADDRESS INFO
// ================================================================================================

/// Addressing produced by one iterator step: a base offset plus up to two
/// further dimensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddressInfo {
    pub base_offset: u64,
    pub bytes_per_chunk: u64,
    pub num_lines: u64,
    pub line_stride: u64,
    pub num_planes: u64,
    pub plane_stride: u64,
}

// TRANSFER ITERATOR
// ================================================================================================

/// A lazy cursor over the byte layout of one side of a transfer.
///
/// `step` may be tentative: the caller either confirms it or cancels it and
/// re-steps at a smaller size. A step can always be re-issued smaller; it can
/// never grow.
pub trait TransferIterator: Send {
    /// Returns an event that triggers once the iterator's layout metadata is
    /// resident. Descriptors are not enqueued until both iterators are ready.
    fn request_metadata(&mut self) -> Event {
        Event::NO_EVENT
    }

    /// Returns true once the iterator has covered all of its bytes.
    fn done(&self) -> bool;

    /// Advances by up to `max_bytes`, filling `info`, and returns the number
    /// of bytes covered. A `tentative` step stays revocable until
    /// `confirm_step` or `cancel_step`.
    fn step(&mut self, max_bytes: u64, info: &mut AddressInfo, tentative: bool) -> u64;

    /// Commits the pending tentative step.
    fn confirm_step(&mut self);

    /// Rolls back the pending tentative step.
    fn cancel_step(&mut self);
}

// LINEAR ITERATOR
// ================================================================================================

/// Iterates a contiguous byte range of an instance.
pub struct LinearIterator {
    base: u64,
    total: u64,
    pos: u64,
    tentative: Option<u64>,
    metadata: Event,
}

impl LinearIterator {
    pub fn new(base: u64, total: u64) -> Self {
        Self { base, total, pos: 0, tentative: None, metadata: Event::NO_EVENT }
    }

    /// Attaches a metadata-readiness event, for layouts that must be fetched
    /// before the iterator can run.
    pub fn with_metadata_event(mut self, event: Event) -> Self {
        self.metadata = event;
        self
    }
}

impl TransferIterator for LinearIterator {
    fn request_metadata(&mut self) -> Event {
        self.metadata.clone()
    }

    fn done(&self) -> bool {
        self.pos >= self.total
    }

    fn step(&mut self, max_bytes: u64, info: &mut AddressInfo, tentative: bool) -> u64 {
        debug_assert!(self.tentative.is_none(), "step while a tentative step is pending");
        let bytes = max_bytes.min(self.total - self.pos);
        *info = AddressInfo {
            base_offset: self.base + self.pos,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        if tentative {
            self.tentative = Some(self.pos);
        }
        self.pos += bytes;
        bytes
    }

    fn confirm_step(&mut self) {
        self.tentative = None;
    }

    fn cancel_step(&mut self) {
        let prev = self.tentative.take().expect("cancel without a tentative step");
        self.pos = prev;
    }
}

// WRAPPING ITERATOR
// ================================================================================================

/// Iterates a bounded circular intermediate buffer. Steps never cross the
/// wrap boundary; the iterator itself never reports done, since the number
/// of bytes flowing through the buffer is decided by its producer.
pub struct WrappingIterator {
    base: u64,
    size: u64,
    pos: u64,
    tentative: Option<u64>,
}

impl WrappingIterator {
    pub fn new(base: u64, size: u64) -> Self {
        assert!(size > 0, "intermediate buffer must have nonzero size");
        Self { base, size, pos: 0, tentative: None }
    }
}

impl TransferIterator for WrappingIterator {
    fn done(&self) -> bool {
        false
    }

    fn step(&mut self, max_bytes: u64, info: &mut AddressInfo, tentative: bool) -> u64 {
        debug_assert!(self.tentative.is_none(), "step while a tentative step is pending");
        let in_buffer = self.pos % self.size;
        let bytes = max_bytes.min(self.size - in_buffer);
        *info = AddressInfo {
            base_offset: self.base + in_buffer,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        if tentative {
            self.tentative = Some(self.pos);
        }
        self.pos += bytes;
        bytes
    }

    fn confirm_step(&mut self) {
        self.tentative = None;
    }

    fn cancel_step(&mut self) {
        let prev = self.tentative.take().expect("cancel without a tentative step");
        self.pos = prev;
    }
}

// STRIDED ITERATOR
// ================================================================================================

/// Iterates a 2-D rectangle of equally strided lines, one line segment per
/// step.
pub struct StridedIterator {
    base: u64,
    line_bytes: u64,
    stride: u64,
    lines: u64,
    pos: u64,
    tentative: Option<u64>,
}

impl StridedIterator {
    pub fn new(base: u64, line_bytes: u64, stride: u64, lines: u64) -> Self {
        assert!(stride >= line_bytes, "lines may not overlap");
        Self { base, line_bytes, stride, lines, pos: 0, tentative: None }
    }

    fn total(&self) -> u64 {
        self.line_bytes * self.lines
    }
}

impl TransferIterator for StridedIterator {
    fn done(&self) -> bool {
        self.pos >= self.total()
    }

    fn step(&mut self, max_bytes: u64, info: &mut AddressInfo, tentative: bool) -> u64 {
        debug_assert!(self.tentative.is_none(), "step while a tentative step is pending");
        let line = self.pos / self.line_bytes;
        let in_line = self.pos % self.line_bytes;
        // never cross a line boundary in one step
        let bytes = max_bytes.min(self.line_bytes - in_line);
        *info = AddressInfo {
            base_offset: self.base + line * self.stride + in_line,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: self.stride,
            num_planes: 1,
            plane_stride: 0,
        };
        if tentative {
            self.tentative = Some(self.pos);
        }
        self.pos += bytes;
        bytes
    }

    fn confirm_step(&mut self) {
        self.tentative = None;
    }

    fn cancel_step(&mut self) {
        let prev = self.tentative.take().expect("cancel without a tentative step");
        self.pos = prev;
    }
}

// ITERATOR DESCRIPTOR
// ================================================================================================

/// The wire form of a transfer iterator, shipped inside `XferDesCreate`
/// envelopes and instantiated on the executing node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IteratorDesc {
    Linear { base: u64, total: u64 },
    Wrapping { base: u64, size: u64 },
    Strided { base: u64, line_bytes: u64, stride: u64, lines: u64 },
}

impl IteratorDesc {
    /// Builds the runnable iterator this descriptor names.
    pub fn instantiate(&self) -> Box<dyn TransferIterator> {
        match *self {
            Self::Linear { base, total } => Box::new(LinearIterator::new(base, total)),
            Self::Wrapping { base, size } => Box::new(WrappingIterator::new(base, size)),
            Self::Strided { base, line_bytes, stride, lines } => {
                Box::new(StridedIterator::new(base, line_bytes, stride, lines))
            },
        }
    }

    /// Returns the total byte count if this iterator knows it.
    pub fn known_total(&self) -> Option<u64> {
        match *self {
            Self::Linear { total, .. } => Some(total),
            Self::Wrapping { .. } => None,
            Self::Strided { line_bytes, lines, .. } => Some(line_bytes * lines),
        }
    }
}

impl Serializable for IteratorDesc {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        match *self {
            Self::Linear { base, total } => {
                target.write_u8(0);
                target.write_u64(base);
                target.write_u64(total);
            },
            Self::Wrapping { base, size } => {
                target.write_u8(1);
                target.write_u64(base);
                target.write_u64(size);
            },
            Self::Strided { base, line_bytes, stride, lines } => {
                target.write_u8(2);
                target.write_u64(base);
                target.write_u64(line_bytes);
                target.write_u64(stride);
                target.write_u64(lines);
            },
        }
    }
}

impl Deserializable for IteratorDesc {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        match source.read_u8()? {
            0 => Ok(Self::Linear { base: source.read_u64()?, total: source.read_u64()? }),
            1 => Ok(Self::Wrapping { base: source.read_u64()?, size: source.read_u64()? }),
            2 => Ok(Self::Strided {
                base: source.read_u64()?,
                line_bytes: source.read_u64()?,
                stride: source.read_u64()?,
                lines: source.read_u64()?,
            }),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid iterator descriptor tag {other}"
            ))),
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_iterator_steps_and_cancels() {
        let mut iter = LinearIterator::new(100, 10);
        let mut info = AddressInfo::default();

        let got = iter.step(4, &mut info, true);
        assert_eq!(got, 4);
        assert_eq!(info.base_offset, 100);
        iter.cancel_step();

        let got = iter.step(3, &mut info, false);
        assert_eq!(got, 3);
        assert_eq!(info.base_offset, 100);

        let got = iter.step(100, &mut info, false);
        assert_eq!(got, 7);
        assert_eq!(info.base_offset, 103);
        assert!(iter.done());
    }

    #[test]
    fn wrapping_iterator_stops_at_wrap_boundary() {
        let mut iter = WrappingIterator::new(0, 8);
        let mut info = AddressInfo::default();

        assert_eq!(iter.step(6, &mut info, false), 6);
        assert_eq!(info.base_offset, 0);
        // only 2 bytes remain before the wrap
        assert_eq!(iter.step(6, &mut info, false), 2);
        assert_eq!(info.base_offset, 6);
        // wrapped back to the start
        assert_eq!(iter.step(6, &mut info, false), 6);
        assert_eq!(info.base_offset, 0);
        assert!(!iter.done());
    }

    #[test]
    fn strided_iterator_steps_one_line_at_a_time() {
        let mut iter = StridedIterator::new(0, 4, 16, 2);
        let mut info = AddressInfo::default();

        assert_eq!(iter.step(100, &mut info, false), 4);
        assert_eq!(info.base_offset, 0);
        assert_eq!(iter.step(100, &mut info, false), 4);
        assert_eq!(info.base_offset, 16);
        assert!(iter.done());
    }

    #[rstest::rstest]
    #[case::linear(IteratorDesc::Linear { base: 1, total: 2 })]
    #[case::wrapping(IteratorDesc::Wrapping { base: 3, size: 4 })]
    #[case::strided(IteratorDesc::Strided { base: 5, line_bytes: 6, stride: 8, lines: 2 })]
    fn descriptor_round_trips(#[case] desc: IteratorDesc) {
        let bytes = desc.to_bytes();
        assert_eq!(IteratorDesc::read_from_bytes(&bytes).unwrap(), desc);
    }
}
