use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

// SEQUENCE ASSEMBLER
// ================================================================================================

/// Accumulates non-overlapping byte spans into a monotone contiguous prefix.
///
/// The prefix `[0, contig_amount)` is fully covered. Spans that arrive out of
/// order are parked in a map keyed by offset and absorbed into the prefix
/// once the gap before them closes. `first_noncontig` is a hint: any offset
/// below it (and at or above the prefix) is known to be uncovered.
///
/// Reads of the contiguous prefix are lock-free; only the span map takes the
/// internal mutex.
pub struct SequenceAssembler {
    contig_amount: AtomicU64,
    first_noncontig: AtomicU64,
    spans: Mutex<BTreeMap<u64, u64>>,
}

const NO_NONCONTIG: u64 = u64::MAX;

impl SequenceAssembler {
    pub fn new() -> Self {
        Self {
            contig_amount: AtomicU64::new(0),
            first_noncontig: AtomicU64::new(NO_NONCONTIG),
            spans: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the current contiguous prefix length.
    pub fn contig_amount(&self) -> u64 {
        self.contig_amount.load(Ordering::SeqCst)
    }

    /// Asks how many bytes starting at `start` are covered, up to `count`.
    pub fn span_exists(&self, start: u64, count: u64) -> u64 {
        // lock-free case 1: start inside the contiguous prefix
        let contig_sample = self.contig_amount.load(Ordering::SeqCst);
        if start < contig_sample {
            return count.min(contig_sample - start);
        }

        // lock-free case 2: start below the first non-contiguous span
        let noncontig_sample = self.first_noncontig.load(Ordering::SeqCst);
        if start < noncontig_sample {
            return 0;
        }

        // general case: walk the span map under the lock
        let spans = self.spans.lock();

        // recheck the prefix in case both counters were bumped between the
        // two samples above
        let contig_now = self.contig_amount.load(Ordering::SeqCst);
        if start < contig_now {
            return count.min(contig_now - start);
        }

        // find the span that might contain `start` and walk forward while
        // coverage stays contiguous
        let Some((&span_start, &span_len)) = spans.range(..=start).next_back() else {
            return 0;
        };
        if span_start + span_len <= start {
            return 0;
        }
        let mut max_avail = span_start + span_len - start;
        if max_avail >= count {
            return count;
        }
        for (&next_start, &next_len) in spans.range(start + 1..) {
            if next_start > start + max_avail {
                break;
            }
            max_avail += next_len;
            if max_avail >= count {
                return count;
            }
        }
        max_avail
    }

    /// Adds the span `[pos, pos + count)` and returns the amount by which
    /// the contiguous prefix advanced (zero if the span was parked).
    ///
    /// The advance is nonzero exactly when `pos` equals the prefix at the
    /// time of the call, and it may exceed `count` when parked spans are
    /// absorbed behind the new one.
    pub fn add_span(&self, pos: u64, count: u64) -> u64 {
        let mut span_end = pos + count;

        // fast path: extend the prefix without the lock
        if self
            .contig_amount
            .compare_exchange(pos, span_end, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // absorb any parked spans that are now adjacent
            if span_end == self.first_noncontig.load(Ordering::SeqCst) {
                let mut spans = self.spans.lock();
                loop {
                    let Some((&next_start, &next_len)) = spans.iter().next() else {
                        self.first_noncontig.store(NO_NONCONTIG, Ordering::SeqCst);
                        break;
                    };
                    if next_start == span_end {
                        let ok = self
                            .contig_amount
                            .compare_exchange(
                                span_end,
                                span_end + next_len,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok();
                        assert!(ok, "contig amount moved while spans lock held");
                        span_end += next_len;
                        spans.remove(&next_start);
                    } else {
                        self.first_noncontig.store(next_start, Ordering::SeqCst);
                        break;
                    }
                }
            }
            span_end - pos
        } else {
            // park the span and maybe lower the non-contiguous hint
            let mut spans = self.spans.lock();
            if pos < self.first_noncontig.load(Ordering::SeqCst) {
                self.first_noncontig.store(pos, Ordering::SeqCst);
            }
            spans.insert(pos, count);
            0
        }
    }
}

impl Default for SequenceAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SequenceAssembler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SequenceAssembler")
            .field("contig_amount", &self.contig_amount())
            .field("parked_spans", &self.spans.lock().len())
            .finish()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn in_order_spans_extend_prefix() {
        let seq = SequenceAssembler::new();
        assert_eq!(seq.add_span(0, 10), 10);
        assert_eq!(seq.add_span(10, 5), 5);
        assert_eq!(seq.contig_amount(), 15);
        assert_eq!(seq.span_exists(0, 15), 15);
        assert_eq!(seq.span_exists(5, 100), 10);
    }

    #[test]
    fn out_of_order_span_is_parked_then_absorbed() {
        let seq = SequenceAssembler::new();
        assert_eq!(seq.add_span(10, 5), 0);
        assert_eq!(seq.contig_amount(), 0);
        assert_eq!(seq.span_exists(10, 5), 5);
        assert_eq!(seq.span_exists(0, 5), 0);
        // closing the gap absorbs the parked span
        assert_eq!(seq.add_span(0, 10), 15);
        assert_eq!(seq.contig_amount(), 15);
    }

    #[test]
    fn span_exists_crosses_adjacent_parked_spans() {
        let seq = SequenceAssembler::new();
        seq.add_span(10, 5);
        seq.add_span(15, 5);
        assert_eq!(seq.span_exists(10, 10), 10);
        assert_eq!(seq.span_exists(12, 20), 8);
        assert_eq!(seq.span_exists(20, 1), 0);
    }

    #[test]
    fn add_span_advance_matches_contig_delta() {
        let seq = SequenceAssembler::new();
        seq.add_span(20, 10);
        seq.add_span(10, 10);
        let before = seq.contig_amount();
        let advance = seq.add_span(0, 10);
        assert_eq!(advance, seq.contig_amount() - before);
        assert_eq!(seq.contig_amount(), 30);
    }

    proptest! {
        // property: adding the spans of a full partition of [0, total) in any
        // order always converges to contig_amount == total, and each call
        // returns a nonzero advance exactly when it starts at the prefix
        #[test]
        fn random_permutation_converges(lens in prop::collection::vec(1u64..64, 1..24)) {
            use rand::seq::SliceRandom;

            let mut spans = Vec::new();
            let mut offset = 0;
            for len in &lens {
                spans.push((offset, *len));
                offset += len;
            }
            let total = offset;
            let mut rng = rand::rng();
            spans.shuffle(&mut rng);

            let seq = SequenceAssembler::new();
            for (pos, len) in spans {
                let before = seq.contig_amount();
                let advance = seq.add_span(pos, len);
                if pos == before {
                    prop_assert!(advance >= len);
                } else {
                    prop_assert_eq!(advance, 0);
                }
                prop_assert_eq!(seq.contig_amount(), before + advance);
            }
            prop_assert_eq!(seq.contig_amount(), total);
            prop_assert_eq!(seq.span_exists(0, total), total);
        }
    }
}
