//! Ignore masks: the set of keycode ranges a client has asked the server to
//! hand to the screen reader instead of delivering to the client itself.

/// A half-open keycode range. Bounds are `u64` so that an inclusive wire
/// range ending at `u32::MAX` stays representable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KeyRange {
    pub lo: u64,
    pub hi: u64,
}

/// An ordered sequence of disjoint, non-adjacent half-open ranges. The wire
/// operations take inclusive `[lo, hi]` endpoints, as the protocol does;
/// internally everything is normalized to `[lo, hi)`.
#[derive(Debug, Clone, Default)]
pub struct KeyMask {
    ranges: Vec<KeyRange>,
}

impl KeyMask {
    #[inline]
    pub fn new() -> KeyMask {
        KeyMask { ranges: Vec::new() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    #[inline]
    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// Adds the inclusive range `[lo, hi]`, merging with any overlapping or
    /// adjacent ranges so the normalized form is preserved.
    pub fn add(&mut self, lo: u32, hi: u32) {
        debug_assert!(lo <= hi);

        let mut lo = u64::from(lo);
        let mut hi = u64::from(hi) + 1;

        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for range in self.ranges.drain(..) {
            if range.hi < lo {
                merged.push(range);
            } else if range.lo > hi {
                if !placed {
                    merged.push(KeyRange { lo, hi });
                    placed = true;
                }
                merged.push(range);
            } else {
                lo = lo.min(range.lo);
                hi = hi.max(range.hi);
            }
        }

        if !placed {
            merged.push(KeyRange { lo, hi });
        }

        self.ranges = merged;
    }

    /// Subtracts the inclusive range `[lo, hi]`. A removal strictly inside an
    /// existing range splits it in two.
    pub fn remove(&mut self, lo: u32, hi: u32) {
        debug_assert!(lo <= hi);

        let lo = u64::from(lo);
        let hi = u64::from(hi) + 1;

        let mut kept = Vec::with_capacity(self.ranges.len() + 1);

        for range in self.ranges.drain(..) {
            if range.hi <= lo || range.lo >= hi {
                kept.push(range);
                continue;
            }

            if range.lo < lo {
                kept.push(KeyRange { lo: range.lo, hi: lo });
            }
            if range.hi > hi {
                kept.push(KeyRange { lo: hi, hi: range.hi });
            }
        }

        self.ranges = kept;
    }

    /// Membership test, logarithmic in the number of ranges.
    pub fn contains(&self, key: u32) -> bool {
        let key = u64::from(key);

        self.ranges
            .binary_search_by(|range| {
                use std::cmp::Ordering;

                if range.hi <= key {
                    Ordering::Less
                } else if range.lo > key {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .is_ok()
    }
}
