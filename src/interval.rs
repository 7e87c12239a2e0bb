//! Interval sets over byte offsets
//!
//! [`IntervalSet`] keeps a sorted set of non-overlapping `[start, start+len)`
//! intervals with the usual set algebra. [`BoundedIntervalSet`] wraps it with
//! a hard cap on the interval count: whenever a mutation pushes the count
//! over the cap, the shortest interval is dropped until the cap holds again.
//! The bounded variant trades coverage for bounded memory and is used where
//! occasional loss of an interval is acceptable (e.g. recovery push
//! bookkeeping).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum number of intervals a [`BoundedIntervalSet`] retains.
pub const MAX_NUM_INTERVALS: usize = 10;

// =============================================================================
// IntervalSet
// =============================================================================

/// Sorted set of non-overlapping `[start, start+len)` intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet {
    // start -> len, intervals never touch or overlap
    m: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    pub fn clear(&mut self) {
        self.m.clear();
    }

    pub fn num_intervals(&self) -> usize {
        self.m.len()
    }

    /// Total number of values covered.
    pub fn size(&self) -> u64 {
        self.m.values().sum()
    }

    /// Iterate intervals as `(start, len)` in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.m.iter().map(|(&s, &l)| (s, l))
    }

    /// Start of the first interval. Panics if empty.
    pub fn range_start(&self) -> u64 {
        *self.m.keys().next().expect("range_start on empty set")
    }

    /// End of the last interval (exclusive). Panics if empty.
    pub fn range_end(&self) -> u64 {
        let (&s, &l) = self.m.iter().next_back().expect("range_end on empty set");
        s + l
    }

    /// Whether `point` is covered.
    pub fn contains_point(&self, point: u64) -> bool {
        self.m
            .range(..=point)
            .next_back()
            .is_some_and(|(&s, &l)| point < s + l)
    }

    /// Whether the whole of `[start, start+len)` is covered by one interval.
    pub fn contains(&self, start: u64, len: u64) -> bool {
        self.m
            .range(..=start)
            .next_back()
            .is_some_and(|(&s, &l)| start >= s && start + len <= s + l)
    }

    /// Whether any part of `[start, start+len)` is covered.
    pub fn intersects(&self, start: u64, len: u64) -> bool {
        let end = start + len;
        if let Some((&s, &l)) = self.m.range(..=start).next_back() {
            if start < s + l {
                return true;
            }
        }
        self.m.range(start..end).next().is_some()
    }

    /// Whether some interval starts strictly after `point` (and `point`
    /// itself is uncovered).
    pub fn starts_after(&self, point: u64) -> bool {
        !self.contains_point(point) && self.m.range(point + 1..).next().is_some()
    }

    /// Start of the first interval after `point`. Panics unless
    /// [`starts_after`](Self::starts_after) holds.
    pub fn start_after(&self, point: u64) -> u64 {
        assert!(self.starts_after(point));
        *self.m.range(point + 1..).next().unwrap().0
    }

    /// End (exclusive) of the interval containing `start`. Panics if
    /// `start` is not covered.
    pub fn end_after(&self, start: u64) -> u64 {
        assert!(self.contains_point(start));
        let (&s, &l) = self.m.range(..=start).next_back().unwrap();
        s + l
    }

    /// Insert `[start, start+len)`, merging with any overlapping or
    /// adjacent intervals.
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + len;

        // Merge with a predecessor that overlaps or touches.
        if let Some((&s, &l)) = self.m.range(..=start).next_back() {
            if s + l >= new_start {
                new_start = s;
                new_end = new_end.max(s + l);
                self.m.remove(&s);
            }
        }
        // Merge with successors swallowed by (or touching) the new range.
        let swallowed: Vec<u64> = self
            .m
            .range(new_start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in swallowed {
            let l = self.m.remove(&s).unwrap();
            new_end = new_end.max(s + l);
        }
        self.m.insert(new_start, new_end - new_start);
    }

    /// Remove `[start, start+len)` from the set. Uncovered parts of the
    /// range are ignored.
    pub fn erase(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start + len;

        // Predecessor that extends into the erased range.
        if let Some((&s, &l)) = self.m.range(..start).next_back() {
            if s + l > start {
                self.m.insert(s, start - s);
                if s + l > end {
                    self.m.insert(end, (s + l) - end);
                }
            }
        }
        // Intervals starting inside the erased range.
        let inside: Vec<u64> = self.m.range(start..end).map(|(&s, _)| s).collect();
        for s in inside {
            let l = self.m.remove(&s).unwrap();
            if s + l > end {
                self.m.insert(end, (s + l) - end);
            }
        }
    }

    /// Add every interval of `other` to this set.
    pub fn union_with(&mut self, other: &IntervalSet) {
        for (s, l) in other.iter() {
            self.insert(s, l);
        }
    }

    /// Replace this set with the intersection of itself and `other`.
    pub fn intersection_with(&mut self, other: &IntervalSet) {
        let mut out = IntervalSet::new();
        for (s, l) in self.iter() {
            let end = s + l;
            for (os, ol) in other.iter() {
                let oe = os + ol;
                let lo = s.max(os);
                let hi = end.min(oe);
                if lo < hi {
                    out.insert(lo, hi - lo);
                }
            }
        }
        *self = out;
    }

    /// Remove every interval of `other` from this set.
    pub fn subtract(&mut self, other: &IntervalSet) {
        for (s, l) in other.iter() {
            self.erase(s, l);
        }
    }

    /// Whether every interval of this set is covered by `big`.
    pub fn subset_of(&self, big: &IntervalSet) -> bool {
        self.iter().all(|(s, l)| big.contains(s, l))
    }

    /// Build the subset of `other` starting at or after `start` and
    /// covering `len` values, skipping holes.
    pub fn span_of(&mut self, other: &IntervalSet, start: u64, mut len: u64) {
        self.clear();
        for (s, l) in other.iter() {
            if s + l <= start {
                continue;
            }
            if len == 0 {
                break;
            }
            let lo = s.max(start);
            let avail = (s + l) - lo;
            let take = avail.min(len);
            self.insert(lo, take);
            len -= take;
        }
    }
}

// =============================================================================
// BoundedIntervalSet
// =============================================================================

/// [`IntervalSet`] with a hard cap on the interval count.
///
/// Each mutating operation is followed by a trim pass that repeatedly
/// removes the shortest interval (first encountered on ties) while the
/// count exceeds the cap, so coverage is lossy but memory is bounded.
/// The cap itself is not persisted; encoding matches the plain set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedIntervalSet {
    #[serde(skip, default = "default_cap")]
    cap: usize,
    m: IntervalSet,
}

fn default_cap() -> usize {
    MAX_NUM_INTERVALS
}

impl Default for BoundedIntervalSet {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundedIntervalSet {
    pub fn new() -> Self {
        Self::with_cap(MAX_NUM_INTERVALS)
    }

    pub fn with_cap(cap: usize) -> Self {
        assert!(cap > 0);
        Self {
            cap,
            m: IntervalSet::new(),
        }
    }

    fn trim(&mut self) {
        while self.m.num_intervals() > self.cap {
            let shortest = self
                .m
                .iter()
                .min_by_key(|&(_, l)| l)
                .map(|(s, _)| s)
                .unwrap();
            let len = self.m.m[&shortest];
            self.m.erase(shortest, len);
        }
    }

    pub fn intervals(&self) -> &IntervalSet {
        &self.m
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    pub fn clear(&mut self) {
        self.m.clear();
    }

    pub fn num_intervals(&self) -> usize {
        self.m.num_intervals()
    }

    pub fn size(&self) -> u64 {
        self.m.size()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.m.iter()
    }

    pub fn range_start(&self) -> u64 {
        self.m.range_start()
    }

    pub fn range_end(&self) -> u64 {
        self.m.range_end()
    }

    pub fn contains(&self, start: u64, len: u64) -> bool {
        self.m.contains(start, len)
    }

    pub fn intersects(&self, start: u64, len: u64) -> bool {
        self.m.intersects(start, len)
    }

    pub fn starts_after(&self, point: u64) -> bool {
        self.m.starts_after(point)
    }

    pub fn start_after(&self, point: u64) -> u64 {
        self.m.start_after(point)
    }

    pub fn end_after(&self, start: u64) -> u64 {
        self.m.end_after(start)
    }

    pub fn subset_of(&self, big: &BoundedIntervalSet) -> bool {
        self.m.subset_of(&big.m)
    }

    pub fn insert(&mut self, start: u64, len: u64) {
        self.m.insert(start, len);
        self.trim();
    }

    pub fn erase(&mut self, start: u64, len: u64) {
        self.m.erase(start, len);
        self.trim();
    }

    pub fn union_with(&mut self, other: &BoundedIntervalSet) {
        self.m.union_with(&other.m);
        self.trim();
    }

    pub fn intersection_with(&mut self, other: &BoundedIntervalSet) {
        self.m.intersection_with(&other.m);
        self.trim();
    }

    pub fn subtract(&mut self, other: &BoundedIntervalSet) {
        self.m.subtract(&other.m);
        self.trim();
    }

    pub fn span_of(&mut self, other: &BoundedIntervalSet, start: u64, len: u64) {
        self.m.span_of(&other.m, start, len);
        self.trim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[(u64, u64)]) -> IntervalSet {
        let mut s = IntervalSet::new();
        for &(a, b) in pairs {
            s.insert(a, b);
        }
        s
    }

    #[test]
    fn test_insert_merges_overlapping_and_adjacent() {
        let mut s = IntervalSet::new();
        s.insert(0, 10);
        s.insert(10, 5); // adjacent
        assert_eq!(s.num_intervals(), 1);
        assert_eq!(s.size(), 15);

        s.insert(20, 5);
        s.insert(12, 10); // bridges both
        assert_eq!(s.num_intervals(), 1);
        assert_eq!((s.range_start(), s.range_end()), (0, 25));
    }

    #[test]
    fn test_erase_splits() {
        let mut s = set(&[(0, 100)]);
        s.erase(40, 20);
        assert_eq!(s.num_intervals(), 2);
        assert!(s.contains(0, 40));
        assert!(s.contains(60, 40));
        assert!(!s.intersects(40, 20));
    }

    #[test]
    fn test_contains_and_intersects() {
        let s = set(&[(5, 10), (20, 5)]);
        assert!(s.contains_point(5));
        assert!(s.contains_point(14));
        assert!(!s.contains_point(15));
        assert!(s.contains(6, 8));
        assert!(!s.contains(6, 20));
        assert!(s.intersects(14, 10));
        assert!(!s.intersects(15, 5));
    }

    #[test]
    fn test_start_end_queries() {
        let s = set(&[(5, 10), (20, 5)]);
        assert!(s.starts_after(15));
        assert_eq!(s.start_after(15), 20);
        assert_eq!(s.end_after(5), 15);
        assert_eq!(s.end_after(22), 25);
    }

    #[test]
    fn test_set_algebra() {
        let mut a = set(&[(0, 10), (20, 10)]);
        let b = set(&[(5, 20)]);

        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u, set(&[(0, 30)]));

        let mut i = a.clone();
        i.intersection_with(&b);
        assert_eq!(i, set(&[(5, 5), (20, 5)]));

        a.subtract(&b);
        assert_eq!(a, set(&[(0, 5), (25, 5)]));
    }

    #[test]
    fn test_span_of_skips_holes() {
        let other = set(&[(5, 10), (20, 5)]);
        let mut s = IntervalSet::new();
        s.span_of(&other, 8, 5);
        assert_eq!(s, set(&[(8, 5)]));

        s.span_of(&other, 8, 10);
        assert_eq!(s, set(&[(8, 7), (20, 3)]));
    }

    #[test]
    fn test_subset_of() {
        let big = set(&[(0, 100)]);
        let small = set(&[(10, 5), (50, 20)]);
        assert!(small.subset_of(&big));
        assert!(!big.subset_of(&small));
    }

    #[test]
    fn test_bounded_trims_shortest() {
        let mut s = BoundedIntervalSet::with_cap(3);
        s.insert(0, 100);
        s.insert(200, 50);
        s.insert(300, 10);
        s.insert(400, 75);
        assert_eq!(s.num_intervals(), 3);
        // The 10-long interval was the shortest.
        assert!(!s.intersects(300, 10));
        assert!(s.contains(0, 100));
        assert!(s.contains(200, 50));
        assert!(s.contains(400, 75));
    }

    #[test]
    fn test_bounded_never_exceeds_cap() {
        let mut s = BoundedIntervalSet::new();
        for i in 0..100u64 {
            s.insert(i * 10, 5);
            assert!(s.num_intervals() <= MAX_NUM_INTERVALS);
        }
    }

    #[test]
    fn test_bounded_exact_when_under_cap() {
        let mut bounded = BoundedIntervalSet::new();
        let mut exact = IntervalSet::new();
        for &(a, b) in &[(0u64, 5u64), (10, 5), (20, 5)] {
            bounded.insert(a, b);
            exact.insert(a, b);
        }
        assert_eq!(bounded.intervals(), &exact);
    }
}
