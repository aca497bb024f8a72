//! Sets of disjoint closed ranges over the 64-bit value domain.
//!
//! An [`IntervalSet`] is the representation of "legal values" used throughout vmgen: free virtual address space,
//! physical memory that is still available for page tables, canonical address ranges, and so on.
//! The set is kept in canonical form at all times: ranges are sorted by their lower bound, and no two ranges overlap
//! or touch. Adding `[10, 20]` and `[21, 30]` therefore results in the single range `[10, 30]`.

use std::fmt::{self, Debug, Display, Formatter};

use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::{align_down, align_up};

mod offset;

pub use offset::BaseOffsetConstraint;

/// Error returned when a value is requested from an empty [`IntervalSet`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalError {
    /// The set contains no values.
    #[error("The interval set is empty")]
    EmptySet,
}

/// A closed range `[lo, hi]` of `u64` values.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u64, u64)", into = "(u64, u64)")]
pub struct Interval {
    lo: u64,
    hi: u64,
}

impl Interval {
    /// Creates the range `[lo, hi]`.
    ///
    /// # Panics
    /// Panics if `lo > hi`.
    #[inline]
    pub fn new(lo: u64, hi: u64) -> Interval {
        assert!(lo <= hi, "Invalid range: 0x{lo:x} > 0x{hi:x}");
        Interval {
            lo,
            hi,
        }
    }

    /// Creates the range of `size` values starting at `start`.
    ///
    /// # Panics
    /// Panics if `size` is zero or if the range would run past `u64::MAX`.
    #[inline]
    pub fn from_start_size(start: u64, size: u64) -> Interval {
        assert!(size > 0, "Invalid range: size is zero");
        let hi = start
            .checked_add(size - 1)
            .unwrap_or_else(|| panic!("Invalid range: 0x{start:x}+0x{size:x} overflows"));
        Interval::new(start, hi)
    }

    /// The lowest value in the range.
    #[inline]
    pub fn lo(&self) -> u64 {
        self.lo
    }

    /// The highest value in the range.
    #[inline]
    pub fn hi(&self) -> u64 {
        self.hi
    }

    /// The number of values in the range, saturating at `u64::MAX`.
    #[inline]
    pub fn size(&self) -> u64 {
        (self.hi - self.lo).saturating_add(1)
    }

    #[inline]
    fn wide_size(&self) -> u128 {
        (self.hi - self.lo) as u128 + 1
    }

    /// Returns true if `value` lies in the range.
    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        self.lo <= value && value <= self.hi
    }

    /// Returns true if every value of `other` lies in the range.
    #[inline]
    pub fn contains_interval(&self, other: &Interval) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    /// Returns true if the two ranges share at least one value.
    #[inline]
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

impl TryFrom<(u64, u64)> for Interval {
    type Error = String;

    fn try_from((lo, hi): (u64, u64)) -> Result<Self, Self::Error> {
        if lo <= hi {
            Ok(Interval {
                lo,
                hi,
            })
        } else {
            Err(format!("invalid range: 0x{lo:x} > 0x{hi:x}"))
        }
    }
}

impl From<Interval> for (u64, u64) {
    fn from(interval: Interval) -> Self {
        (interval.lo, interval.hi)
    }
}

impl Debug for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "0x{:x}", self.lo)
        } else {
            write!(f, "0x{:x}-0x{:x}", self.lo, self.hi)
        }
    }
}

/// A set of `u64` values, stored as sorted, disjoint, non-adjacent closed ranges.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Interval>", into = "Vec<Interval>")]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    /// Creates an empty set.
    pub fn new() -> IntervalSet {
        IntervalSet {
            intervals: Vec::new(),
        }
    }

    /// Creates the set `[lo, hi]`.
    ///
    /// # Panics
    /// Panics if `lo > hi`.
    pub fn from_range(lo: u64, hi: u64) -> IntervalSet {
        IntervalSet {
            intervals: vec![Interval::new(lo, hi)],
        }
    }

    /// Creates the set containing every `u64`.
    pub fn full() -> IntervalSet {
        IntervalSet::from_range(0, u64::MAX)
    }

    /// Iterates over the ranges in the set, in ascending order.
    pub fn intervals(&self) -> impl DoubleEndedIterator<Item = Interval> + ExactSizeIterator + '_ {
        self.intervals.iter().copied()
    }

    /// The number of ranges in the set.
    pub fn num_intervals(&self) -> usize {
        self.intervals.len()
    }

    /// Returns true if the set contains no values.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The number of values in the set, saturating at `u64::MAX`.
    pub fn size(&self) -> u64 {
        self.wide_size().min(u64::MAX as u128) as u64
    }

    fn wide_size(&self) -> u128 {
        self.intervals.iter().map(Interval::wide_size).sum()
    }

    /// The smallest value in the set.
    pub fn lower_bound(&self) -> Result<u64, IntervalError> {
        self.intervals.first().map(|i| i.lo).ok_or(IntervalError::EmptySet)
    }

    /// The largest value in the set.
    pub fn upper_bound(&self) -> Result<u64, IntervalError> {
        self.intervals.last().map(|i| i.hi).ok_or(IntervalError::EmptySet)
    }

    /// Adds the single value `value` to the set.
    pub fn add_value(&mut self, value: u64) {
        self.add_range(value, value);
    }

    /// Adds every value in `[lo, hi]` to the set.
    ///
    /// # Panics
    /// Panics if `lo > hi`.
    pub fn add_range(&mut self, lo: u64, hi: u64) {
        self.add_interval(Interval::new(lo, hi));
    }

    /// Adds every value in `interval` to the set.
    pub fn add_interval(&mut self, interval: Interval) {
        let Interval {
            lo,
            hi,
        } = interval;

        // Ranges in [start, end) overlap or touch the new range.
        let start = self.intervals.partition_point(|i| i.hi.saturating_add(1) < lo);
        let end = self.intervals.partition_point(|i| i.lo <= hi.saturating_add(1));

        let merged = if start < end {
            Interval::new(lo.min(self.intervals[start].lo), hi.max(self.intervals[end - 1].hi))
        } else {
            interval
        };

        self.intervals.splice(start..end, [merged]);
    }

    /// Adds every value in `other` to the set.
    pub fn add_set(&mut self, other: &IntervalSet) {
        for interval in other.intervals() {
            self.add_interval(interval);
        }
    }

    /// Removes the single value `value` from the set.
    pub fn sub_value(&mut self, value: u64) {
        self.sub_range(value, value);
    }

    /// Removes every value in `[lo, hi]` from the set.
    ///
    /// # Panics
    /// Panics if `lo > hi`.
    pub fn sub_range(&mut self, lo: u64, hi: u64) {
        self.sub_interval(Interval::new(lo, hi));
    }

    /// Removes every value in `interval` from the set.
    pub fn sub_interval(&mut self, interval: Interval) {
        let Interval {
            lo,
            hi,
        } = interval;

        // Ranges in [start, end) overlap the removed range.
        let start = self.intervals.partition_point(|i| i.hi < lo);
        let end = self.intervals.partition_point(|i| i.lo <= hi);
        if start >= end {
            return;
        }

        let first = self.intervals[start];
        let last = self.intervals[end - 1];
        let mut remaining = Vec::with_capacity(2);
        if first.lo < lo {
            remaining.push(Interval::new(first.lo, lo - 1));
        }

        if last.hi > hi {
            remaining.push(Interval::new(hi + 1, last.hi));
        }

        self.intervals.splice(start..end, remaining);
    }

    /// Removes every value in `other` from the set.
    pub fn subtract_set(&mut self, other: &IntervalSet) {
        for interval in other.intervals() {
            self.sub_interval(interval);
        }
    }

    /// Removes every value that is not in `other`.
    pub fn apply_intersection(&mut self, other: &IntervalSet) {
        let mut result = Vec::new();
        let (mut a, mut b) = (0, 0);
        while a < self.intervals.len() && b < other.intervals.len() {
            let (x, y) = (self.intervals[a], other.intervals[b]);
            let lo = x.lo.max(y.lo);
            let hi = x.hi.min(y.hi);
            if lo <= hi {
                result.push(Interval::new(lo, hi));
            }

            if x.hi < y.hi {
                a += 1;
            } else {
                b += 1;
            }
        }

        self.intervals = result;
    }

    /// Returns the values in `[0, u64::MAX]` that are not in the set.
    pub fn complement(&self) -> IntervalSet {
        let mut result = IntervalSet::full();
        result.subtract_set(self);
        result
    }

    /// Returns true if `value` is in the set.
    pub fn contains_value(&self, value: u64) -> bool {
        let index = self.intervals.partition_point(|i| i.hi < value);
        self.intervals.get(index).map(|i| i.lo <= value).unwrap_or(false)
    }

    /// Returns true if every value in `[lo, hi]` is in the set.
    ///
    /// # Panics
    /// Panics if `lo > hi`.
    pub fn contains_range(&self, lo: u64, hi: u64) -> bool {
        self.contains_interval(&Interval::new(lo, hi))
    }

    /// Returns true if every value in `interval` is in the set.
    pub fn contains_interval(&self, interval: &Interval) -> bool {
        let index = self.intervals.partition_point(|i| i.hi < interval.lo);
        self.intervals
            .get(index)
            .map(|i| i.contains_interval(interval))
            .unwrap_or(false)
    }

    /// Returns true if every value in `other` is in the set.
    pub fn contains_set(&self, other: &IntervalSet) -> bool {
        other.intervals.iter().all(|i| self.contains_interval(i))
    }

    /// Returns true if at least one value of `interval` is in the set.
    pub fn intersects_interval(&self, interval: &Interval) -> bool {
        let index = self.intervals.partition_point(|i| i.hi < interval.lo);
        self.intervals.get(index).map(|i| i.lo <= interval.hi).unwrap_or(false)
    }

    /// Returns true if the set and `other` share at least one value.
    pub fn intersects_set(&self, other: &IntervalSet) -> bool {
        let (mut a, mut b) = (0, 0);
        while a < self.intervals.len() && b < other.intervals.len() {
            let (x, y) = (&self.intervals[a], &other.intervals[b]);
            if x.overlaps(y) {
                return true;
            }

            if x.hi < y.hi {
                a += 1;
            } else {
                b += 1;
            }
        }

        false
    }

    /// Chooses a random value from the set.
    /// Every value is equally likely, so ranges are chosen proportionally to their size.
    pub fn choose_random_value(&self, rng: &mut impl Rng) -> Result<u64, IntervalError> {
        let total = self.wide_size();
        if total == 0 {
            return Err(IntervalError::EmptySet);
        }

        let mut index = rng.gen_range(0..total);
        for interval in self.intervals.iter() {
            let size = interval.wide_size();
            if index < size {
                return Ok(interval.lo + index as u64);
            }

            index -= size;
        }

        unreachable!("Random index is smaller than the total size")
    }

    /// Shrinks every range inward to multiples of `size`, so that each remaining range consists of whole, aligned
    /// blocks of `size` values. Ranges that do not contain a single aligned block are removed.
    ///
    /// # Panics
    /// Panics if `size` is not a power of two.
    pub fn align_with_size(&mut self, size: u64) {
        assert!(size.is_power_of_two(), "Alignment 0x{size:x} is not a power of two");
        let mask = size - 1;

        self.intervals.retain_mut(|interval| {
            let Some(lo) = align_up(interval.lo, size) else {
                return false
            };
            let hi = if interval.hi & mask == mask {
                interval.hi
            } else {
                match align_down(interval.hi, size).checked_sub(1) {
                    Some(hi) => hi,
                    None => return false,
                }
            };

            if lo < hi || (lo == hi && size == 1) {
                *interval = Interval::new(lo, hi);
                true
            } else {
                false
            }
        });
    }

    /// Translates every value by `+amount`, modulo 2^64.
    /// A range that crosses `u64::MAX` is split into a range ending at `u64::MAX` and a range starting at 0.
    pub fn shift_right(&mut self, amount: u64) {
        let old = std::mem::take(&mut self.intervals);
        for interval in old {
            let lo = interval.lo.wrapping_add(amount);
            let hi = interval.hi.wrapping_add(amount);
            if lo <= hi {
                self.add_range(lo, hi);
            } else {
                self.add_range(lo, u64::MAX);
                self.add_range(0, hi);
            }
        }
    }

    /// Translates every value by `-amount`, modulo 2^64.
    pub fn shift_left(&mut self, amount: u64) {
        self.shift_right(amount.wrapping_neg());
    }

    /// Returns the first contiguous run of values in the set that lies inside `[start, end]`.
    /// The run may begin after `start`, but it is clipped to `[start, end]`.
    pub fn leading_intersecting_range(&self, start: u64, end: u64) -> Option<Interval> {
        let window = Interval::new(start, end);
        let index = self.intervals.partition_point(|i| i.hi < start);
        self.intervals
            .get(index)
            .filter(|i| i.lo <= window.hi)
            .map(|i| Interval::new(i.lo.max(window.lo), i.hi.min(window.hi)))
    }

    fn aligned_starts(&self, align: u64, size: u64) -> impl DoubleEndedIterator<Item = (u64, u64)> + '_ {
        assert!(align.is_power_of_two(), "Alignment 0x{align:x} is not a power of two");
        assert!(size > 0, "Cannot allocate zero bytes");

        self.intervals.iter().flat_map(move |interval| {
            let first = align_up(interval.lo, align)?;
            let last = align_down(interval.hi.checked_sub(size - 1)?, align);
            (first <= last).then_some((first, last))
        })
    }

    /// Returns the lowest value `v`, aligned to `align`, such that `[v, v + size - 1]` lies in the set.
    pub fn lowest_aligned_start(&self, align: u64, size: u64) -> Option<u64> {
        self.aligned_starts(align, size).next().map(|(first, _)| first)
    }

    /// Returns the highest value `v`, aligned to `align`, such that `[v, v + size - 1]` lies in the set.
    pub fn highest_aligned_start(&self, align: u64, size: u64) -> Option<u64> {
        self.aligned_starts(align, size).next_back().map(|(_, last)| last)
    }

    /// Chooses a random value `v`, aligned to `align`, such that `[v, v + size - 1]` lies in the set.
    /// All such values are equally likely.
    pub fn choose_aligned_start(&self, align: u64, size: u64, rng: &mut impl Rng) -> Option<u64> {
        let starts = self.aligned_starts(align, size).collect::<Vec<_>>();
        let count = |(first, last): (u64, u64)| ((last - first) / align) as u128 + 1;
        let total = starts.iter().copied().map(count).sum::<u128>();
        if total == 0 {
            return None;
        }

        let mut index = rng.gen_range(0..total);
        for (first, last) in starts {
            let n = count((first, last));
            if index < n {
                return Some(first + index as u64 * align);
            }

            index -= n;
        }

        None
    }
}

impl From<Interval> for IntervalSet {
    fn from(interval: Interval) -> Self {
        IntervalSet {
            intervals: vec![interval],
        }
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        let mut set = IntervalSet::new();
        for interval in iter {
            set.add_interval(interval);
        }

        set
    }
}

impl From<Vec<Interval>> for IntervalSet {
    fn from(intervals: Vec<Interval>) -> Self {
        intervals.into_iter().collect()
    }
}

impl From<IntervalSet> for Vec<Interval> {
    fn from(set: IntervalSet) -> Self {
        set.intervals
    }
}

impl Display for IntervalSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.intervals.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}", self.intervals.iter().join(","))
        }
    }
}

impl Debug for IntervalSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{{self}}}")
    }
}
