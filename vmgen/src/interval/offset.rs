use log::*;

use super::IntervalSet;
use crate::error::FatalError;
use crate::utils::{bitmask_u64, sign_extend_u64};

/// Derives constraints on the offset field of a base+offset addressing mode.
///
/// The effective address of such an access is `base + (sext(offset) << offset_shift)`, where `offset` is an
/// `offset_size`-bit two's complement field.
/// Given a set of acceptable target addresses, [`BaseOffsetConstraint::offset_constraint`] computes the set of field
/// encodings that make the access land wholly inside the target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BaseOffsetConstraint {
    offset_size: u32,
    offset_shift: u32,
    max_address: u64,
}

impl BaseOffsetConstraint {
    /// Creates a new constraint builder for `offset_size`-bit offsets scaled by `2^offset_shift`.
    /// Addresses above `max_address` are never produced.
    pub fn new(offset_size: u32, offset_shift: u32, max_address: u64) -> Result<Self, FatalError> {
        if offset_size == 0 || offset_size > 64 || offset_size + offset_shift > 64 {
            return Err(FatalError::InvalidParameter(format!(
                "a {offset_size}-bit offset shifted by {offset_shift} does not fit in 64 bits"
            )));
        }

        Ok(BaseOffsetConstraint {
            offset_size,
            offset_shift,
            max_address,
        })
    }

    /// The width of the offset field in bits.
    pub fn offset_size(&self) -> u32 {
        self.offset_size
    }

    /// The amount by which the offset is shifted left before it is added to the base.
    pub fn offset_shift(&self) -> u32 {
        self.offset_shift
    }

    /// The most negative offset that can be encoded.
    pub fn min_offset(&self) -> i64 {
        sign_extend_u64(1 << (self.offset_size - 1), self.offset_size)
    }

    /// The most positive offset that can be encoded.
    pub fn max_offset(&self) -> i64 {
        bitmask_u64(self.offset_size - 1) as i64
    }

    /// Returns the offset field encodings `o` for which an access of `access_size` bytes at
    /// `base + (sext(o) << offset_shift)` lies entirely inside `target`.
    pub fn offset_constraint(&self, base: u64, access_size: u64, target: &IntervalSet) -> IntervalSet {
        assert!(access_size > 0, "Access size must be nonzero");

        let mut reachable = target.clone();
        reachable.apply_intersection(&IntervalSet::from_range(0, self.max_address));

        let mut displacements = IntervalSet::new();
        for interval in reachable.intervals() {
            if interval.size() >= access_size {
                displacements.add_range(interval.lo(), interval.hi() - (access_size - 1));
            }
        }

        displacements.shift_left(base);

        let shift = self.offset_shift;
        let unit = 1u64 << shift;
        let max_displacement = (self.max_offset() as u64) << shift;
        let min_displacement = (self.min_offset() << shift) as u64;

        let mut result = IntervalSet::new();
        let mut positive = displacements.clone();
        positive.apply_intersection(&IntervalSet::from_range(0, max_displacement));
        for interval in positive.intervals() {
            let lo = (interval.lo() + unit - 1) >> shift;
            let hi = interval.hi() >> shift;
            if lo <= hi {
                self.add_offset_range_constraint(lo as i64, hi as i64, &mut result);
            }
        }

        let mut negative = displacements;
        negative.apply_intersection(&IntervalSet::from_range(min_displacement, u64::MAX));
        for interval in negative.intervals() {
            let lo = (interval.lo() as i64 + (unit - 1) as i64) >> shift;
            let hi = (interval.hi() as i64) >> shift;
            if lo <= hi {
                self.add_offset_range_constraint(lo, hi, &mut result);
            }
        }

        trace!("Offsets for base 0x{base:x} into {target}: {result}");
        result
    }

    /// Adds the field encodings of the signed offsets `[lo, hi]` to `result`.
    ///
    /// # Panics
    /// Panics if `lo > hi` or if either bound cannot be encoded in the offset field.
    pub fn add_offset_range_constraint(&self, lo: i64, hi: i64, result: &mut IntervalSet) {
        assert!(lo <= hi, "Invalid offset range: {lo} > {hi}");
        assert!(
            lo >= self.min_offset() && hi <= self.max_offset(),
            "Offset range {lo}..={hi} does not fit in {} bits",
            self.offset_size
        );

        let mask = bitmask_u64(self.offset_size);
        if lo >= 0 || hi < 0 {
            result.add_range(lo as u64 & mask, hi as u64 & mask);
        } else {
            // A range that spans zero is recorded as the encodings strictly between `hi` and `lo`: the complement of
            // its two-sided encoding. `offset_constraint` never passes such a range.
            // TODO: confirm the intended encoding of mixed-sign ranges with the instruction constraint owners.
            let upper = lo as u64 & mask;
            let lower = hi as u64 + 1;
            if lower < upper {
                result.add_range(lower, upper - 1);
            }
        }
    }
}
