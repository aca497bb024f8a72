//! Contains various utility functions needed by other parts of vmgen.

use std::fmt::{self, Display, Formatter};

/// Returns a bitmask where the lowest `n` bits are set.
#[inline]
pub const fn bitmask_u64(n: u32) -> u64 {
    match u64::MAX.checked_shr(64 - n) {
        Some(val) => val,
        None => 0,
    }
}

/// Extends an `n`-bit number in `v` to an `i64`.
#[inline]
pub const fn sign_extend_u64(v: u64, n: u32) -> i64 {
    let k = 64 - n;
    ((v << k) as i64) >> k
}

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
/// Returns `None` if the result does not fit in a `u64`.
#[inline]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

const SIZE_SUFFIXES: [(char, u32); 6] = [('E', 60), ('P', 50), ('T', 40), ('G', 30), ('M', 20), ('K', 10)];

/// Parses a size such as `4K`, `2M`, `0x1000` or `4096`.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(&hex.replace('_', ""), 16).ok();
    }

    let upper = s.to_ascii_uppercase();
    let upper = upper.strip_suffix('B').unwrap_or(&upper);
    for (suffix, shift) in SIZE_SUFFIXES {
        if let Some(num) = upper.strip_suffix(suffix) {
            return num.parse::<u64>().ok()?.checked_mul(1 << shift);
        }
    }

    upper.parse().ok()
}

/// Displays a size in the largest binary unit that divides it, like `2M` or `4K`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DisplaySize(pub u64);

impl Display for DisplaySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let size = self.0;
        for (suffix, shift) in SIZE_SUFFIXES {
            if size != 0 && size.trailing_zeros() >= shift {
                return write!(f, "{}{suffix}", size >> shift);
            }
        }

        write!(f, "{size}")
    }
}
