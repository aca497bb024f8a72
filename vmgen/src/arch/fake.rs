//! A fake architecture with a split address space that uses a different granule for each half.
//! It is used in tests to exercise cross-range resolution and page size substitution.

use arrayvec::ArrayVec;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Arch, CanonicalRange, Granule, RangeKind, VmLayout};
use crate::interval::IntervalSet;
use crate::vm::{AccessKind, PageRequest, PteAttribute};

/// A simple, fake architecture for testing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FakeArch;

/// The translation modes of [`FakeArch`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FakeMode {
    /// 48-bit virtual addresses; 4K granule for the low range, 16K granule for the high range.
    #[default]
    Split,

    /// Only the low range exists.
    LowOnly,
}

/// The granule used for the low range.
pub const GRANULE_4K: Granule = Granule {
    name: "4K",
    table_size: 0x1000,
    entry_spans: &[0x1000, 0x20_0000, 0x4000_0000, 0x80_0000_0000],
    leaf_levels: &[0, 1, 2],
};

/// The granule used for the high range.
pub const GRANULE_16K: Granule = Granule {
    name: "16K",
    table_size: 0x4000,
    entry_spans: &[0x4000, 0x200_0000, 0x10_0000_0000, 0x8000_0000_0000],
    leaf_levels: &[0, 1],
};

/// The first page of the low range is never mapped.
pub const NULL_GUARD: u64 = 0xffff;

impl Arch for FakeArch {
    type Mode = FakeMode;

    const NAME: &'static str = "fake";

    fn layout(mode: FakeMode) -> VmLayout {
        let (low, high) = VmLayout::split_ranges(48);
        let mut ranges = ArrayVec::new();
        ranges.push(CanonicalRange {
            kind: RangeKind::Low,
            range: low,
            granule: GRANULE_4K,
        });

        if mode == FakeMode::Split {
            ranges.push(CanonicalRange {
                kind: RangeKind::High,
                range: high,
                granule: GRANULE_16K,
            });
        }

        VmLayout {
            va_bits: 48,
            max_physical_address: (1 << 48) - 1,
            ranges,
            shared_root: false,
        }
    }

    fn excluded_virtual(_layout: &VmLayout, kind: RangeKind) -> IntervalSet {
        match kind {
            RangeKind::Low => IntervalSet::from_range(0, NULL_GUARD),
            RangeKind::High => IntervalSet::new(),
        }
    }

    fn pte_attributes(request: &PageRequest, _rng: &mut impl Rng) -> Vec<PteAttribute> {
        let mut attributes = vec![PteAttribute::Valid];
        if !request.force_fault {
            attributes.push(match request.access {
                AccessKind::Fetch => PteAttribute::Execute,
                AccessKind::Load => PteAttribute::Read,
                AccessKind::Store => PteAttribute::Write,
            });
        }

        attributes
    }
}
