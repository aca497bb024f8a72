//! Architecture abstractions: translation modes, canonical virtual ranges, page-table granules and PTE attributes.
//!
//! The mapping engine itself is architecture-independent.
//! Everything it needs to know about a specific ISA is described by an [`Arch`] implementation, which turns a
//! translation mode into a [`VmLayout`].

use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use arrayvec::ArrayVec;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::interval::{Interval, IntervalSet};
use crate::vm::{PageRequest, PteAttribute};

pub mod fake;
pub mod riscv;

/// An instruction set architecture, as far as virtual memory is concerned.
pub trait Arch: Copy + Clone + Debug + Default + Send + Sync + 'static {
    /// The translation modes (regimes) supported by the architecture.
    type Mode: Copy + Clone + Debug + Default + PartialEq + Eq + Hash + Serialize + DeserializeOwned + Send + Sync;

    /// The name of the architecture.
    const NAME: &'static str;

    /// Describes the virtual address space of the translation mode `mode`.
    fn layout(mode: Self::Mode) -> VmLayout;

    /// Virtual addresses in the canonical range `kind` that may never be mapped, in addition to existing mappings.
    fn excluded_virtual(_layout: &VmLayout, _kind: RangeKind) -> IntervalSet {
        IntervalSet::new()
    }

    /// Generates the attributes of a new page that satisfies `request`.
    fn pte_attributes(request: &PageRequest, rng: &mut impl Rng) -> Vec<PteAttribute>;
}

/// Identifies one of the (at most two) canonical ranges of a split virtual address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RangeKind {
    /// The addresses nearest to zero.
    Low,

    /// The addresses nearest to `u64::MAX`.
    High,
}

impl Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeKind::Low => write!(f, "low"),
            RangeKind::High => write!(f, "high"),
        }
    }
}

/// A family of page sizes that share a page-table format.
///
/// Level 0 is the level of the smallest pages. `entry_spans[level]` is the number of bytes mapped by a single
/// entry of a table at `level`, and the root table is at the highest level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Granule {
    /// The name of the granule, like `4K`.
    pub name: &'static str,

    /// The size of a single page table in bytes.
    pub table_size: u64,

    /// The number of bytes mapped by one entry, per level.
    pub entry_spans: &'static [u64],

    /// The levels at which leaf entries (pages) may be created.
    pub leaf_levels: &'static [usize],
}

impl Granule {
    /// The level of the root table.
    pub fn root_level(&self) -> usize {
        self.entry_spans.len() - 1
    }

    /// The page sizes that can be mapped with this granule, smallest first.
    pub fn page_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.leaf_levels.iter().map(|&level| self.entry_spans[level])
    }

    /// Returns true if `size` is one of the page sizes of this granule.
    pub fn supports(&self, size: u64) -> bool {
        self.level_of(size).is_some()
    }

    /// The level at which pages of `size` bytes are mapped.
    pub fn level_of(&self, size: u64) -> Option<usize> {
        self.leaf_levels.iter().copied().find(|&level| self.entry_spans[level] == size)
    }

    /// The smallest page size of this granule.
    pub fn smallest_page_size(&self) -> u64 {
        self.entry_spans[self.leaf_levels[0]]
    }
}

/// One canonical virtual range of a translation mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CanonicalRange {
    /// Whether this is the low or the high range.
    pub kind: RangeKind,

    /// The addresses in the range.
    pub range: Interval,

    /// The granule of the page tables that translate this range.
    pub granule: Granule,
}

/// The virtual address space of a translation mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VmLayout {
    /// The number of significant virtual address bits.
    pub va_bits: u32,

    /// The highest physical address that can be mapped.
    pub max_physical_address: u64,

    /// The canonical ranges, low range first.
    pub ranges: ArrayVec<CanonicalRange, 2>,

    /// When true, all canonical ranges are translated by a single page-table tree.
    pub shared_root: bool,
}

impl VmLayout {
    /// Returns the canonical range `kind`, if the layout has one.
    pub fn range(&self, kind: RangeKind) -> Option<&CanonicalRange> {
        self.ranges.iter().find(|r| r.kind == kind)
    }

    /// Returns all canonical addresses.
    pub fn canonical(&self) -> IntervalSet {
        self.ranges.iter().map(|r| r.range).collect()
    }

    /// Returns the low and high canonical ranges of a sign-extended `va_bits`-bit address space.
    pub fn split_ranges(va_bits: u32) -> (Interval, Interval) {
        let half = 1u64 << (va_bits - 1);
        (Interval::new(0, half - 1), Interval::new(half.wrapping_neg(), u64::MAX))
    }
}
