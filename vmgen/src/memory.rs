//! The global pool of physical memory, divided into banks.

use std::fmt::{self, Display};

use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BankConfig;
use crate::interval::{Interval, IntervalSet};

/// Error returned when a physical allocation cannot be satisfied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// There is no free, suitably aligned block of the requested size.
    #[error("No free block of 0x{size:x} bytes aligned to 0x{align:x} in bank {bank}")]
    NoSpace {
        /// The bank in which the allocation was attempted.
        bank: usize,

        /// The requested alignment.
        align: u64,

        /// The requested size.
        size: u64,
    },
}

/// The order in which free memory is handed out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationOrder {
    /// Lowest addresses first.
    BottomUp,

    /// Highest addresses first.
    TopDown,

    /// Anywhere.
    Random,
}

impl AllocationOrder {
    /// Picks `[start, start + size - 1]` from `candidates` according to the order.
    pub fn pick(self, candidates: &IntervalSet, align: u64, size: u64, rng: &mut impl Rng) -> Option<u64> {
        match self {
            AllocationOrder::BottomUp => candidates.lowest_aligned_start(align, size),
            AllocationOrder::TopDown => candidates.highest_aligned_start(align, size),
            AllocationOrder::Random => candidates.choose_aligned_start(align, size, rng),
        }
    }
}

impl Display for AllocationOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationOrder::BottomUp => write!(f, "bottom-up"),
            AllocationOrder::TopDown => write!(f, "top-down"),
            AllocationOrder::Random => write!(f, "random"),
        }
    }
}

/// A contiguous region of physical memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBank {
    index: usize,
    name: String,
    range: Interval,
    free: IntervalSet,
    allocated: IntervalSet,
    page_table_blocks: IntervalSet,
    mapped: IntervalSet,
}

impl MemoryBank {
    /// The index of the bank.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The name of the bank.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All physical addresses that belong to the bank.
    pub fn range(&self) -> Interval {
        self.range
    }

    /// The addresses that have not been allocated.
    pub fn free(&self) -> &IntervalSet {
        &self.free
    }

    /// The addresses that have been allocated or reserved.
    pub fn allocated(&self) -> &IntervalSet {
        &self.allocated
    }

    /// The blocks that have been handed out for page-table storage.
    /// Data and instruction pages may never be mapped onto these addresses.
    pub fn page_table_blocks(&self) -> &IntervalSet {
        &self.page_table_blocks
    }

    /// The addresses mapped by data or instruction pages of any address space.
    /// Page-table blocks are never placed here.
    pub fn mapped(&self) -> &IntervalSet {
        &self.mapped
    }

    fn take(&mut self, interval: Interval) {
        self.free.sub_interval(interval);
        self.allocated.add_interval(interval);
    }
}

/// Tracks which physical memory is still available, across all banks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalMemoryManager {
    banks: Vec<MemoryBank>,
}

impl PhysicalMemoryManager {
    /// Creates the banks described by `configs`. Reserved regions start out allocated.
    pub fn new(configs: &[BankConfig]) -> Self {
        let banks = configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                let mut bank = MemoryBank {
                    index,
                    name: config.name.clone(),
                    range: config.range,
                    free: IntervalSet::from(config.range),
                    allocated: IntervalSet::new(),
                    page_table_blocks: IntervalSet::new(),
                    mapped: IntervalSet::new(),
                };

                let mut reserved = config.reserved.clone();
                reserved.apply_intersection(&IntervalSet::from(config.range));
                for interval in reserved.intervals() {
                    bank.take(interval);
                }

                bank
            })
            .collect();

        PhysicalMemoryManager {
            banks,
        }
    }

    /// The number of banks.
    pub fn num_banks(&self) -> usize {
        self.banks.len()
    }

    /// Returns bank `index`.
    ///
    /// # Panics
    /// Panics if there is no such bank.
    pub fn bank(&self, index: usize) -> &MemoryBank {
        assert!(index < self.banks.len(), "Bank index {index} out of bounds ({} banks)", self.banks.len());
        &self.banks[index]
    }

    fn bank_mut(&mut self, index: usize) -> &mut MemoryBank {
        assert!(index < self.banks.len(), "Bank index {index} out of bounds ({} banks)", self.banks.len());
        &mut self.banks[index]
    }

    /// Records that `range` is mapped by a data or instruction page.
    pub fn mark_mapped(&mut self, range: Interval) {
        for bank in self.banks.iter_mut() {
            let mut overlap = IntervalSet::from(range);
            overlap.apply_intersection(&IntervalSet::from(bank.range));
            bank.mapped.add_set(&overlap);
        }
    }

    /// Allocates an aligned block of `size` bytes from the free memory of `bank` that lies inside `constraint`.
    pub fn allocate(
        &mut self, bank: usize, align: u64, size: u64, constraint: &IntervalSet, order: AllocationOrder, rng: &mut impl Rng,
    ) -> Result<u64, AllocationError> {
        let b = self.bank_mut(bank);
        let mut candidates = b.free.clone();
        candidates.apply_intersection(constraint);

        let start = order.pick(&candidates, align, size, rng).ok_or(AllocationError::NoSpace {
            bank,
            align,
            size,
        })?;

        b.take(Interval::from_start_size(start, size));
        trace!("Allocated 0x{start:x}+0x{size:x} in bank {bank}");
        Ok(start)
    }

    /// Allocates a block of `size` bytes for page-table storage.
    /// The block lies inside `usable` and outside `exclude`.
    /// It overlaps neither a previous allocation nor memory mapped by any address space.
    pub fn allocate_page_table_block(
        &mut self, bank: usize, align: u64, size: u64, usable: &IntervalSet, exclude: Option<&IntervalSet>,
        order: AllocationOrder, rng: &mut impl Rng,
    ) -> Result<u64, AllocationError> {
        let mut constraint = usable.clone();
        if let Some(exclude) = exclude {
            constraint.subtract_set(exclude);
        }

        constraint.subtract_set(&self.bank(bank).mapped);

        let start = self.allocate(bank, align, size, &constraint, order, rng)?;
        self.bank_mut(bank)
            .page_table_blocks
            .add_interval(Interval::from_start_size(start, size));
        debug!("Page table block 0x{start:x}+0x{size:x} allocated in bank {bank}");

        Ok(start)
    }
}
