use arrayvec::ArrayVec;
use fxhash::FxHashMap;
use log::*;
use rand::Rng;

use super::page::PageTable;
use crate::arch::{CanonicalRange, RangeKind, VmLayout};
use crate::error::FatalError;
use crate::interval::{Interval, IntervalSet};
use crate::memory::{AllocationError, AllocationOrder, PhysicalMemoryManager};
use crate::utils::DisplaySize;

/// The physical memory from which the page tables of a single address space are allocated.
///
/// Memory is taken from the [`PhysicalMemoryManager`] in blocks of several tables at once.
/// Tables are then carved out of those blocks in an order (top-down or bottom-up) that is fixed during setup.
#[derive(Clone, Debug)]
pub struct PageTableResourceConstraint {
    bank: usize,
    base_usable: IntervalSet,
    usable: IntervalSet,
    allocated: IntervalSet,
    table_size: u64,
    tables_per_block: u64,
    order: AllocationOrder,
    is_setup: bool,
}

impl PageTableResourceConstraint {
    /// Creates a constraint that allocates `tables_per_block` tables at a time from `bank`.
    /// [`PageTableResourceConstraint::setup`] must be called before tables can be allocated.
    pub fn new(bank: usize, tables_per_block: u64) -> Self {
        PageTableResourceConstraint {
            bank,
            base_usable: IntervalSet::new(),
            usable: IntervalSet::new(),
            allocated: IntervalSet::new(),
            table_size: 0,
            tables_per_block,
            order: AllocationOrder::BottomUp,
            is_setup: false,
        }
    }

    /// Fixes the region in which tables may be placed, the table size and the allocation order,
    /// and reserves the first block.
    pub fn setup(
        &mut self, base_usable: IntervalSet, layout: &VmLayout, memory: &mut PhysicalMemoryManager, rng: &mut impl Rng,
    ) -> Result<(), FatalError> {
        if self.is_setup {
            return Err(FatalError::AlreadySetUp("Page table resource constraint"));
        }

        if self.tables_per_block == 0 {
            return Err(FatalError::InvalidParameter(String::from("at least one table per block is needed")));
        }

        self.table_size = layout
            .ranges
            .iter()
            .map(|r| r.granule.table_size)
            .max()
            .ok_or_else(|| FatalError::InvalidParameter(String::from("the layout has no canonical ranges")))?;
        self.base_usable = base_usable;
        self.order = if rng.gen() {
            AllocationOrder::TopDown
        } else {
            AllocationOrder::BottomUp
        };
        self.is_setup = true;

        debug!(
            "Page tables of {} are allocated {} from {} in bank {}",
            DisplaySize(self.table_size),
            self.order,
            self.base_usable,
            self.bank
        );

        self.allocate_usable_block(None, memory, rng)
    }

    /// Carves a table of `size` bytes, aligned to `align`, out of the reserved blocks.
    /// New blocks are reserved as needed, outside `exclude`.
    pub fn allocate_page_table(
        &mut self, align: u64, size: u64, exclude: Option<&IntervalSet>, memory: &mut PhysicalMemoryManager,
        rng: &mut impl Rng,
    ) -> Result<u64, FatalError> {
        assert!(self.is_setup, "Page table resource constraint is used before it is set up");

        loop {
            let mut candidates = self.usable.clone();
            if let Some(exclude) = exclude {
                candidates.subtract_set(exclude);
            }

            if let Some(start) = self.order.pick(&candidates, align, size, rng) {
                let interval = Interval::from_start_size(start, size);
                self.usable.sub_interval(interval);
                self.allocated.add_interval(interval);
                trace!("Allocated page table at 0x{start:x}");

                return Ok(start);
            }

            self.allocate_usable_block(exclude, memory, rng)?;
        }
    }

    /// Reserves a new block of tables in the physical memory manager and adds it to the usable set.
    /// The size of the block is halved whenever no free block of that size exists.
    pub fn allocate_usable_block(
        &mut self, exclude: Option<&IntervalSet>, memory: &mut PhysicalMemoryManager, rng: &mut impl Rng,
    ) -> Result<(), FatalError> {
        let mut block_size = self.table_size * self.tables_per_block;
        while block_size >= self.table_size {
            match memory.allocate_page_table_block(
                self.bank,
                self.table_size,
                block_size,
                &self.base_usable,
                exclude,
                self.order,
                rng,
            ) {
                Ok(start) => {
                    debug!("Reserved page table block 0x{start:x}+{}", DisplaySize(block_size));
                    self.usable.add_interval(Interval::from_start_size(start, block_size));
                    return Ok(());
                },
                Err(AllocationError::NoSpace {
                    ..
                }) => {
                    debug!("No room for a page table block of {}", DisplaySize(block_size));
                    block_size /= 2;
                },
            }
        }

        Err(FatalError::OutOfPageTableSpace {
            bank: self.bank,
            table_size: self.table_size,
        })
    }

    /// The memory that has been reserved, but not yet used for a table.
    pub fn usable(&self) -> &IntervalSet {
        &self.usable
    }

    /// The memory used by tables.
    pub fn allocated(&self) -> &IntervalSet {
        &self.allocated
    }

    /// The size of a single table.
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    /// The bank from which tables are allocated.
    pub fn bank(&self) -> usize {
        self.bank
    }

    /// The allocation order picked during setup.
    pub fn order(&self) -> AllocationOrder {
        self.order
    }

    /// Returns true once [`PageTableResourceConstraint::setup`] has succeeded.
    pub fn is_setup(&self) -> bool {
        self.is_setup
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct TableKey {
    tree: usize,
    level: usize,
    index: u64,
}

/// Keeps track of the page tables of an address space.
///
/// Every canonical range has a root table, unless the layout shares a single root between all ranges.
/// Intermediate tables are allocated when the first page below them is committed.
/// The entries of the tables are not tracked.
#[derive(Clone, Debug)]
pub struct PageTableManager {
    resource: PageTableResourceConstraint,
    shared_root: bool,
    roots: ArrayVec<PageTable, 2>,
    tables: FxHashMap<TableKey, PageTable>,
}

impl PageTableManager {
    /// Sets up `resource` and allocates the root tables of `layout`.
    pub fn new(
        mut resource: PageTableResourceConstraint, base_usable: IntervalSet, layout: &VmLayout,
        memory: &mut PhysicalMemoryManager, rng: &mut impl Rng,
    ) -> Result<Self, FatalError> {
        resource.setup(base_usable, layout, memory, rng)?;

        let mut manager = PageTableManager {
            resource,
            shared_root: layout.shared_root,
            roots: ArrayVec::new(),
            tables: FxHashMap::default(),
        };

        let num_roots = if layout.shared_root { 1 } else { layout.ranges.len() };
        for range in layout.ranges.iter().take(num_roots) {
            let size = range.granule.table_size;
            let base = manager.resource.allocate_page_table(size, size, None, memory, rng)?;
            let root = PageTable {
                base,
                size,
                level: range.granule.root_level(),
                range: range.kind,
            };

            info!("Root page table for the {} range at 0x{base:x}", range.kind);
            manager.roots.push(root);
        }

        Ok(manager)
    }

    fn tree(&self, kind: RangeKind) -> usize {
        if self.shared_root {
            0
        } else {
            self.roots.iter().position(|r| r.range == kind).unwrap_or(self.roots.len())
        }
    }

    /// The root table through which addresses in `kind` are translated.
    pub fn root(&self, kind: RangeKind) -> Option<&PageTable> {
        self.roots.get(self.tree(kind))
    }

    /// Allocates every table between the root and a leaf entry at `leaf_level` for `va`, if it does not exist yet.
    /// The new tables are placed outside `exclude`.
    /// Returns the tables that were allocated.
    pub fn ensure_tables(
        &mut self, range: &CanonicalRange, va: u64, leaf_level: usize, exclude: &IntervalSet,
        memory: &mut PhysicalMemoryManager, rng: &mut impl Rng,
    ) -> Result<Vec<PageTable>, FatalError> {
        let granule = range.granule;
        let tree = self.tree(range.kind);
        let mut new_tables = Vec::new();

        for level in (leaf_level..granule.root_level()).rev() {
            let key = TableKey {
                tree,
                level,
                index: va / granule.entry_spans[level + 1],
            };

            if !self.tables.contains_key(&key) {
                let size = granule.table_size;
                let base = self.resource.allocate_page_table(size, size, Some(exclude), memory, rng)?;
                let table = PageTable {
                    base,
                    size,
                    level,
                    range: range.kind,
                };

                trace!("New level {level} table at 0x{base:x} for 0x{va:x}");
                self.tables.insert(key, table);
                new_tables.push(table);
            }
        }

        Ok(new_tables)
    }

    /// All tables, roots first.
    pub fn tables(&self) -> Vec<PageTable> {
        let mut tables = self.tables.values().copied().collect::<Vec<_>>();
        tables.sort_by_key(|t| (t.range, std::cmp::Reverse(t.level), t.base));

        self.roots.iter().copied().chain(tables).collect()
    }

    /// The physical memory from which tables are allocated.
    pub fn resource(&self) -> &PageTableResourceConstraint {
        &self.resource
    }

    /// Mutable access to the physical memory from which tables are allocated.
    pub fn resource_mut(&mut self) -> &mut PageTableResourceConstraint {
        &mut self.resource
    }
}
