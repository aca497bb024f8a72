use std::marker::PhantomData;

use log::*;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::free_range::{ClaimResult, FreeRangeClaimer, FreeSpace, PageSizeRequest};
use super::mapper::{MapError, MapRequest, PhysicalToVirtualMapper};
use super::page::{Page, PageRequest, PageTable};
use super::page_size::PageSize;
use super::page_table::{PageTableManager, PageTableResourceConstraint};
use crate::arch::{Arch, RangeKind, VmLayout};
use crate::choice::ChoicesModerator;
use crate::config::PageTableConfig;
use crate::dispatch::ThreadId;
use crate::error::FatalError;
use crate::interval::{Interval, IntervalSet};
use crate::memory::PhysicalMemoryManager;
use crate::utils::DisplaySize;

/// Identifies the translation regime of an address space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(bound(serialize = "M: Serialize", deserialize = "M: DeserializeOwned"))]
pub struct VmContext<M> {
    /// The translation mode.
    pub mode: M,

    /// The address-space identifier.
    pub asid: u16,
}

impl<M: PartialEq> VmContext<M> {
    /// Returns true if address spaces in both contexts may share root tables.
    pub fn is_compatible(&self, other: &VmContext<M>) -> bool {
        self.mode == other.mode && self.asid == other.asid
    }
}

/// Error returned when a page cannot be committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The virtual or physical address is not aligned to the page size.
    #[error("Page of 0x{size:x} bytes at 0x{va:x} -> 0x{pa:x} is misaligned")]
    Misaligned {
        /// The virtual address.
        va: u64,

        /// The physical address.
        pa: u64,

        /// The page size.
        size: u64,
    },

    /// The virtual range is outside the canonical range, already mapped or excluded.
    #[error("Virtual range {} is not free", .0)]
    VirtualUnavailable(Interval),

    /// The physical range is already mapped, holds page tables or is not addressable.
    #[error("Physical range {} is not available", .0)]
    PhysicalUnavailable(Interval),

    /// The page tables for the page could not be allocated.
    #[error("{}", .0)]
    Fatal(#[from] FatalError),
}

/// A virtual address space: its mappings, its free memory and its page tables.
///
/// Address spaces are owned by a single generator thread and are not synchronized.
#[derive(Clone, Debug)]
pub struct VmAddressSpace<A: Arch> {
    context: VmContext<A::Mode>,
    layout: VmLayout,
    thread: ThreadId,
    physical_mappings: IntervalSet,
    virtual_mappings: IntervalSet,
    pages: Vec<Page>,
    page_tables: PageTableManager,
    _phantom: PhantomData<A>,
}

impl<A: Arch> VmAddressSpace<A> {
    /// Creates an address space for `context`, owned by `thread`.
    /// The root page tables are allocated immediately.
    pub fn new(
        context: VmContext<A::Mode>, thread: ThreadId, config: &PageTableConfig, memory: &mut PhysicalMemoryManager,
        rng: &mut impl Rng,
    ) -> Result<Self, FatalError> {
        let layout = A::layout(context.mode);
        let resource = PageTableResourceConstraint::new(config.bank, config.tables_per_block);
        let page_tables = PageTableManager::new(resource, config.region.clone(), &layout, memory, rng)?;

        info!(
            "Created {} address space {:?} (asid {}) for thread {}",
            A::NAME,
            context.mode,
            context.asid,
            thread
        );

        Ok(VmAddressSpace {
            context,
            layout,
            thread,
            physical_mappings: IntervalSet::new(),
            virtual_mappings: IntervalSet::new(),
            pages: Vec::new(),
            page_tables,
            _phantom: PhantomData,
        })
    }

    /// The translation regime.
    pub fn context(&self) -> &VmContext<A::Mode> {
        &self.context
    }

    /// The layout of the virtual address space.
    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// The thread that owns this address space.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Returns true if this address space may share root tables with `other`.
    pub fn can_alias_root(&self, other: &VmAddressSpace<A>) -> bool {
        self.context.is_compatible(&other.context)
    }

    /// All mapped physical addresses.
    pub fn physical_mappings(&self) -> &IntervalSet {
        &self.physical_mappings
    }

    /// All mapped virtual addresses.
    pub fn virtual_mappings(&self) -> &IntervalSet {
        &self.virtual_mappings
    }

    /// The virtual addresses in the canonical range `kind` that can still be mapped.
    pub fn free_virtual(&self, kind: RangeKind) -> IntervalSet {
        match self.layout.range(kind) {
            Some(range) => {
                let mut free = IntervalSet::from(range.range);
                free.subtract_set(&self.virtual_mappings);
                free.subtract_set(&A::excluded_virtual(&self.layout, kind));
                free
            },
            None => IntervalSet::new(),
        }
    }

    /// The free virtual memory of every canonical range.
    pub fn free_spaces(&self) -> impl Iterator<Item = FreeSpace> + '_ {
        self.layout.ranges.iter().map(|range| FreeSpace {
            kind: range.kind,
            granule: range.granule,
            usable: self.free_virtual(range.kind),
        })
    }

    /// Finds free virtual ranges inside `region` for the pages in `requested`.
    /// Nothing is reserved: the caller commits the pages it ends up using.
    pub fn claim_free_ranges(
        &self, region: &IntervalSet, requested: &[PageSizeRequest], choices: &ChoicesModerator, rng: &mut impl Rng,
    ) -> Result<Option<ClaimResult>, FatalError> {
        let claimer = FreeRangeClaimer::new(self.free_spaces(), choices)?;
        Ok(claimer.claim(region, requested, rng))
    }

    /// Maps the physical memory described by `request`, or returns an existing page that maps it.
    pub fn map_physical_to_virtual(
        &mut self, mapper: &PhysicalToVirtualMapper, request: &MapRequest, memory: &mut PhysicalMemoryManager,
        rng: &mut impl Rng,
    ) -> Result<Page, MapError> {
        mapper.map(self, request, memory, rng)
    }

    /// Allocates `size` bytes of page-table memory outside `exclude`.
    pub fn allocate_page_table_block(
        &mut self, align: u64, size: u64, exclude: Option<&IntervalSet>, memory: &mut PhysicalMemoryManager,
        rng: &mut impl Rng,
    ) -> Result<u64, FatalError> {
        self.page_tables
            .resource_mut()
            .allocate_page_table(align, size, exclude, memory, rng)
    }

    /// Maps `[va, va + size)` to `[pa, pa + size)` in the canonical range `kind`.
    ///
    /// The virtual range must be free, and the physical range must neither be mapped already nor hold page tables.
    /// Missing intermediate page tables are allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_page(
        &mut self, kind: RangeKind, va: u64, pa: u64, size: PageSize, bank: usize, request: &PageRequest,
        memory: &mut PhysicalMemoryManager, rng: &mut impl Rng,
    ) -> Result<Page, CommitError> {
        if va % size.size != 0 || pa % size.size != 0 {
            return Err(CommitError::Misaligned {
                va,
                pa,
                size: size.size,
            });
        }

        let range = *self
            .layout
            .range(kind)
            .ok_or(CommitError::VirtualUnavailable(Interval::from_start_size(va, size.size)))?;
        let virtual_range = Interval::from_start_size(va, size.size);
        if !self.free_virtual(kind).contains_interval(&virtual_range) {
            return Err(CommitError::VirtualUnavailable(virtual_range));
        }

        let physical_range = Interval::from_start_size(pa, size.size);
        let holds_page_tables =
            (0..memory.num_banks()).any(|bank| memory.bank(bank).page_table_blocks().intersects_interval(&physical_range));
        if physical_range.hi() > self.layout.max_physical_address
            || self.physical_mappings.intersects_interval(&physical_range)
            || holds_page_tables
        {
            return Err(CommitError::PhysicalUnavailable(physical_range));
        }

        let mut exclude = self.physical_mappings.clone();
        exclude.add_interval(physical_range);
        self.page_tables
            .ensure_tables(&range, va, size.level, &exclude, memory, rng)?;

        let page = Page {
            va,
            pa,
            size: size.size,
            bank,
            level: size.level,
            range: kind,
            granule: size.granule.to_owned(),
            is_instr: request.is_instr(),
            attributes: A::pte_attributes(request, rng),
        };

        debug!("Committed {page}");
        self.virtual_mappings.add_interval(virtual_range);
        self.physical_mappings.add_interval(physical_range);
        memory.mark_mapped(physical_range);
        self.pages.push(page.clone());

        Ok(page)
    }

    /// Returns the page that maps the physical address `pa`.
    pub fn lookup_physical(&self, pa: u64) -> Option<&Page> {
        self.pages.iter().find(|page| page.physical_range().contains(pa))
    }

    /// Translates the virtual address `va`.
    pub fn translate(&self, va: u64) -> Option<u64> {
        self.pages.iter().find_map(|page| page.translate(va))
    }

    /// All committed pages, in the order in which they were committed.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// All page tables, roots first.
    pub fn page_tables(&self) -> Vec<PageTable> {
        self.page_tables.tables()
    }

    /// The page-table bookkeeping of this address space.
    pub fn page_table_manager(&self) -> &PageTableManager {
        &self.page_tables
    }

    /// Logs a summary of the address space.
    pub fn log_summary(&self) {
        info!(
            "{} pages ({} mapped), {} page tables ({} reserved)",
            self.pages.len(),
            DisplaySize(self.virtual_mappings.size()),
            self.page_tables.tables().len(),
            DisplaySize(self.page_tables.resource().allocated().size() + self.page_tables.resource().usable().size())
        );
    }
}
