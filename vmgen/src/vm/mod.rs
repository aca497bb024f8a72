//! Virtual memory: address spaces, page tables, free-range resolution and physical-to-virtual mapping.
//!
//! An address space is described by a [`VmAddressSpace`].
//! New pages are added either by claiming free virtual ranges with [`VmAddressSpace::claim_free_ranges`] and
//! committing them, or by asking the [`PhysicalToVirtualMapper`] to map a physical address.

mod address_space;
mod free_range;
mod mapper;
mod page;
mod page_size;
mod page_table;

pub use address_space::{CommitError, VmAddressSpace, VmContext};
pub use free_range::{
    ClaimResult, CrossRangeResolver, FreeRangeClaimer, FreeRangeResolver, FreeSpace, InvalidPageSize, PageSizeRequest,
    ResolvedRange, Strategy,
};
pub use mapper::{MapError, MapRequest, PhysicalToVirtualMapper};
pub use page::{AccessKind, Page, PageRequest, PageTable, Privilege, PteAttribute};
pub use page_size::{PageSize, PageSizeChoice};
pub use page_table::{PageTableManager, PageTableResourceConstraint};
