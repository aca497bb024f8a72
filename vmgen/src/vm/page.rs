use std::fmt::{self, Display};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::arch::RangeKind;
use crate::interval::Interval;
use crate::utils::DisplaySize;

/// The kind of memory access that a page must accommodate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// Instruction fetch.
    Fetch,

    /// Data read.
    Load,

    /// Data write.
    Store,
}

/// The privilege level at which a page is accessed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// Unprivileged code.
    User,

    /// Operating-system code.
    #[default]
    Supervisor,
}

/// Describes the attributes a new page must have.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    /// The access that will be performed on the page.
    pub access: AccessKind,

    /// The privilege level of that access.
    pub privilege: Privilege,

    /// When true, the page is set up so that the access faults.
    pub force_fault: bool,
}

impl PageRequest {
    /// A request for a page on which `access` at `privilege` succeeds.
    pub fn new(access: AccessKind, privilege: Privilege) -> Self {
        PageRequest {
            access,
            privilege,
            force_fault: false,
        }
    }

    /// Returns the same request, but for a page on which the access faults.
    pub fn with_fault(self) -> Self {
        PageRequest {
            force_fault: true,
            ..self
        }
    }

    /// Returns true if the request is for an instruction page.
    pub fn is_instr(&self) -> bool {
        self.access == AccessKind::Fetch
    }
}

/// A single attribute bit of a page-table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PteAttribute {
    /// The entry is valid.
    Valid,

    /// The page can be read.
    Read,

    /// The page can be written.
    Write,

    /// The page can be executed.
    Execute,

    /// The page is accessible from user mode.
    User,

    /// The mapping exists in all address spaces.
    Global,

    /// The page has been accessed.
    Accessed,

    /// The page has been written.
    Dirty,
}

impl PteAttribute {
    /// The single-character name of the attribute.
    pub fn short_name(&self) -> char {
        match self {
            PteAttribute::Valid => 'V',
            PteAttribute::Read => 'R',
            PteAttribute::Write => 'W',
            PteAttribute::Execute => 'X',
            PteAttribute::User => 'U',
            PteAttribute::Global => 'G',
            PteAttribute::Accessed => 'A',
            PteAttribute::Dirty => 'D',
        }
    }
}

/// A committed virtual-to-physical mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// The first virtual address of the page.
    pub va: u64,

    /// The first physical address of the page.
    pub pa: u64,

    /// The size of the page in bytes.
    pub size: u64,

    /// The memory bank that contains the physical memory of the page.
    pub bank: usize,

    /// The page-table level of the leaf entry.
    pub level: usize,

    /// The canonical range that contains the page.
    pub range: RangeKind,

    /// The name of the granule of the page.
    pub granule: String,

    /// True if the page holds instructions.
    pub is_instr: bool,

    /// The attributes of the leaf entry, sorted.
    pub attributes: Vec<PteAttribute>,
}

impl Page {
    /// The virtual addresses covered by the page.
    pub fn virtual_range(&self) -> Interval {
        Interval::from_start_size(self.va, self.size)
    }

    /// The physical addresses covered by the page.
    pub fn physical_range(&self) -> Interval {
        Interval::from_start_size(self.pa, self.size)
    }

    /// Translates `va` to a physical address, if `va` lies in the page.
    pub fn translate(&self, va: u64) -> Option<u64> {
        self.virtual_range().contains(va).then(|| self.pa + (va - self.va))
    }

    /// Translates `pa` to a virtual address, if `pa` lies in the page.
    pub fn reverse_translate(&self, pa: u64) -> Option<u64> {
        self.physical_range().contains(pa).then(|| self.va + (pa - self.pa))
    }

    /// Returns true if the page grants the same kind of access as `request` would.
    pub fn satisfies(&self, request: &PageRequest) -> bool {
        if self.is_instr != request.is_instr() {
            return false;
        }

        let needed = match request.access {
            AccessKind::Fetch => PteAttribute::Execute,
            AccessKind::Load => PteAttribute::Read,
            AccessKind::Store => PteAttribute::Write,
        };

        self.attributes.contains(&needed) != request.force_fault
            && self.attributes.contains(&PteAttribute::User) == (request.privilege == Privilege::User)
    }
}

impl Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} page 0x{:x} -> 0x{:x} [{}] ({} range, bank {})",
            DisplaySize(self.size),
            self.va,
            self.pa,
            self.attributes.iter().map(PteAttribute::short_name).join(""),
            self.range,
            self.bank
        )
    }
}

/// A page table (root or intermediate) that has been allocated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageTable {
    /// The physical address of the table.
    pub base: u64,

    /// The size of the table in bytes.
    pub size: u64,

    /// The level of the table. The root table has the highest level.
    pub level: usize,

    /// The canonical range whose translations go through this table.
    pub range: RangeKind,
}

impl PageTable {
    /// The physical addresses occupied by the table.
    pub fn physical_range(&self) -> Interval {
        Interval::from_start_size(self.base, self.size)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{AccessKind, Page, PageRequest, Privilege, PteAttribute};
    use crate::arch::RangeKind;

    fn page() -> Page {
        Page {
            va: 0x4000_0000,
            pa: 0x8020_0000,
            size: 0x20_0000,
            bank: 0,
            level: 1,
            range: RangeKind::Low,
            granule: String::from("4K"),
            is_instr: false,
            attributes: vec![PteAttribute::Valid, PteAttribute::Read, PteAttribute::Write],
        }
    }

    #[test]
    pub fn translation() {
        let page = page();
        assert_eq!(page.translate(0x4000_1234), Some(0x8020_1234));
        assert_eq!(page.translate(0x4020_0000), None);
        assert_eq!(page.reverse_translate(0x803f_ffff), Some(0x401f_ffff));
        assert_eq!(page.reverse_translate(0x8000_0000), None);
    }

    #[test]
    pub fn satisfies() {
        let page = page();
        assert!(page.satisfies(&PageRequest::new(AccessKind::Load, Privilege::Supervisor)));
        assert!(page.satisfies(&PageRequest::new(AccessKind::Store, Privilege::Supervisor)));
        assert!(!page.satisfies(&PageRequest::new(AccessKind::Store, Privilege::Supervisor).with_fault()));
        assert!(!page.satisfies(&PageRequest::new(AccessKind::Load, Privilege::User)));
        assert!(!page.satisfies(&PageRequest::new(AccessKind::Fetch, Privilege::Supervisor)));
    }

    #[test]
    pub fn display() {
        assert_eq!(page().to_string(), "2M page 0x40000000 -> 0x80200000 [VRW] (low range, bank 0)");
    }
}
