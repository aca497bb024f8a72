use log::*;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::address_space::{CommitError, VmAddressSpace};
use super::page::{Page, PageRequest};
use super::page_size::PageSizeChoice;
use crate::arch::{Arch, CanonicalRange};
use crate::choice::ChoicesModerator;
use crate::config::MappingStrategy;
use crate::error::FatalError;
use crate::interval::{Interval, IntervalSet};
use crate::memory::PhysicalMemoryManager;
use crate::utils::{align_down, DisplaySize};

/// Physical memory that needs to be reachable through a virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRequest {
    /// The first physical address.
    pub pa: u64,

    /// The bank that contains the physical memory.
    pub bank: usize,

    /// The number of bytes that must be mapped.
    pub size: u64,

    /// The attributes of the page.
    pub page: PageRequest,
}

/// Error returned by [`PhysicalToVirtualMapper::map`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The physical address cannot be mapped in the address space.
    #[error("Physical address 0x{:x} is out of range", .0)]
    InvalidPhysicalAddress(u64),

    /// No page size fits in any candidate canonical range.
    #[error("Unable to map 0x{size:x} bytes at physical address 0x{pa:x}")]
    NoMapping {
        /// The first physical address.
        pa: u64,

        /// The number of bytes.
        size: u64,
    },

    /// Generation cannot continue.
    #[error("{}", .0)]
    Fatal(#[from] FatalError),
}

impl MapError {
    /// Returns true if the error cannot be recovered from by trying a different request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MapError::Fatal(_))
    }
}

/// Maps physical memory into an address space, picking page sizes and virtual addresses at random.
#[derive(Clone, Debug)]
pub struct PhysicalToVirtualMapper<'a> {
    strategy: MappingStrategy,
    choices: &'a ChoicesModerator,
}

impl<'a> PhysicalToVirtualMapper<'a> {
    /// Creates a mapper that uses `strategy` to pick virtual addresses.
    pub fn new(strategy: MappingStrategy, choices: &'a ChoicesModerator) -> Self {
        PhysicalToVirtualMapper {
            strategy,
            choices,
        }
    }

    /// The strategy used to pick virtual addresses.
    pub fn strategy(&self) -> MappingStrategy {
        self.strategy
    }

    /// Orders the candidate ranges by drawing them at random, weighted by the amount of free memory in them.
    fn order_candidates(
        &self, mut candidates: Vec<(CanonicalRange, IntervalSet)>, rng: &mut impl Rng,
    ) -> Vec<(CanonicalRange, IntervalSet)> {
        let mut ordered = Vec::with_capacity(candidates.len());
        while !candidates.is_empty() {
            let index = match WeightedIndex::new(candidates.iter().map(|(_, free)| free.size() as f64)) {
                Ok(dist) => dist.sample(rng),
                Err(_) => 0,
            };

            ordered.push(candidates.remove(index));
        }

        ordered
    }

    fn pick_va(&self, free: &IntervalSet, page_pa: u64, size: u64, rng: &mut impl Rng) -> Option<u64> {
        match self.strategy {
            MappingStrategy::Flat => free
                .contains_interval(&Interval::from_start_size(page_pa, size))
                .then_some(page_pa),
            MappingStrategy::Random => free.choose_aligned_start(size, size, rng),
        }
    }

    /// Maps `request` into `space`.
    ///
    /// If a page that maps the physical memory with the requested attributes already exists, it is returned.
    /// Otherwise a new page is committed.
    pub fn map<A: Arch>(
        &self, space: &mut VmAddressSpace<A>, request: &MapRequest, memory: &mut PhysicalMemoryManager, rng: &mut impl Rng,
    ) -> Result<Page, MapError> {
        let size = request.size.max(1);
        let last = request
            .pa
            .checked_add(size - 1)
            .filter(|&last| last <= space.layout().max_physical_address)
            .ok_or(MapError::InvalidPhysicalAddress(request.pa))?;

        if let Some(page) = space.lookup_physical(request.pa) {
            if page.physical_range().contains(last) && page.satisfies(&request.page) {
                debug!("0x{:x} is already mapped by {page}", request.pa);
                return Ok(page.clone());
            }
        }

        let candidates = space
            .layout()
            .ranges
            .iter()
            .filter(|range| self.strategy != MappingStrategy::Flat || range.range.contains(request.pa))
            .map(|range| (*range, space.free_virtual(range.kind)))
            .filter(|(_, free)| !free.is_empty())
            .collect::<Vec<_>>();

        for (range, free) in self.order_candidates(candidates, rng) {
            let mut choice = PageSizeChoice::from_moderator(self.choices, range.granule).map_err(FatalError::from)?;
            let mut too_large = None;

            while let Some(page_size) = choice.choose(rng) {
                if too_large.is_some_and(|bound| page_size.size >= bound) {
                    choice.exclude(page_size.size);
                    continue;
                }

                let page_pa = align_down(request.pa, page_size.size);
                if page_pa + (page_size.size - 1) < last {
                    trace!("A {} page at 0x{page_pa:x} is too small", DisplaySize(page_size.size));
                    choice.exclude(page_size.size);
                    continue;
                }

                let mut slots = free.clone();
                slots.align_with_size(page_size.size);
                if slots.is_empty() {
                    trace!("{} pages do not fit in the {} range", DisplaySize(page_size.size), range.kind);
                    too_large = Some(too_large.map_or(page_size.size, |bound: u64| bound.min(page_size.size)));
                    choice.exclude_at_least(page_size.size);
                    continue;
                }

                let Some(va) = self.pick_va(&slots, page_pa, page_size.size, rng) else {
                    trace!("No virtual address for a {} page", DisplaySize(page_size.size));
                    choice.exclude(page_size.size);
                    continue;
                };

                match space.commit_page(range.kind, va, page_pa, page_size, request.bank, &request.page, memory, rng) {
                    Ok(page) => return Ok(page),
                    Err(CommitError::Fatal(e)) => return Err(MapError::Fatal(e)),
                    Err(e) => {
                        debug!("Unable to commit a {} page: {e}", DisplaySize(page_size.size));
                        choice.exclude(page_size.size);
                    },
                }
            }
        }

        info!("Unable to map {} at 0x{:x}", DisplaySize(size), request.pa);
        Err(MapError::NoMapping {
            pa: request.pa,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use test_log::test;

    use super::{MapError, MapRequest, PhysicalToVirtualMapper};
    use crate::arch::riscv::RiscV;
    use crate::arch::RangeKind;
    use crate::choice::ChoicesModerator;
    use crate::config::{BankConfig, MappingStrategy, PageTableConfig};
    use crate::dispatch::ThreadId;
    use crate::interval::{Interval, IntervalSet};
    use crate::memory::PhysicalMemoryManager;
    use crate::vm::{AccessKind, PageRequest, Privilege, VmAddressSpace, VmContext};

    fn setup(rng: &mut Xoshiro256PlusPlus) -> (PhysicalMemoryManager, VmAddressSpace<RiscV>) {
        let mut memory = PhysicalMemoryManager::new(&[BankConfig {
            name: String::from("dram"),
            range: Interval::new(0x8000_0000, 0xbfff_ffff),
            reserved: IntervalSet::new(),
        }]);
        let config = PageTableConfig {
            bank: 0,
            region: IntervalSet::from_range(0x8000_0000, 0x80ff_ffff),
            tables_per_block: 16,
        };
        let space = VmAddressSpace::new(VmContext::default(), ThreadId(0), &config, &mut memory, rng).unwrap();

        (memory, space)
    }

    fn request(pa: u64, size: u64) -> MapRequest {
        MapRequest {
            pa,
            bank: 0,
            size,
            page: PageRequest::new(AccessKind::Load, Privilege::Supervisor),
        }
    }

    #[test]
    pub fn random_mappings_do_not_overlap() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let (mut memory, mut space) = setup(&mut rng);
        let choices = ChoicesModerator::default();
        let mapper = PhysicalToVirtualMapper::new(MappingStrategy::Random, &choices);

        for i in 0..64 {
            let pa = 0x9000_0000 + i * 0x10_0000 + 0x123;
            let page = space
                .map_physical_to_virtual(&mapper, &request(pa, 8), &mut memory, &mut rng)
                .unwrap();
            assert!(page.physical_range().contains(pa));
            assert_eq!(page.va % page.size, 0);
            assert_eq!(space.translate(page.reverse_translate(pa).unwrap()), Some(pa));
        }

        let pages = space.pages();
        for (i, a) in pages.iter().enumerate() {
            for b in pages[i + 1..].iter() {
                assert!(!a.physical_range().overlaps(&b.physical_range()));
                assert!(!a.virtual_range().overlaps(&b.virtual_range()));
            }

            for table in space.page_tables() {
                assert!(!table.physical_range().overlaps(&a.physical_range()));
            }
        }
    }

    #[test]
    pub fn flat_mapping_is_identity() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let (mut memory, mut space) = setup(&mut rng);
        let choices = ChoicesModerator::default();
        let mapper = PhysicalToVirtualMapper::new(MappingStrategy::Flat, &choices);

        for i in 0..16 {
            let pa = 0xa000_0000 + i * 0x40_0000;
            let page = space
                .map_physical_to_virtual(&mapper, &request(pa, 0x1000), &mut memory, &mut rng)
                .unwrap();
            assert_eq!(page.va, page.pa);
            assert_eq!(page.range, RangeKind::Low);
            assert_eq!(space.translate(pa), Some(pa));
        }
    }

    #[test]
    pub fn existing_pages_are_reused() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let (mut memory, mut space) = setup(&mut rng);
        let choices = ChoicesModerator::default();
        let mapper = PhysicalToVirtualMapper::new(MappingStrategy::Random, &choices);

        let first = space
            .map_physical_to_virtual(&mapper, &request(0x9000_0000, 0x10), &mut memory, &mut rng)
            .unwrap();
        let second = space
            .map_physical_to_virtual(&mapper, &request(0x9000_0008, 0x8), &mut memory, &mut rng)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(space.pages().len(), 1);

        // A page with different permissions cannot be reused, and the memory is already mapped.
        let mut fetch = request(0x9000_0000, 0x10);
        fetch.page = PageRequest::new(AccessKind::Fetch, Privilege::Supervisor);
        assert_eq!(
            space.map_physical_to_virtual(&mapper, &fetch, &mut memory, &mut rng),
            Err(MapError::NoMapping {
                pa: 0x9000_0000,
                size: 0x10
            })
        );
    }

    #[test]
    pub fn invalid_physical_address() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let (mut memory, mut space) = setup(&mut rng);
        let choices = ChoicesModerator::default();
        let mapper = PhysicalToVirtualMapper::new(MappingStrategy::Random, &choices);

        let result = space.map_physical_to_virtual(&mapper, &request(1 << 60, 0x1000), &mut memory, &mut rng);
        assert_eq!(result, Err(MapError::InvalidPhysicalAddress(1 << 60)));

        let result = space.map_physical_to_virtual(&mapper, &request(u64::MAX - 4, 0x10), &mut memory, &mut rng);
        assert_eq!(result, Err(MapError::InvalidPhysicalAddress(u64::MAX - 4)));
    }

    #[test]
    pub fn page_tables_cannot_be_mapped() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
        let (mut memory, mut space) = setup(&mut rng);
        let choices = ChoicesModerator::default();
        let mapper = PhysicalToVirtualMapper::new(MappingStrategy::Random, &choices);

        let root = space.page_tables()[0];
        let result = space.map_physical_to_virtual(&mapper, &request(root.base, 0x10), &mut memory, &mut rng);
        assert!(matches!(result, Err(MapError::NoMapping { .. })));
        assert!(!result.unwrap_err().is_fatal());
    }
}
