//! The state shared by all address spaces of a generation run.

use log::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::arch::Arch;
use crate::choice::ChoicesModerator;
use crate::config::{AddressSpaceConfig, GenConfig};
use crate::dispatch::{ThreadDispatcher, ThreadId};
use crate::error::FatalError;
use crate::interval::IntervalSet;
use crate::memory::{AllocationError, AllocationOrder, PhysicalMemoryManager};
use crate::vm::{ClaimResult, MapError, MapRequest, Page, PageSizeRequest, PhysicalToVirtualMapper, VmAddressSpace, VmContext};

/// Everything a generation run needs: configuration, choice trees, physical memory and the random number generator.
///
/// There is one context per run. It is passed explicitly to everything that needs it.
/// Because every operation takes the context mutably, the context acts for one generator thread at a time:
/// each operation takes the turn of the thread that owns the address space with [`ThreadDispatcher::enter`].
pub struct GenContext<A: Arch> {
    config: GenConfig<A::Mode>,
    seed: u64,
    choices: ChoicesModerator,
    memory: PhysicalMemoryManager,
    dispatcher: ThreadDispatcher,
    rng: Xoshiro256PlusPlus,
    next_thread: u32,
}

impl<A: Arch> GenContext<A> {
    /// Validates `config` and creates a new context.
    /// When the configuration has no seed, a random seed is picked and logged.
    pub fn new(config: GenConfig<A::Mode>) -> Result<Self, FatalError> {
        config.validate()?;

        let seed = config.seed.unwrap_or_else(rand::random);
        info!("Generating for {} with seed {seed}", A::NAME);

        Ok(GenContext {
            choices: config.choices_moderator(),
            memory: PhysicalMemoryManager::new(&config.banks),
            dispatcher: ThreadDispatcher::new(),
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            seed,
            config,
            next_thread: 0,
        })
    }

    /// The configuration of the run.
    pub fn config(&self) -> &GenConfig<A::Mode> {
        &self.config
    }

    /// The seed of the random number generator.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The choice trees of the run.
    pub fn choices(&self) -> &ChoicesModerator {
        &self.choices
    }

    /// The physical memory of the run.
    pub fn memory(&self) -> &PhysicalMemoryManager {
        &self.memory
    }

    /// The dispatcher that schedules the generator threads of the run.
    pub fn dispatcher(&self) -> &ThreadDispatcher {
        &self.dispatcher
    }

    /// The random number generator of the run.
    pub fn rng(&mut self) -> &mut impl Rng {
        &mut self.rng
    }

    /// Creates an address space for `config`, owned by a newly registered generator thread.
    pub fn create_address_space(&mut self, config: &AddressSpaceConfig<A::Mode>) -> Result<VmAddressSpace<A>, FatalError> {
        let thread = ThreadId(self.next_thread);
        self.next_thread += 1;
        self.dispatcher.register(thread);

        VmAddressSpace::new(
            VmContext {
                mode: config.mode,
                asid: config.asid,
            },
            thread,
            &self.config.page_table,
            &mut self.memory,
            &mut self.rng,
        )
    }

    /// Creates all address spaces in the configuration.
    pub fn create_address_spaces(&mut self) -> Result<Vec<VmAddressSpace<A>>, FatalError> {
        let configs = self.config.address_spaces.clone();
        configs.iter().map(|config| self.create_address_space(config)).collect()
    }

    /// Claims free ranges in `space`. See [`VmAddressSpace::claim_free_ranges`].
    pub fn claim_free_ranges(
        &mut self, space: &VmAddressSpace<A>, region: &IntervalSet, requested: &[PageSizeRequest],
    ) -> Result<Option<ClaimResult>, FatalError> {
        let _guard = self.dispatcher.enter(space.thread(), false);
        space.claim_free_ranges(region, requested, &self.choices, &mut self.rng)
    }

    /// Maps physical memory into `space` with the configured mapping strategy.
    pub fn map_physical_to_virtual(&mut self, space: &mut VmAddressSpace<A>, request: &MapRequest) -> Result<Page, MapError> {
        let _guard = self.dispatcher.enter(space.thread(), true);
        let mapper = PhysicalToVirtualMapper::new(self.config.mapping_strategy, &self.choices);
        space.map_physical_to_virtual(&mapper, request, &mut self.memory, &mut self.rng)
    }

    /// Allocates page-table memory for `space`.
    pub fn allocate_page_table_block(
        &mut self, space: &mut VmAddressSpace<A>, align: u64, size: u64, exclude: Option<&IntervalSet>,
    ) -> Result<u64, FatalError> {
        let _guard = self.dispatcher.enter(space.thread(), true);
        space.allocate_page_table_block(align, size, exclude, &mut self.memory, &mut self.rng)
    }

    /// Allocates `size` bytes of physical memory at a random, `align`-aligned address in `bank`.
    ///
    /// # Panics
    /// Panics if there is no bank `bank`.
    pub fn allocate_physical(&mut self, bank: usize, align: u64, size: u64) -> Result<u64, AllocationError> {
        self.memory
            .allocate(bank, align, size, &IntervalSet::full(), AllocationOrder::Random, &mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::GenContext;
    use crate::arch::riscv::{RiscV, RiscvMode};
    use crate::config::{AddressSpaceConfig, BankConfig, GenConfig, PageTableConfig};
    use crate::error::FatalError;
    use crate::interval::{Interval, IntervalSet};
    use crate::vm::{AccessKind, MapRequest, PageRequest, PageSizeRequest, Privilege};

    fn config(seed: u64) -> GenConfig<RiscvMode> {
        GenConfig {
            seed: Some(seed),
            ..GenConfig::default()
        }
    }

    #[test]
    pub fn same_seed_same_result() {
        let run = || {
            let mut ctx = GenContext::<RiscV>::new(config(7)).unwrap();
            let mut spaces = ctx.create_address_spaces().unwrap();
            let space = &mut spaces[0];
            let pa = ctx.allocate_physical(0, 0x1000, 0x1000).unwrap();
            let page = ctx
                .map_physical_to_virtual(
                    space,
                    &MapRequest {
                        pa,
                        bank: 0,
                        size: 0x1000,
                        page: PageRequest::new(AccessKind::Store, Privilege::User),
                    },
                )
                .unwrap();

            (page, space.page_tables())
        };

        assert_eq!(run(), run());
    }

    #[test]
    pub fn threads_are_registered() {
        let mut ctx = GenContext::<RiscV>::new(config(0)).unwrap();
        let mut config = ctx.config().address_spaces[0].clone();
        let a = ctx.create_address_space(&config).unwrap();
        config.asid = 3;
        let b = ctx.create_address_space(&config).unwrap();

        assert_ne!(a.thread(), b.thread());
        assert_eq!(ctx.dispatcher().threads(), vec![a.thread(), b.thread()]);
        assert!(!a.can_alias_root(&b));

        let result = ctx
            .claim_free_ranges(&a, &IntervalSet::from_range(0x1000, 0x1fff), &[PageSizeRequest::Exact(0x1000)])
            .unwrap()
            .unwrap();
        assert_eq!(result.start, 0x1000);
    }

    #[test]
    pub fn address_spaces_take_turns_in_any_order() {
        let mut ctx = GenContext::<RiscV>::new(GenConfig {
            banks: vec![BankConfig {
                name: String::from("small"),
                range: Interval::new(0x8000_0000, 0x8003_ffff),
                reserved: IntervalSet::new(),
            }],
            page_table: PageTableConfig {
                bank: 0,
                region: IntervalSet::from_range(0x8000_0000, 0x8003_ffff),
                tables_per_block: 1,
            },
            address_spaces: vec![
                AddressSpaceConfig {
                    mode: RiscvMode::Sv39,
                    asid: 1,
                },
                AddressSpaceConfig {
                    mode: RiscvMode::Sv39,
                    asid: 2,
                },
            ],
            ..config(9)
        })
        .unwrap();
        let mut spaces = ctx.create_address_spaces().unwrap();
        let request = |pa| MapRequest {
            pa,
            bank: 0,
            size: 0x1000,
            page: PageRequest::new(AccessKind::Load, Privilege::Supervisor),
        };

        // Space 0 twice in a row, then both spaces taking turns on frames in the page-table region.
        let mut frames = (0x8000_0000..0x8004_0000u64).step_by(0x1000);
        let mut mapped = 0;
        for index in [0, 0, 1, 0, 1, 1, 0, 1, 0, 0, 1, 1, 0, 1, 0, 1] {
            ctx.claim_free_ranges(&spaces[index], &IntervalSet::full(), &[PageSizeRequest::Exact(0x1000)])
                .unwrap()
                .unwrap();

            for pa in frames.by_ref() {
                let holds_tables = ctx.memory().bank(0).page_table_blocks().contains_value(pa);
                if !holds_tables && ctx.map_physical_to_virtual(&mut spaces[index], &request(pa)).is_ok() {
                    mapped += 1;
                    break;
                }
            }
        }

        assert!(mapped >= 8, "only {mapped} pages were mapped");
        let extra = ctx.allocate_page_table_block(&mut spaces[1], 0x1000, 0x1000, None);
        assert!(matches!(extra, Ok(_) | Err(FatalError::OutOfPageTableSpace { .. })));

        let pages = spaces.iter().flat_map(|s| s.pages().iter().cloned()).collect::<Vec<_>>();
        let tables = spaces.iter().flat_map(|s| s.page_tables()).collect::<Vec<_>>();
        for (i, page) in pages.iter().enumerate() {
            for other in pages[i + 1..].iter() {
                assert!(!page.physical_range().overlaps(&other.physical_range()), "{page} overlaps {other}");
            }

            for table in tables.iter() {
                assert!(!table.physical_range().overlaps(&page.physical_range()), "{table:?} overlaps {page}");
            }
        }

        for (i, a) in tables.iter().enumerate() {
            for b in tables[i + 1..].iter() {
                assert!(!a.physical_range().overlaps(&b.physical_range()));
            }
        }
    }

    #[test]
    pub fn invalid_config_is_fatal() {
        let mut config = config(0);
        config.banks.clear();
        assert!(matches!(GenContext::<RiscV>::new(config), Err(FatalError::Config(_))));
    }
}
