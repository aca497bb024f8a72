//! RISC-V paged virtual memory (Sv39, Sv48 and Sv57).

use arrayvec::ArrayVec;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Arch, CanonicalRange, Granule, RangeKind, VmLayout};
use crate::vm::{AccessKind, PageRequest, Privilege, PteAttribute};

/// The RISC-V architecture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RiscV;

/// The `satp` translation modes.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiscvMode {
    #[default]
    Sv39,
    Sv48,
    Sv57,
}

/// Physical addresses are 56 bits wide in all translation modes.
pub const MAX_PHYSICAL_ADDRESS: u64 = (1 << 56) - 1;

const SV39: Granule = Granule {
    name: "4K",
    table_size: 0x1000,
    entry_spans: &[0x1000, 0x20_0000, 0x4000_0000],
    leaf_levels: &[0, 1, 2],
};

const SV48: Granule = Granule {
    name: "4K",
    table_size: 0x1000,
    entry_spans: &[0x1000, 0x20_0000, 0x4000_0000, 0x80_0000_0000],
    leaf_levels: &[0, 1, 2, 3],
};

const SV57: Granule = Granule {
    name: "4K",
    table_size: 0x1000,
    entry_spans: &[0x1000, 0x20_0000, 0x4000_0000, 0x80_0000_0000, 0x1_0000_0000_0000],
    leaf_levels: &[0, 1, 2, 3, 4],
};

impl Arch for RiscV {
    type Mode = RiscvMode;

    const NAME: &'static str = "riscv";

    fn layout(mode: RiscvMode) -> VmLayout {
        let (va_bits, granule) = match mode {
            RiscvMode::Sv39 => (39, SV39),
            RiscvMode::Sv48 => (48, SV48),
            RiscvMode::Sv57 => (57, SV57),
        };

        let (low, high) = VmLayout::split_ranges(va_bits);
        let mut ranges = ArrayVec::new();
        ranges.push(CanonicalRange {
            kind: RangeKind::Low,
            range: low,
            granule,
        });
        ranges.push(CanonicalRange {
            kind: RangeKind::High,
            range: high,
            granule,
        });

        VmLayout {
            va_bits,
            max_physical_address: MAX_PHYSICAL_ADDRESS,
            ranges,
            shared_root: true,
        }
    }

    fn pte_attributes(request: &PageRequest, rng: &mut impl Rng) -> Vec<PteAttribute> {
        use PteAttribute::*;

        let mut attributes = vec![Valid, Accessed];
        // R=0, W=1 is reserved, so every writable page is also readable.
        match (request.access, request.force_fault) {
            (AccessKind::Fetch, false) => {
                attributes.push(Execute);
                if rng.gen() {
                    attributes.push(Read);
                }
            },
            (AccessKind::Fetch, true) => {
                attributes.push(Read);
                if rng.gen() {
                    attributes.push(Write);
                }
            },
            (AccessKind::Load, false) => {
                attributes.push(Read);
                if rng.gen() {
                    attributes.push(Write);
                }

                if rng.gen_ratio(1, 4) {
                    attributes.push(Execute);
                }
            },
            (AccessKind::Load, true) => attributes.push(Execute),
            (AccessKind::Store, false) => {
                attributes.extend([Read, Write, Dirty]);
                if rng.gen_ratio(1, 4) {
                    attributes.push(Execute);
                }
            },
            (AccessKind::Store, true) => {
                attributes.push(Read);
                if rng.gen() {
                    attributes.push(Execute);
                }
            },
        }

        if request.privilege == Privilege::User {
            attributes.push(User);
        }

        if request.access != AccessKind::Store && rng.gen() {
            attributes.push(Dirty);
        }

        if rng.gen_ratio(1, 4) {
            attributes.push(Global);
        }

        attributes.sort();
        attributes
    }
}
