use vmgen::arch::riscv::RiscV;
use vmgen::context::GenContext;
use vmgen::interval::IntervalSet;
use vmgen::vm::VmAddressSpace;

use crate::{parse_interval_set, parse_u64, print_json, CliError};

#[derive(Clone, Debug, clap::Parser)]
pub struct AllocTableCommand {
    #[clap(long, default_value = "4K", value_parser = parse_u64)]
    /// The alignment of each allocation.
    align: u64,

    #[clap(long, default_value = "4K", value_parser = parse_u64)]
    /// The size of each allocation.
    size: u64,

    #[clap(long, value_parser = parse_interval_set)]
    /// Physical addresses that may not be used.
    exclude: Option<IntervalSet>,

    #[clap(long, default_value = "1")]
    /// The number of allocations.
    count: usize,
}

impl AllocTableCommand {
    pub fn run(&self, ctx: &mut GenContext<RiscV>, space: &mut VmAddressSpace<RiscV>) -> Result<(), CliError> {
        if !self.align.is_power_of_two() || self.size == 0 {
            return Err(vmgen::FatalError::InvalidParameter(format!(
                "cannot allocate 0x{:x} bytes aligned to 0x{:x}",
                self.size, self.align
            ))
            .into());
        }

        let addresses = (0..self.count)
            .map(|_| ctx.allocate_page_table_block(space, self.align, self.size, self.exclude.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        print_json(&addresses)
    }
}
