use vmgen::arch::riscv::RiscV;
use vmgen::context::GenContext;
use vmgen::interval::IntervalSet;
use vmgen::vm::{PageSizeRequest, VmAddressSpace};

use crate::{parse_interval_set, print_json, CliError};

#[derive(Clone, Debug, clap::Parser)]
pub struct ClaimCommand {
    #[clap(long, value_parser = parse_interval_set)]
    /// The virtual addresses in which the pages must be placed, like `0x1000-0xffff,0x20000-0x2ffff`.
    /// Any free address is acceptable when omitted.
    region: Option<IntervalSet>,

    #[clap(required = true)]
    /// The requested page sizes, like `4K`, `2M` or `any`.
    sizes: Vec<PageSizeRequest>,
}

impl ClaimCommand {
    pub fn run(&self, ctx: &mut GenContext<RiscV>, space: &VmAddressSpace<RiscV>) -> Result<(), CliError> {
        let region = self.region.clone().unwrap_or_else(IntervalSet::full);
        let result = ctx.claim_free_ranges(space, &region, &self.sizes)?;

        // A failed claim is not an error: it is reported as `null`.
        print_json(&result)
    }
}
