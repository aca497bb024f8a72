use serde::Serialize;
use vmgen::arch::riscv::RiscV;
use vmgen::context::GenContext;
use vmgen::vm::{AccessKind, MapRequest, Page, PageRequest, PageTable, Privilege, VmAddressSpace};
use vmgen::FatalError;

use crate::{parse_u64, print_json, CliError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum AccessArg {
    Fetch,
    Load,
    Store,
}

impl From<AccessArg> for AccessKind {
    fn from(access: AccessArg) -> Self {
        match access {
            AccessArg::Fetch => AccessKind::Fetch,
            AccessArg::Load => AccessKind::Load,
            AccessArg::Store => AccessKind::Store,
        }
    }
}

#[derive(Clone, Debug, clap::Parser)]
pub struct MapCommand {
    #[clap(long, value_parser = parse_u64)]
    /// The physical address to map. Fresh memory is allocated from the bank when omitted.
    pa: Option<u64>,

    #[clap(long, default_value = "0")]
    /// The memory bank of the physical memory.
    bank: usize,

    #[clap(long, default_value = "4K", value_parser = parse_u64)]
    /// The number of bytes that must be mapped.
    size: u64,

    #[clap(long, value_enum, default_value = "load")]
    /// The access that will be performed on the page.
    access: AccessArg,

    #[clap(long)]
    /// Make the page accessible from user mode.
    user: bool,

    #[clap(long)]
    /// Set up the page so that the access faults.
    fault: bool,

    #[clap(long, default_value = "1")]
    /// The number of mappings to create. Each mapping gets freshly allocated memory unless --pa is given.
    count: usize,
}

#[derive(Serialize)]
struct MapOutput {
    pages: Vec<Page>,
    page_tables: Vec<PageTable>,
}

impl MapCommand {
    fn page_request(&self) -> PageRequest {
        let privilege = if self.user {
            Privilege::User
        } else {
            Privilege::Supervisor
        };
        let request = PageRequest::new(self.access.into(), privilege);

        if self.fault {
            request.with_fault()
        } else {
            request
        }
    }

    pub fn run(&self, ctx: &mut GenContext<RiscV>, space: &mut VmAddressSpace<RiscV>) -> Result<(), CliError> {
        let num_banks = ctx.memory().num_banks();
        if self.bank >= num_banks {
            return Err(
                FatalError::InvalidParameter(format!("bank {} does not exist, there are {num_banks}", self.bank)).into(),
            );
        }

        let mut pages = Vec::new();
        for _ in 0..self.count {
            let pa = match self.pa {
                Some(pa) => pa,
                None => ctx.allocate_physical(self.bank, 0x1000, self.size.max(1))?,
            };

            let request = MapRequest {
                pa,
                bank: self.bank,
                size: self.size,
                page: self.page_request(),
            };
            pages.push(ctx.map_physical_to_virtual(space, &request)?);
        }

        space.log_summary();
        print_json(&MapOutput {
            pages,
            page_tables: space.page_tables(),
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use test_log::test;

    use crate::{Args, Command};

    fn run(args: &[&str]) -> Result<(), crate::CliError> {
        let args = Args::try_parse_from(args).unwrap();
        let Command::Map(command) = &args.command else {
            panic!("expected the map command");
        };

        let (mut ctx, mut space) = args.setup().unwrap();
        command.run(&mut ctx, &mut space)
    }

    #[test]
    pub fn unknown_bank_is_an_error() {
        let err = run(&["vmgen", "--seed", "1", "map", "--bank", "5"]).unwrap_err();
        assert_eq!(err.code(), "InvalidParameter");
    }

    #[test]
    pub fn maps_fresh_memory() {
        run(&["vmgen", "--seed", "1", "map", "--bank", "1", "--count", "3", "--access", "fetch"]).unwrap();
    }
}
