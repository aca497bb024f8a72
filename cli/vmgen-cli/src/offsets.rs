use vmgen::arch::riscv::MAX_PHYSICAL_ADDRESS;
use vmgen::interval::{BaseOffsetConstraint, IntervalSet};

use crate::{parse_interval_set, parse_u64, CliError};

#[derive(Clone, Debug, clap::Parser)]
pub struct OffsetsCommand {
    #[clap(long, default_value = "12")]
    /// The width of the offset field in bits.
    offset_size: u32,

    #[clap(long, default_value = "0")]
    /// The amount by which the offset is shifted left before it is added to the base.
    shift: u32,

    #[clap(long, value_parser = parse_u64)]
    /// The value of the base register.
    base: u64,

    #[clap(long, default_value = "1", value_parser = parse_u64)]
    /// The number of bytes accessed.
    access_size: u64,

    #[clap(long, value_parser = parse_interval_set)]
    /// The acceptable target addresses.
    target: IntervalSet,

    #[clap(long, value_parser = parse_u64)]
    /// The highest address that may be accessed. Defaults to the highest RISC-V physical address.
    max_address: Option<u64>,
}

impl OffsetsCommand {
    pub fn run(&self) -> Result<(), CliError> {
        let constraint = BaseOffsetConstraint::new(
            self.offset_size,
            self.shift,
            self.max_address.unwrap_or(MAX_PHYSICAL_ADDRESS),
        )?;
        let offsets = constraint.offset_constraint(self.base, self.access_size.max(1), &self.target);

        println!("{offsets}");
        Ok(())
    }
}
