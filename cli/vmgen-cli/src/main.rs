use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::*;
use serde::Serialize;
use thiserror::Error;
use vmgen::arch::riscv::{RiscV, RiscvMode};
use vmgen::config::{ConfigError, GenConfig};
use vmgen::context::GenContext;
use vmgen::interval::IntervalSet;
use vmgen::memory::AllocationError;
use vmgen::vm::{MapError, VmAddressSpace};
use vmgen::FatalError;

mod alloc_table;
mod claim;
mod map;
mod offsets;

use alloc_table::AllocTableCommand;
use claim::ClaimCommand;
use map::MapCommand;
use offsets::OffsetsCommand;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{}", .0)]
    Fatal(#[from] FatalError),

    #[error("{}", .0)]
    Map(#[from] MapError),

    #[error("{}", .0)]
    Allocation(#[from] AllocationError),

    #[error("{}", .0)]
    Config(#[from] ConfigError),

    #[error("Unable to write output: {}", .0)]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// The diagnostic printed before exiting.
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Fatal(e) | CliError::Map(MapError::Fatal(e)) => e.code(),
            CliError::Map(MapError::InvalidPhysicalAddress(_)) => "InvalidPhysicalAddress",
            CliError::Map(MapError::NoMapping { .. }) => "NoMapping",
            CliError::Allocation(_) => "OutOfMemory",
            CliError::Config(_) => "Config",
            CliError::Output(_) => "Output",
        }
    }
}

#[derive(Clone, Debug, clap::Subcommand)]
enum Command {
    /// Find free virtual ranges for a sequence of pages.
    Claim(ClaimCommand),

    /// Map physical memory into the address space.
    Map(MapCommand),

    /// Allocate page-table memory.
    AllocTable(AllocTableCommand),

    /// Compute the offset field values of a base+offset access that reach a target region.
    Offsets(OffsetsCommand),

    /// Print the default configuration.
    DefaultConfig,
}

#[derive(Clone, Debug, clap::Parser)]
#[command(version, about = "Resolves free ranges, maps pages and allocates page tables for RISC-V address spaces")]
struct Args {
    #[clap(long)]
    /// A JSON configuration file. The default configuration is used when omitted.
    config: Option<PathBuf>,

    #[clap(long)]
    /// Overrides the seed in the configuration.
    seed: Option<u64>,

    #[clap(long, default_value = "0")]
    /// The index of the configured address space to operate on.
    address_space: usize,

    #[clap(subcommand)]
    command: Command,
}

/// Parses a comma-separated list of ranges such as `0x1000-0x1fff,0x3000`.
pub fn parse_interval_set(s: &str) -> Result<IntervalSet, String> {
    let parse = |v: &str| vmgen::utils::parse_size(v).ok_or_else(|| format!("invalid address: {v:?}"));
    let mut set = IntervalSet::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("invalid range: {part}"));
                }

                set.add_range(lo, hi);
            },
            None => set.add_value(parse(part)?),
        }
    }

    Ok(set)
}

/// Parses an address or size such as `0x8000_0000`, `4096` or `2M`.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    vmgen::utils::parse_size(s).ok_or_else(|| format!("invalid number: {s:?}"))
}

/// Prints `value` as JSON to stdout.
pub fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Args {
    fn load_config(&self) -> Result<GenConfig<RiscvMode>, CliError> {
        let mut config = match &self.config {
            Some(path) => GenConfig::from_file(path)?,
            None => GenConfig::default(),
        };

        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }

        // Only the selected address space is created.
        let selected = config.address_spaces.get(self.address_space).cloned().ok_or_else(|| {
            FatalError::InvalidParameter(format!(
                "address space {} does not exist, there are {}",
                self.address_space,
                config.address_spaces.len()
            ))
        })?;
        config.address_spaces = vec![selected];

        Ok(config)
    }

    fn setup(&self) -> Result<(GenContext<RiscV>, VmAddressSpace<RiscV>), CliError> {
        let mut ctx = GenContext::new(self.load_config()?)?;
        let space = ctx.create_address_spaces()?.remove(0);

        Ok((ctx, space))
    }

    fn run(&self) -> Result<(), CliError> {
        match &self.command {
            Command::DefaultConfig => print_json(&GenConfig::<RiscvMode>::default()),
            Command::Offsets(command) => command.run(),
            Command::Claim(command) => {
                let (mut ctx, space) = self.setup()?;
                command.run(&mut ctx, &space)
            },
            Command::Map(command) => {
                let (mut ctx, mut space) = self.setup()?;
                command.run(&mut ctx, &mut space)
            },
            Command::AllocTable(command) => {
                let (mut ctx, mut space) = self.setup()?;
                command.run(&mut ctx, &mut space)
            },
        }
    }
}

pub fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    trace!("Args: {args:#?}");

    match args.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{}", e.code());
            ExitCode::FAILURE
        },
    }
}
