//! Run configuration, loaded from JSON.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::choice::{ChoiceTree, ChoicesModerator};
use crate::interval::{Interval, IntervalSet};

/// Error returned when a configuration cannot be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Unable to read configuration: {}", .0)]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON, or does not match the expected format.
    #[error("Unable to parse configuration: {}", .0)]
    Json(#[from] serde_json::Error),

    /// The configuration is well-formed, but describes something that cannot be used.
    #[error("Invalid configuration: {}", .0)]
    Invalid(String),
}

/// A physical memory bank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankConfig {
    /// A human-readable name, like `dram`.
    pub name: String,

    /// The physical addresses of the bank.
    pub range: Interval,

    /// Addresses in the bank that may not be allocated, for example because they hold firmware.
    #[serde(default)]
    pub reserved: IntervalSet,
}

/// Where page tables are stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTableConfig {
    /// The bank from which page tables are allocated.
    pub bank: usize,

    /// The physical addresses in which page tables may be placed.
    pub region: IntervalSet,

    /// The number of tables for which memory is reserved at once.
    pub tables_per_block: u64,
}

/// How a virtual address is picked for a physical address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingStrategy {
    /// The virtual address equals the physical address.
    Flat,

    /// Any free virtual address.
    #[default]
    Random,
}

/// A single address space to create.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "M: Serialize", deserialize = "M: DeserializeOwned"))]
pub struct AddressSpaceConfig<M> {
    /// The translation mode.
    pub mode: M,

    /// The address-space identifier.
    #[serde(default)]
    pub asid: u16,
}

/// The configuration of a generation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "M: Serialize", deserialize = "M: DeserializeOwned"))]
pub struct GenConfig<M> {
    /// The seed of the random number generator. A random seed is used when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// The physical memory banks.
    pub banks: Vec<BankConfig>,

    /// Page table placement.
    pub page_table: PageTableConfig,

    /// How virtual addresses are picked when mapping physical memory.
    #[serde(default)]
    pub mapping_strategy: MappingStrategy,

    /// The address spaces to create.
    #[serde(default)]
    pub address_spaces: Vec<AddressSpaceConfig<M>>,

    /// Choice trees that replace the built-in trees with the same name.
    #[serde(default)]
    pub choices: Vec<ChoiceTree>,
}

impl<M: Default> Default for GenConfig<M> {
    fn default() -> Self {
        GenConfig {
            seed: None,
            banks: vec![
                BankConfig {
                    name: String::from("dram"),
                    range: Interval::new(0x8000_0000, 0xbfff_ffff),
                    reserved: IntervalSet::from_range(0x8000_0000, 0x801f_ffff),
                },
                BankConfig {
                    name: String::from("sram"),
                    range: Interval::new(0x1000_0000, 0x1003_ffff),
                    reserved: IntervalSet::new(),
                },
            ],
            page_table: PageTableConfig {
                bank: 0,
                region: IntervalSet::from_range(0x8000_0000, 0x87ff_ffff),
                tables_per_block: 16,
            },
            mapping_strategy: MappingStrategy::Random,
            address_spaces: vec![AddressSpaceConfig {
                mode: M::default(),
                asid: 0,
            }],
            choices: Vec::new(),
        }
    }
}

impl<M: DeserializeOwned> GenConfig<M> {
    /// Reads a configuration from the JSON file at `path`, and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.validate()?;
        Ok(config)
    }
}

impl<M> GenConfig<M> {
    /// Checks that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.banks.is_empty() {
            return Err(ConfigError::Invalid(String::from("at least one memory bank is needed")));
        }

        for (a, b) in self.banks.iter().tuple_combinations() {
            if a.range.overlaps(&b.range) {
                return Err(ConfigError::Invalid(format!(
                    "memory banks {} ({}) and {} ({}) overlap",
                    a.name, a.range, b.name, b.range
                )));
            }
        }

        let Some(bank) = self.banks.get(self.page_table.bank) else {
            return Err(ConfigError::Invalid(format!(
                "page tables are placed in bank {}, but there are only {} banks",
                self.page_table.bank,
                self.banks.len()
            )));
        };

        if !self.page_table.region.intersects_interval(&bank.range) {
            return Err(ConfigError::Invalid(format!(
                "the page table region {} lies outside bank {} ({})",
                self.page_table.region, bank.name, bank.range
            )));
        }

        if self.page_table.tables_per_block == 0 {
            return Err(ConfigError::Invalid(String::from("tables_per_block must be at least 1")));
        }

        Ok(())
    }

    /// Builds the choice trees for this run: the built-in trees, overridden by the configured ones.
    pub fn choices_moderator(&self) -> ChoicesModerator {
        let mut moderator = ChoicesModerator::default();
        for tree in self.choices.iter() {
            moderator.insert(tree.clone());
        }

        moderator
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{ConfigError, GenConfig, MappingStrategy};
    use crate::arch::riscv::RiscvMode;
    use crate::choice::{Choice, ChoiceTree, FREE_RANGE_STRATEGY_TREE};
    use crate::interval::Interval;

    #[test]
    pub fn default_config_is_valid() {
        GenConfig::<RiscvMode>::default().validate().unwrap();
    }

    #[test]
    pub fn json_round_trip() {
        let mut config = GenConfig::<RiscvMode>::default();
        config.seed = Some(42);
        config.mapping_strategy = MappingStrategy::Flat;
        config.address_spaces[0].mode = RiscvMode::Sv48;

        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: GenConfig<RiscvMode> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    pub fn minimal_json() {
        let config: GenConfig<RiscvMode> = serde_json::from_str(
            r#"{
                "banks": [ { "name": "dram", "range": [2147483648, 2415919103] } ],
                "page_table": { "bank": 0, "region": [[2147483648, 2181038079]], "tables_per_block": 4 }
            }"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.seed, None);
        assert_eq!(config.mapping_strategy, MappingStrategy::Random);
        assert!(config.address_spaces.is_empty());
        assert!(config.banks[0].reserved.is_empty());
    }

    #[test]
    pub fn invalid_configs() {
        let mut config = GenConfig::<RiscvMode>::default();
        config.page_table.bank = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GenConfig::<RiscvMode>::default();
        config.banks[1].range = Interval::new(0xbfff_0000, 0xc000_ffff);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GenConfig::<RiscvMode>::default();
        config.page_table.tables_per_block = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    pub fn configured_trees_override_defaults() {
        let mut config = GenConfig::<RiscvMode>::default();
        config.choices.push(ChoiceTree::new(FREE_RANGE_STRATEGY_TREE, vec![Choice::new("LowRangeOnly", 0, 1)]));

        let moderator = config.choices_moderator();
        let tree = moderator.clone_choice_tree(FREE_RANGE_STRATEGY_TREE).unwrap();
        assert_eq!(tree.choices().len(), 1);
        assert!(moderator.page_size_tree("4K").is_ok());
    }
}
