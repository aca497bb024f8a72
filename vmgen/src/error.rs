//! Defines [`FatalError`], the errors after which generation cannot continue.

use thiserror::Error;

use crate::choice::ChoiceError;
use crate::config::ConfigError;

/// An error from which there is no recovery path.
///
/// Recoverable failures (a page size that does not fit, a strategy that cannot be resolved, an empty candidate set)
/// are reported through `Option` or dedicated error types instead.
/// A `FatalError` is propagated up to the front end, which logs it and terminates with [`FatalError::code`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Physical memory for page tables has run out completely.
    #[error("Out of page table space in bank {bank}: no block of at least 0x{table_size:x} bytes can be allocated")]
    OutOfPageTableSpace {
        /// The memory bank from which page tables are allocated.
        bank: usize,

        /// The size of a single page table.
        table_size: u64,
    },

    /// An object was constructed with parameters it cannot represent.
    #[error("Invalid parameter: {}", .0)]
    InvalidParameter(String),

    /// Something that must be set up exactly once was set up twice.
    #[error("{} was set up more than once", .0)]
    AlreadySetUp(&'static str),

    /// The configuration is unusable.
    #[error("Configuration error: {}", .0)]
    Config(String),
}

impl FatalError {
    /// A short name that identifies the kind of error, used as the exit diagnostic.
    pub fn code(&self) -> &'static str {
        match self {
            FatalError::OutOfPageTableSpace { .. } => "OutOfPageTableSpace",
            FatalError::InvalidParameter(_) => "InvalidParameter",
            FatalError::AlreadySetUp(_) => "AlreadySetUp",
            FatalError::Config(_) => "Config",
        }
    }
}

impl From<ChoiceError> for FatalError {
    fn from(e: ChoiceError) -> Self {
        FatalError::Config(e.to_string())
    }
}

impl From<ConfigError> for FatalError {
    fn from(e: ConfigError) -> Self {
        FatalError::Config(e.to_string())
    }
}
