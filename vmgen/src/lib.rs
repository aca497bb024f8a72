#![deny(rustdoc::missing_crate_level_docs, rustdoc::invalid_codeblock_attributes)]
#![warn(missing_docs)]
#![doc(html_no_source)]

//! vmgen is the virtual-memory core of a constraint-driven random instruction-stream generator.
//! It decides where pages are mapped, how large they are and where their page tables live.
//!
//! The crate consists of three layers:
//!
//! - [`interval::IntervalSet`], the set algebra in which every constraint on addresses and field values is expressed;
//! - the mapping engine in [`vm`], which maps physical memory into an address space
//!   ([`vm::PhysicalToVirtualMapper`]) and allocates page tables ([`vm::PageTableResourceConstraint`]);
//! - free-range resolution ([`vm::FreeRangeClaimer`]), which finds room for a sequence of new pages.
//!
//! Architecture-specific details are described by an [`arch::Arch`] implementation.
//! RISC-V is available as [`arch::riscv::RiscV`].
//!
//! # Example
//! ```rust
//! use vmgen::arch::riscv::RiscV;
//! use vmgen::config::GenConfig;
//! use vmgen::context::GenContext;
//! use vmgen::vm::{AccessKind, MapRequest, PageRequest, Privilege};
//!
//! let mut ctx = GenContext::<RiscV>::new(GenConfig { seed: Some(1), ..GenConfig::default() }).unwrap();
//! let mut space = ctx.create_address_spaces().unwrap().remove(0);
//! let pa = ctx.allocate_physical(0, 0x1000, 0x1000).unwrap();
//! let page = ctx
//!     .map_physical_to_virtual(&mut space, &MapRequest {
//!         pa,
//!         bank: 0,
//!         size: 0x1000,
//!         page: PageRequest::new(AccessKind::Load, Privilege::Supervisor),
//!     })
//!     .unwrap();
//!
//! assert_eq!(space.translate(page.va + (pa - page.pa)), Some(pa));
//! ```

pub mod arch;
pub mod choice;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod interval;
pub mod memory;
pub mod utils;
pub mod vm;

pub use error::FatalError;
