#![cfg_attr(not(feature = "std"), no_std)]
//! A composable non-volatile memory (NVM) storage stack.
//!
//! The crate presents one trait, [`Nvm`], which every backend both implements and consumes:
//!
//! ```text
//!    Fee  ─┐                Mirror  ─┐            Partition  ─┐
//!          └─► Nvm trait ◄───────────┴─────────────────────◄──┘
//!                     ▲
//!                     │
//!      ┌──────────────┼──────────────┐
//!      │              │              │
//!    Memory          File          JedecSpi       (raw backends)
//! ```
//!
//! Raw backends ([`backends::Memory`], [`backends::File`], [`backends::JedecSpi`]) own a real
//! byte store. [`Partition`] restricts an underlying backend to a sector window. [`Mirror`] adds
//! power-fail atomicity via a redundant two-copy layer. [`Fee`] turns a sector-erasable backend
//! into a byte-granular, wear-levelled virtual address space with compacting garbage collection.
//!
//! Backends compose by generic parameter rather than dynamic dispatch — a stack's shape is known
//! at build time, so e.g. `Fee<Mirror<Partition<JedecSpi<SPI, DELAY>>>, 8>` is a concrete,
//! monomorphized type with no vtable.
//!
//! This is a library for embedded storage, not a filesystem: there are no directories or names,
//! only a flat virtual address space per backend.

mod error;
pub mod nvm;

pub mod backends;
pub mod external_impls;
pub mod fee;
pub mod mirror;
pub mod partition;

#[cfg(feature = "std")]
pub mod testing;

pub use error::{NvmError, NvmState};
pub use fee::Fee;
pub use mirror::Mirror;
pub use nvm::{Nvm, NvmInfo};
pub use partition::Partition;
