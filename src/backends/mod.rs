//! Raw backends: the bottom of the stack, each owning a real byte store.

mod jedec_spi;
mod memory;

pub use jedec_spi::{Identification, JedecCommands, JedecConfig, JedecSpi};
pub use memory::Memory;

#[cfg(feature = "std")]
mod file;
#[cfg(feature = "std")]
pub use file::File;
