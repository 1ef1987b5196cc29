//! Plans a kexec boot: reads the physical memory map, places a kernel, its
//! initrd, boot parameters and a purgatory into free memory, and hands the
//! resulting segments to `kexec_load`.

pub mod boot;
pub mod bzimage;
pub mod config;
pub mod error;
pub mod fdt;
pub mod fs;
pub mod kexec;
pub mod loader;
pub mod logger;
pub mod memmap;
pub mod memory;
pub mod object;
pub mod plan9;
pub mod purgatory;
pub mod range;
pub mod reloc;
pub mod segment;
pub mod sys;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
