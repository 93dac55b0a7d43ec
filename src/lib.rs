// CFS kernel: process table, fair scheduler and demand-paged mappings
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod console;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod param;
pub mod process;
pub mod syscalls;
pub mod trap;

pub use kernel::{init, kernel, Kernel};

#[cfg(test)]
mod testing;
