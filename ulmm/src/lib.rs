//! User-level memory manager.
//!
//! Regions are reserved from the host, their missing-page faults delegated
//! to a per-region handler thread, and every fault resolved by installing a
//! frame from a sharded lock-free [`pool::PagePool`].

use core::fmt::Display;

pub use errors::{Errno, Error, Result};
pub use ulmm_hal::{mem, vm};

pub mod buffer;
pub mod engine;
pub mod page_state;
pub mod pool;
pub mod registry;

/// Report an unrecoverable error and terminate the process with status 1.
pub fn fatal(operation: &str, error: impl Display) -> ! {
    log::error!("{} failed: {}", operation, error);
    eprintln!("ulmm: {} failed: {}", operation, error);
    std::process::exit(1)
}
