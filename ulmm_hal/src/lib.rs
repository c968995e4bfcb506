//! Host layer for user-level memory mapping: page geometry, the page-table
//! capability, the shared physical-memory arena and thin wrappers over the
//! host's virtual-memory primitives.

pub mod mem;
pub mod vm;

pub use errors::{Errno, Error, Result};
