use nix::unistd::{SysconfVar, sysconf};

pub use page_table::*;
pub use phys::*;
pub use shm::*;

mod page_table;
mod phys;
mod shm;

pub const PAGE_SIZE: usize = PageSize::Size4K as usize;

/// Base page size of the host, falling back to 4K when sysconf has no answer.
pub fn host_page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => PAGE_SIZE,
    }
}

/// Installed physical memory in bytes, when the host reports it.
pub fn physical_memory() -> Option<usize> {
    match sysconf(SysconfVar::_PHYS_PAGES) {
        Ok(Some(pages)) if pages > 0 => (pages as usize).checked_mul(host_page_size()),
        _ => None,
    }
}
