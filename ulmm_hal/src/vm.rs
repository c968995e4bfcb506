//! Pass-through wrappers over the host's virtual-memory primitives.

use std::{
    ffi::c_void,
    num::NonZeroUsize,
    os::fd::AsFd,
    ptr::NonNull,
};

use bitflags::bitflags;
use errors::{Errno, Result};
use nix::sys::mman::{
    MapFlags, ProtFlags, madvise, mmap, mmap_anonymous, mprotect, msync, munmap,
};

pub use nix::sys::mman::{MmapAdvise, MsFlags};

use crate::mem::VirtAddr;

bitflags! {
    /// Access protection requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl From<Protection> for ProtFlags {
    fn from(value: Protection) -> Self {
        let mut flags = Self::empty();
        if value.contains(Protection::READ) {
            flags |= Self::PROT_READ;
        }
        if value.contains(Protection::WRITE) {
            flags |= Self::PROT_WRITE;
        }
        flags
    }
}

fn non_null(addr: VirtAddr) -> Result<NonNull<c_void>> {
    NonNull::new(addr as *mut c_void).ok_or_else(|| Errno::InvArg.with_message("null address"))
}

fn non_zero(len: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(len).ok_or_else(|| Errno::InvArg.with_message("zero length"))
}

/// Reserve a private anonymous range. `hint` is advisory only.
pub fn reserve_anonymous(hint: Option<VirtAddr>, len: usize, prot: Protection) -> Result<VirtAddr> {
    let ptr = unsafe {
        mmap_anonymous(
            hint.and_then(NonZeroUsize::new),
            non_zero(len)?,
            prot.into(),
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    }
    .map_err(|err| Errno::MapFailed.with_message(format!("mmap: {err}")))?;
    Ok(ptr.as_ptr() as VirtAddr)
}

/// Map `len` bytes of `fd` at `offset` shared, at an address chosen by the host.
pub fn map_shared<F: AsFd>(fd: F, len: usize, offset: u64, prot: Protection) -> Result<VirtAddr> {
    let ptr = unsafe {
        mmap(
            None,
            non_zero(len)?,
            prot.into(),
            MapFlags::MAP_SHARED,
            fd,
            offset as _,
        )
    }
    .map_err(|err| Errno::MapFailed.with_message(format!("mmap shared: {err}")))?;
    Ok(ptr.as_ptr() as VirtAddr)
}

/// # Safety
/// Nothing may reference `[addr, addr + len)` afterwards.
pub unsafe fn release(addr: VirtAddr, len: usize) -> Result<()> {
    unsafe { munmap(non_null(addr)?, len) }
        .map_err(|err| Errno::MapFailed.with_message(format!("munmap {:#x}: {}", addr, err)))
}

pub fn sync_to_backing_store(addr: VirtAddr, len: usize, flags: MsFlags) -> Result<()> {
    unsafe { msync(non_null(addr)?, len, flags) }
        .map_err(|err| Errno::Io.with_message(format!("msync {:#x}: {}", addr, err)))
}

pub fn change_protection(addr: VirtAddr, len: usize, prot: Protection) -> Result<()> {
    unsafe { mprotect(non_null(addr)?, len, prot.into()) }
        .map_err(|err| Errno::InvArg.with_message(format!("mprotect {:#x}: {}", addr, err)))
}

pub fn advise_access_pattern(addr: VirtAddr, len: usize, advice: MmapAdvise) -> Result<()> {
    unsafe { madvise(non_null(addr)?, len, advice) }
        .map_err(|err| Errno::InvArg.with_message(format!("madvise {:#x}: {}", addr, err)))
}

/// Read one byte at `addr`, forcing a fault if the page is not resident.
///
/// # Safety
/// `addr` must lie inside a live mapping.
pub unsafe fn touch_page(addr: VirtAddr) -> u8 {
    unsafe { core::ptr::read_volatile(addr as *const u8) }
}
