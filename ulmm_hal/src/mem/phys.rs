use std::{
    ffi::c_void,
    num::NonZeroUsize,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
};

use errors::{Errno, Result};
use nix::{
    fcntl::{FallocateFlags, fallocate},
    sys::{
        memfd::{MemFdCreateFlag, memfd_create},
        mman::{MapFlags, ProtFlags, mmap, munmap},
    },
    unistd,
};

use crate::mem::{PageSize, Pfn, VirtAddr, physical_memory};

/// User-space stand-in for physical memory.
///
/// A memfd of `frames * page_size` bytes, mapped once into the process so
/// every frame has a direct-map address. Mapping a frame somewhere else with
/// [`PhysMem::map_frame`] aliases the same page-cache page, so content written
/// through the direct map shows up at the new address without a copy.
///
/// Every frame is committed at construction; an arena the host cannot back
/// fails here with `OutOfMemory` instead of faulting later.
pub struct PhysMem {
    fd: OwnedFd,
    base: NonNull<u8>,
    frames: usize,
    page_size: PageSize,
}

// The direct map is only reachable through `&self` accessors that hand out
// raw pointers; exclusive use of a frame is arbitrated by the owner (the pool).
unsafe impl Send for PhysMem {}
unsafe impl Sync for PhysMem {}

impl PhysMem {
    pub fn new(frames: usize, page_size: PageSize) -> Result<Self> {
        let size = frames
            .checked_mul(page_size.bytes())
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| {
                Errno::InvArg.with_message(format!("bad arena geometry: {frames} frames"))
            })?;
        if let Some(physical) = physical_memory() {
            if size.get() > physical {
                return Err(Errno::OutOfMemory.with_message(format!(
                    "arena of {:#x} bytes exceeds {:#x} bytes of physical memory",
                    size.get(),
                    physical
                )));
            }
        }

        let fd = memfd_create(c"ulmm-physmem", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|err| Errno::OutOfMemory.with_message(format!("memfd_create: {err}")))?;
        unistd::ftruncate(&fd, size.get() as _)
            .map_err(|err| Errno::OutOfMemory.with_message(format!("ftruncate: {err}")))?;
        fallocate(fd.as_raw_fd(), FallocateFlags::empty(), 0, size.get() as _).map_err(|err| {
            Errno::OutOfMemory.with_message(format!("fallocate {:#x} bytes: {}", size.get(), err))
        })?;

        let base = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|err| Errno::MapFailed.with_message(format!("mmap physical memory: {err}")))?;

        log::debug!(
            "physical memory: {} frames of {:#x} at {:#x}",
            frames,
            page_size.bytes(),
            base.as_ptr() as usize
        );

        Ok(Self {
            fd,
            base: base.cast(),
            frames,
            page_size,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn len(&self) -> usize {
        self.frames * self.page_size.bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Start of the direct map.
    pub fn base(&self) -> VirtAddr {
        self.base.as_ptr() as VirtAddr
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        (self.base()..self.base() + self.len()).contains(&vaddr)
    }

    /// Frame behind a direct-map address.
    pub fn pfn_of(&self, vaddr: VirtAddr) -> Option<Pfn> {
        self.contains(vaddr)
            .then(|| Pfn((vaddr - self.base()) / self.page_size.bytes()))
    }

    pub fn frame_ptr(&self, pfn: Pfn) -> Result<NonNull<u8>> {
        if pfn.index() >= self.frames {
            return Err(Errno::InvArg.with_message(format!("frame {} out of range", pfn.index())));
        }
        Ok(unsafe { self.base.add(pfn.index() * self.page_size.bytes()) })
    }

    /// # Safety
    /// No one may write the frame while the returned slice is alive.
    pub unsafe fn frame(&self, pfn: Pfn) -> Result<&[u8]> {
        let ptr = self.frame_ptr(pfn)?;
        Ok(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.page_size.bytes()) })
    }

    /// # Safety
    /// The caller must have exclusive use of the frame for the slice's lifetime.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, pfn: Pfn) -> Result<&mut [u8]> {
        let ptr = self.frame_ptr(pfn)?;
        Ok(unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), self.page_size.bytes()) })
    }

    /// Map frame `pfn` at `vaddr`, replacing whatever was mapped there.
    ///
    /// # Safety
    /// `vaddr` must be page aligned and must not be referenced by live Rust
    /// borrows; the previous mapping of that page is discarded.
    pub unsafe fn map_frame(&self, vaddr: VirtAddr, pfn: Pfn, prot: ProtFlags) -> Result<()> {
        if !self.page_size.is_aligned(vaddr) || pfn.index() >= self.frames {
            return Err(Errno::InvArg.with_message(format!(
                "cannot map frame {} at {:#x}",
                pfn.index(),
                vaddr
            )));
        }

        let addr = NonZeroUsize::new(vaddr)
            .ok_or_else(|| Errno::InvArg.with_message("mapping at zero address"))?;
        let len = NonZeroUsize::new(self.page_size.bytes())
            .ok_or_else(|| Errno::InvArg.with_message("mapping for length 0"))?;
        let offset = (pfn.index() * self.page_size.bytes()) as _;

        unsafe {
            mmap(
                Some(addr),
                len,
                prot,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                &self.fd,
                offset,
            )
        }
        .map_err(|err| {
            Errno::MapFailed.with_message(format!(
                "map frame {} at {:#x}: {}",
                pfn.index(),
                vaddr,
                err
            ))
        })?;
        Ok(())
    }
}

impl Drop for PhysMem {
    fn drop(&mut self) {
        let len = self.len();
        if let Err(err) = unsafe { munmap(self.base.cast::<c_void>(), len) } {
            log::error!("Failed to unmap physical memory at {:#x}: {}", self.base(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_translation() {
        let mem = PhysMem::new(4, PageSize::Size4K).unwrap();
        assert_eq!(mem.len(), 4 * 0x1000);

        let second = mem.base() + 0x1000;
        assert_eq!(mem.pfn_of(second + 0x10), Some(Pfn(1)));
        assert_eq!(mem.pfn_of(mem.base() + mem.len()), None);
        assert_eq!(mem.frame_ptr(Pfn(1)).unwrap().as_ptr() as usize, second);
        assert!(mem.frame_ptr(Pfn(4)).is_err());
    }

    #[test]
    fn remapped_frame_aliases_direct_map() {
        let mem = PhysMem::new(2, PageSize::Size4K).unwrap();
        unsafe { mem.frame_mut(Pfn(1)).unwrap().fill(0x5a) };

        let scratch = PhysMem::new(1, PageSize::Size4K).unwrap();
        let target = scratch.base();
        unsafe {
            mem.map_frame(target, Pfn(1), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
                .unwrap();
            assert_eq!(*(target as *const u8), 0x5a);

            *(target as *mut u8).add(7) = 0x11;
            assert_eq!(mem.frame(Pfn(1)).unwrap()[7], 0x11);
        }
    }

    #[test]
    fn rejects_arena_beyond_physical_memory() {
        let Some(physical) = physical_memory() else { return };
        let frames = physical / PageSize::Size4K.bytes() * 2;
        assert_eq!(
            PhysMem::new(frames, PageSize::Size4K).err().map(|err| err.errno()),
            Some(Errno::OutOfMemory)
        );
    }

    #[test]
    fn rejects_empty_arena() {
        assert_eq!(
            PhysMem::new(0, PageSize::Size4K).err().map(|err| err.errno()),
            Some(Errno::InvArg)
        );
    }
}
