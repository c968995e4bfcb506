use bitflags::bitflags;
use nix::sys::mman::ProtFlags;

use errors::Result;

pub type VirtAddr = usize;

/// Page Size
/// Interfaces to support huge page.
#[repr(usize)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageSize {
    #[default]
    Size4K = 0x1000,
    Size2M = 0x20_0000,
    Size1G = 0x4000_0000,
}

impl TryFrom<usize> for PageSize {
    type Error = ();
    fn try_from(value: usize) -> core::result::Result<Self, Self::Error> {
        match value {
            0x1000 => Ok(Self::Size4K),
            0x20_0000 => Ok(Self::Size2M),
            0x4000_0000 => Ok(Self::Size1G),
            _ => Err(()),
        }
    }
}

impl PageSize {
    pub const fn bytes(self) -> usize {
        self as usize
    }

    pub const fn is_aligned(self, addr: usize) -> bool {
        self.page_offset(addr) == 0
    }

    pub const fn align_down(self, addr: usize) -> usize {
        addr & !(self as usize - 1)
    }

    pub const fn align_up(self, addr: usize) -> usize {
        self.align_down(addr + self as usize - 1)
    }

    pub const fn page_offset(self, addr: usize) -> usize {
        addr & (self as usize - 1)
    }

    pub const fn is_huge(self) -> bool {
        matches!(self, Self::Size1G | Self::Size2M)
    }
}

/// Physical frame number: the index of a frame inside a [`PhysMem`](super::PhysMem) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(pub usize);

impl Pfn {
    pub const fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Permission bits written into a page-table entry.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl PteFlags {
    pub const fn user_data() -> Self {
        Self::from_bits_truncate(Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits())
    }
}

impl From<PteFlags> for ProtFlags {
    fn from(value: PteFlags) -> Self {
        let mut flags = Self::empty();
        if value.contains(PteFlags::PRESENT) {
            flags |= Self::PROT_READ;
        }
        if value.contains(PteFlags::WRITABLE) {
            flags |= Self::PROT_WRITE;
        }
        flags
    }
}

/// The narrow page-table capability the fault engine depends on.
///
/// Implementations rewrite the entry for one virtual page so that it
/// references a given frame; the engine never touches page tables otherwise.
pub trait PageTableEditor: Sync + Send {
    /// Physical frame currently backing `vaddr`.
    fn read_frame(&self, vaddr: VirtAddr) -> Result<Pfn>;

    /// Point the entry of the page containing `vaddr` at `pfn` with `flags`.
    fn install_frame(&self, vaddr: VirtAddr, pfn: Pfn, flags: PteFlags) -> Result<()>;

    /// Forget every entry in `[vaddr, vaddr + len)`. Called after the range is released.
    fn clear_range(&self, vaddr: VirtAddr, len: usize);
}
