use std::{collections::BTreeMap, sync::Arc};

use errors::{Errno, Result};
use spin::RwLock;

use crate::mem::{PageTableEditor, Pfn, PhysMem, PteFlags, VirtAddr};

/// Page-table editor over a [`PhysMem`] arena.
///
/// Installing a frame remaps that frame of the arena at the faulting page,
/// which is what a direct entry rewrite amounts to from user space. Entries
/// installed this way are tracked so they can be read back.
pub struct ShmPageTable {
    memory: Arc<PhysMem>,
    mapped: RwLock<BTreeMap<VirtAddr, Pfn>>,
}

impl ShmPageTable {
    pub fn new(memory: Arc<PhysMem>) -> Self {
        Self {
            memory,
            mapped: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn memory(&self) -> &Arc<PhysMem> {
        &self.memory
    }

    pub fn installed(&self) -> usize {
        self.mapped.read().len()
    }
}

impl PageTableEditor for ShmPageTable {
    fn read_frame(&self, vaddr: VirtAddr) -> Result<Pfn> {
        if let Some(pfn) = self.memory.pfn_of(vaddr) {
            return Ok(pfn);
        }
        let page = self.memory.page_size().align_down(vaddr);
        self.mapped
            .read()
            .get(&page)
            .copied()
            .ok_or_else(|| Errno::NotFound.with_message(format!("no frame behind {:#x}", vaddr)))
    }

    fn install_frame(&self, vaddr: VirtAddr, pfn: Pfn, flags: PteFlags) -> Result<()> {
        if !flags.contains(PteFlags::PRESENT) {
            return Err(Errno::InvArg.with_message("installing a non-present entry"));
        }
        let page = self.memory.page_size().align_down(vaddr);
        log::debug!("install frame {} at {:#x} ({:?})", pfn.index(), page, flags);

        unsafe { self.memory.map_frame(page, pfn, flags.into())? };
        self.mapped.write().insert(page, pfn);
        Ok(())
    }

    fn clear_range(&self, vaddr: VirtAddr, len: usize) {
        let mut mapped = self.mapped.write();
        let doomed: Vec<VirtAddr> = mapped.range(vaddr..vaddr + len).map(|(&page, _)| page).collect();
        for page in doomed {
            mapped.remove(&page);
        }
    }
}
