use std::{collections::BTreeMap, sync::Arc};

use spin::Mutex;
use ulmm_hal::mem::VirtAddr;

use crate::{Errno, Result, engine::Region};

/// Table of live regions keyed by base address.
///
/// Starts empty. Every region must be removed (and its handler joined)
/// before the registry is dropped, otherwise the handler threads leak.
pub struct Registry<C> {
    regions: Mutex<BTreeMap<VirtAddr, Arc<Region<C>>>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Registry<C> {
    pub const fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, region: Arc<Region<C>>) -> Result<()> {
        let mut regions = self.regions.lock();
        if regions.contains_key(&region.base()) {
            return Err(Errno::AlreadyExists
                .with_message(format!("region at {:#x} already registered", region.base())));
        }
        regions.insert(region.base(), region);
        Ok(())
    }

    /// Region whose base is exactly `base`.
    pub fn get(&self, base: VirtAddr) -> Option<Arc<Region<C>>> {
        self.regions.lock().get(&base).cloned()
    }

    /// Region containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<Arc<Region<C>>> {
        self.regions
            .lock()
            .range(..=addr)
            .next_back()
            .filter(|(_, region)| region.contains(addr))
            .map(|(_, region)| region.clone())
    }

    pub fn remove(&self, base: VirtAddr) -> Option<Arc<Region<C>>> {
        self.regions.lock().remove(&base)
    }

    /// Remove the region mapped at exactly `base` with exactly `len` bytes.
    pub fn take(&self, base: VirtAddr, len: usize) -> Result<Arc<Region<C>>> {
        let mut regions = self.regions.lock();
        let Some(region) = regions.get(&base) else {
            return Err(Errno::NotFound.with_message(format!("no region at {:#x}", base)));
        };
        if region.len() != len {
            return Err(Errno::InvArg.with_message(format!(
                "region at {:#x} spans {:#x} bytes, not {:#x}",
                base,
                region.len(),
                len
            )));
        }
        regions
            .remove(&base)
            .ok_or_else(|| Errno::NotFound.no_message())
    }

    pub fn drain(&self) -> Vec<Arc<Region<C>>> {
        core::mem::take(&mut *self.regions.lock())
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }
}
