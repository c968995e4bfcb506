//! The fault-resolution engine.
//!
//! [`Engine::map`] reserves a range, delegates its missing-page faults to a
//! [`FaultChannel`] and starts one handler thread per region. Each fault is
//! resolved by taking a page from the pool, filling it, and installing its
//! frame at the faulting address through a [`PageTableEditor`].

use std::{
    os::fd::{BorrowedFd, OwnedFd},
    sync::Arc,
};

use bitflags::bitflags;
use ulmm_hal::{
    mem::{PageTableEditor, ShmPageTable, VirtAddr, host_page_size},
    vm::Protection,
};

use crate::{
    Errno, Result, fatal,
    pool::{PagePool, PoolOptions},
    registry::Registry,
};

pub use handler::anonymous_fill;
pub use region::{FileBacking, Region};
pub use uffd::{UffdChannel, UffdDelegation};

mod handler;
mod region;
mod uffd;

#[cfg(test)]
pub(crate) mod fake;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapKind: u32 {
        const PRIVATE = 1 << 0;
        const SHARED = 1 << 1;
        const ANONYMOUS = 1 << 2;
        const FILE = 1 << 3;
    }
}

/// Caller-side description of a file backing: the descriptor is duplicated
/// on map, so it only has to stay open for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct Backing<'a> {
    fd: BorrowedFd<'a>,
    offset: u64,
}

impl<'a> Backing<'a> {
    pub fn new(fd: BorrowedFd<'a>, offset: u64) -> Self {
        Self { fd, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEvent {
    /// A thread touched a page with nothing behind it and sleeps until woken.
    MissingPage { addr: VirtAddr },
    /// Anything else the host reported; fatal to the handler.
    Unexpected(String),
}

/// Per-region source of fault events.
pub trait FaultChannel: Send + Sync + 'static {
    /// Block for the next event. `None` once [`stop`](Self::stop) was called.
    fn wait(&self) -> Result<Option<FaultEvent>>;

    /// Resume the threads suspended on `[page, page + len)`.
    fn wake(&self, page: VirtAddr, len: usize) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn unregister(&self, base: VirtAddr, len: usize) -> Result<()>;
}

/// The host side of fault delegation: address-space reservation and
/// registration of reserved ranges.
pub trait FaultDelegation: Send + Sync + 'static {
    type Channel: FaultChannel;

    fn reserve(&self, hint: Option<VirtAddr>, len: usize, prot: Protection) -> Result<VirtAddr>;

    fn register(&self, base: VirtAddr, len: usize) -> Result<Self::Channel>;

    fn release(&self, base: VirtAddr, len: usize) -> Result<()>;
}

#[derive(Default)]
pub struct EngineOptions {
    pool: PoolOptions,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }
}

pub struct Engine<D: FaultDelegation, E: PageTableEditor + 'static> {
    delegation: D,
    editor: Arc<E>,
    pool: Arc<PagePool>,
    regions: Registry<D::Channel>,
}

impl Engine<UffdDelegation, ShmPageTable> {
    /// An engine backed by userfaultfd, resolving faults with frames of a
    /// freshly built pool.
    pub fn new_host(options: EngineOptions) -> Result<Self> {
        let pool = Arc::new(options.pool.build()?);
        if pool.page_size().bytes() != host_page_size() {
            return Err(Errno::NotSupported.with_message(format!(
                "pool pages of {:#x} bytes on a host with {:#x} byte pages",
                pool.page_size().bytes(),
                host_page_size()
            )));
        }
        let editor = Arc::new(ShmPageTable::new(pool.memory().clone()));
        Ok(Self::new(UffdDelegation, editor, pool))
    }
}

impl<D: FaultDelegation, E: PageTableEditor + 'static> Engine<D, E> {
    pub fn new(delegation: D, editor: Arc<E>, pool: Arc<PagePool>) -> Self {
        Self {
            delegation,
            editor,
            pool,
            regions: Registry::new(),
        }
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn editor(&self) -> &Arc<E> {
        &self.editor
    }

    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn lookup(&self, base: VirtAddr) -> Option<Arc<Region<D::Channel>>> {
        self.regions.get(base)
    }

    /// Faults resolved so far in the region containing `addr`.
    pub fn fault_count(&self, addr: VirtAddr) -> Option<usize> {
        self.regions.find(addr).map(|region| region.fault_count())
    }

    pub fn map(
        &self,
        hint: Option<VirtAddr>,
        len: usize,
        prot: Protection,
        kind: MapKind,
        backing: Option<Backing>,
    ) -> VirtAddr {
        self.try_map(hint, len, prot, kind, backing)
            .unwrap_or_else(|err| fatal("map", err))
    }

    /// Reserve `len` bytes (rounded up to whole pages) whose pages are
    /// supplied on first touch. Nothing stays reserved on error.
    pub fn try_map(
        &self,
        hint: Option<VirtAddr>,
        len: usize,
        prot: Protection,
        kind: MapKind,
        backing: Option<Backing>,
    ) -> Result<VirtAddr> {
        let page_size = self.pool.page_size();
        if len == 0 {
            return Err(Errno::InvArg.with_message("map of zero bytes"));
        }
        if kind.contains(MapKind::PRIVATE) == kind.contains(MapKind::SHARED) {
            return Err(Errno::InvArg.with_message(format!(
                "{:?} must be exactly one of private or shared",
                kind
            )));
        }
        if kind.contains(MapKind::ANONYMOUS) == kind.contains(MapKind::FILE) {
            return Err(Errno::InvArg.with_message(format!(
                "{:?} must be exactly one of anonymous or file-backed",
                kind
            )));
        }
        if kind.contains(MapKind::FILE) != backing.is_some() {
            return Err(Errno::InvArg.with_message("file mappings need a backing, and only they"));
        }
        let len = page_size.align_up(len);

        let backing = match backing {
            Some(Backing { fd, offset }) => {
                if !page_size.is_aligned(offset as usize) {
                    return Err(Errno::InvArg
                        .with_message(format!("backing offset {:#x} not page aligned", offset)));
                }
                let fd: OwnedFd = fd.try_clone_to_owned()?;
                Some(FileBacking { fd, offset })
            }
            None => None,
        };

        let base = self.delegation.reserve(hint, len, prot)?;
        let channel = match self.delegation.register(base, len) {
            Ok(channel) => channel,
            Err(err) => {
                self.release_quietly(base, len);
                return Err(err);
            }
        };

        let region = Arc::new(Region::new(base, len, page_size, backing, channel));
        match handler::spawn(region.clone(), self.pool.clone(), self.editor.clone()) {
            Ok(handle) => region.set_handler(handle),
            Err(err) => {
                if let Err(err) = region.channel().unregister(base, len) {
                    log::warn!("unregister {:#x} after failed spawn: {}", base, err);
                }
                self.release_quietly(base, len);
                return Err(err);
            }
        }

        if let Err(err) = self.regions.insert(region.clone()) {
            self.teardown(&region);
            return Err(err);
        }

        log::debug!(
            "mapped {:#x}..{:#x} {:?} {:?}",
            base,
            base + len,
            kind,
            prot
        );
        Ok(base)
    }

    /// Tear down the region mapped at `base`. `len` must match what was mapped.
    pub fn unmap(&self, base: VirtAddr, len: usize) -> Result<()> {
        let len = self.pool.page_size().align_up(len);
        let region = self.regions.take(base, len).inspect_err(|err| {
            log::warn!("unmap {:#x}: {}", base, err);
        })?;
        self.teardown(&region);
        log::debug!(
            "unmapped {:#x}..{:#x} after {} faults",
            base,
            base + len,
            region.fault_count()
        );
        Ok(())
    }

    /// Stop faults, join the handler, drop the range and recycle its pages.
    fn teardown(&self, region: &Region<D::Channel>) {
        let (base, len) = (region.base(), region.len());
        if let Err(err) = region.channel().unregister(base, len) {
            log::warn!("unregister {:#x}: {}", base, err);
        }
        if let Err(err) = region.stop() {
            log::warn!("stop handler of {:#x}: {}", base, err);
        }
        region.join();
        self.release_quietly(base, len);
        self.editor.clear_range(base, len);
        for page in region.take_pages() {
            self.pool.deallocate(page);
        }
    }

    fn release_quietly(&self, base: VirtAddr, len: usize) {
        if let Err(err) = self.delegation.release(base, len) {
            log::warn!("release {:#x}: {}", base, err);
        }
    }
}

impl<D: FaultDelegation, E: PageTableEditor + 'static> Drop for Engine<D, E> {
    fn drop(&mut self) {
        let leftover = self.regions.drain();
        if !leftover.is_empty() {
            log::warn!("engine dropped with {} live regions", leftover.len());
        }
        for region in leftover {
            self.teardown(&region);
        }
    }
}
