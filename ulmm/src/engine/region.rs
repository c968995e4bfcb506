use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::{os::fd::OwnedFd, thread::JoinHandle};

use spin::Mutex;
use ulmm_hal::mem::{PageSize, VirtAddr};

use crate::{Result, engine::FaultChannel, pool::PoolPage};

/// File content behind a file-backed region.
pub struct FileBacking {
    pub fd: OwnedFd,
    pub offset: u64,
}

/// One live mapping: the reserved range, its fault channel and the pool
/// pages installed into it so far.
pub struct Region<C> {
    base: VirtAddr,
    len: usize,
    page_size: PageSize,
    backing: Option<FileBacking>,
    channel: C,
    faults: AtomicUsize,
    stopped: AtomicBool,
    handler: Mutex<Option<JoinHandle<()>>>,
    pages: Mutex<Vec<Option<PoolPage>>>,
}

impl<C> Region<C> {
    pub fn new(
        base: VirtAddr,
        len: usize,
        page_size: PageSize,
        backing: Option<FileBacking>,
        channel: C,
    ) -> Self {
        Self {
            base,
            len,
            page_size,
            backing,
            channel,
            faults: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            handler: Mutex::new(None),
            pages: Mutex::new((0..len / page_size.bytes()).map(|_| None).collect()),
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> VirtAddr {
        self.base + self.len
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        (self.base..self.end()).contains(&addr)
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Index of the page holding `addr`, relative to the region base.
    pub fn page_index(&self, addr: VirtAddr) -> usize {
        (addr - self.base) / self.page_size.bytes()
    }

    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Number of faults resolved so far.
    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Acquire)
    }

    /// Count a new fault and return its 1-based ordinal.
    pub(super) fn record_fault(&self) -> usize {
        self.faults.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.lock().iter().filter(|page| page.is_some()).count()
    }

    /// Remember `page` as installed at `index`, handing back the page it replaces.
    pub(super) fn install_page(&self, index: usize, page: PoolPage) -> Option<PoolPage> {
        self.pages.lock()[index].replace(page)
    }

    pub(super) fn take_pages(&self) -> Vec<PoolPage> {
        self.pages.lock().iter_mut().filter_map(Option::take).collect()
    }

    pub(super) fn set_handler(&self, handle: JoinHandle<()>) {
        *self.handler.lock() = Some(handle);
    }

    /// True once the handler thread has been joined.
    pub fn handler_joined(&self) -> bool {
        self.handler.lock().is_none()
    }
}

impl<C> fmt::Debug for Region<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .field("file_backed", &self.backing.is_some())
            .field("faults", &self.fault_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl<C: FaultChannel> Region<C> {
    /// Ask the handler to exit. Idempotent.
    pub(super) fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.channel.stop()
    }

    pub(super) fn join(&self) {
        let handle = self.handler.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("fault handler for {:#x} panicked", self.base);
            }
        }
    }
}
