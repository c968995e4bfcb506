//! Buffer-fix protocol: short-term exclusive access to resident pages,
//! arbitrated by one [`StateWord`] per page.

use core::{hint, mem::size_of, ptr::NonNull};

use crate::{
    Errno, Result,
    page_state::{PageState, StateWord},
};

/// Where the state words live relative to the data pages.
pub trait StateLayout: Send + Sync {
    fn page_count(&self) -> usize;

    /// Usable bytes behind the pointer returned by `fix`.
    fn data_len(&self) -> usize;

    fn word(&self, pid: usize) -> &StateWord;

    fn data(&self, pid: usize) -> NonNull<u8>;
}

/// State words in a separate array parallel to the data pages.
pub struct SideTable {
    states: Box<[StateWord]>,
    base: NonNull<u8>,
    page_size: usize,
}

unsafe impl Send for SideTable {}
unsafe impl Sync for SideTable {}

impl SideTable {
    /// # Safety
    /// `base` must point to `pages * page_size` bytes that outlive the table.
    pub unsafe fn new(base: NonNull<u8>, pages: usize, page_size: usize) -> Self {
        Self {
            states: (0..pages)
                .map(|_| StateWord::new(PageState::unlocked()))
                .collect(),
            base,
            page_size,
        }
    }
}

impl StateLayout for SideTable {
    fn page_count(&self) -> usize {
        self.states.len()
    }

    fn data_len(&self) -> usize {
        self.page_size
    }

    fn word(&self, pid: usize) -> &StateWord {
        &self.states[pid]
    }

    fn data(&self, pid: usize) -> NonNull<u8> {
        unsafe { self.base.add(pid * self.page_size) }
    }
}

/// State word stored in the first eight bytes of each page.
pub struct Embedded {
    base: NonNull<u8>,
    pages: usize,
    page_size: usize,
}

unsafe impl Send for Embedded {}
unsafe impl Sync for Embedded {}

impl Embedded {
    const HEADER: usize = size_of::<u64>();

    /// Resets every page header to unlocked.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned and point to `pages * page_size` bytes
    /// that outlive the table; page headers must only be accessed through it.
    pub unsafe fn new(base: NonNull<u8>, pages: usize, page_size: usize) -> Self {
        assert!(page_size > Self::HEADER && page_size % Self::HEADER == 0);
        let layout = Self {
            base,
            pages,
            page_size,
        };
        for pid in 0..pages {
            let header = layout.header(pid);
            unsafe { header.write_volatile(PageState::unlocked().bits()) };
        }
        layout
    }

    fn header(&self, pid: usize) -> *mut u64 {
        unsafe { self.base.add(pid * self.page_size).cast::<u64>().as_ptr() }
    }
}

impl StateLayout for Embedded {
    fn page_count(&self) -> usize {
        self.pages
    }

    fn data_len(&self) -> usize {
        self.page_size - Self::HEADER
    }

    fn word(&self, pid: usize) -> &StateWord {
        assert!(pid < self.pages);
        unsafe { StateWord::from_ptr(self.header(pid)) }
    }

    fn data(&self, pid: usize) -> NonNull<u8> {
        unsafe { self.base.add(pid * self.page_size + Self::HEADER) }
    }
}

/// Logical page table guarded by per-page state words.
pub struct BufferTable<L> {
    layout: L,
}

impl<L: StateLayout> BufferTable<L> {
    pub fn new(layout: L) -> Self {
        Self { layout }
    }

    pub fn page_count(&self) -> usize {
        self.layout.page_count()
    }

    pub fn data_len(&self) -> usize {
        self.layout.data_len()
    }

    fn word(&self, pid: usize) -> Result<&StateWord> {
        if pid >= self.layout.page_count() {
            return Err(Errno::InvArg.with_message(format!(
                "page {} out of range (0..{})",
                pid,
                self.layout.page_count()
            )));
        }
        Ok(self.layout.word(pid))
    }

    pub fn state(&self, pid: usize) -> Result<PageState> {
        Ok(self.word(pid)?.load())
    }

    /// Lock page `pid`, spinning while someone else holds it.
    pub fn fix(&self, pid: usize) -> Result<NonNull<u8>> {
        let word = self.word(pid)?;
        loop {
            let state = word.load();
            if state.is_evicted() {
                // Nothing produces evicted pages yet, so there is no fetch path.
                unreachable!("page {pid} is evicted");
            }
            if state.is_unlocked() && word.try_lock(state) {
                return Ok(self.layout.data(pid));
            }
            hint::spin_loop();
        }
    }

    /// Like [`fix`](Self::fix) but gives up as soon as the page is seen locked.
    pub fn try_fix(&self, pid: usize) -> Result<Option<NonNull<u8>>> {
        let word = self.word(pid)?;
        loop {
            let state = word.load();
            if state.is_evicted() {
                unreachable!("page {pid} is evicted");
            }
            if state.is_locked() {
                return Ok(None);
            }
            if word.try_lock(state) {
                return Ok(Some(self.layout.data(pid)));
            }
        }
    }

    /// Release a page fixed by the caller. The mark survives.
    pub fn unfix(&self, pid: usize) -> Result<()> {
        self.word(pid)?.unlock();
        Ok(())
    }

    /// Flag an unlocked page as an eviction candidate.
    pub fn mark(&self, pid: usize) -> Result<bool> {
        Ok(self.word(pid)?.mark())
    }

    pub fn fix_guard(&self, pid: usize) -> Result<FixGuard<'_, L>> {
        let data = self.fix(pid)?;
        Ok(FixGuard {
            table: self,
            pid,
            data,
        })
    }
}

/// A fixed page, unfixed on drop.
pub struct FixGuard<'a, L: StateLayout> {
    table: &'a BufferTable<L>,
    pid: usize,
    data: NonNull<u8>,
}

impl<L: StateLayout> FixGuard<'_, L> {
    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.data
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.table.data_len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.table.data_len()) }
    }
}

impl<L: StateLayout> Drop for FixGuard<'_, L> {
    fn drop(&mut self) {
        self.table.layout.word(self.pid).unlock();
    }
}
