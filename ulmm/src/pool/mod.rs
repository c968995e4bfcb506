use core::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};
use std::{collections::hash_map::DefaultHasher, sync::Arc, thread};

use humansize::{BINARY, format_size};
use ulmm_hal::mem::{PageSize, Pfn, PhysMem};

use crate::{Errno, Result, fatal};

use shard::Shard;

mod shard;

pub struct PoolOptions {
    shards: usize,
    pages_per_shard: usize,
    page_size: PageSize,
}

impl PoolOptions {
    /// 8 shards of 262144 4K pages, 8GiB in total.
    pub const fn new() -> Self {
        Self {
            shards: 8,
            pages_per_shard: 262144,
            page_size: PageSize::Size4K,
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolOptions {
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn pages_per_shard(mut self, pages: usize) -> Self {
        self.pages_per_shard = pages;
        self
    }

    pub fn page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }
}

impl PoolOptions {
    pub fn build(self) -> Result<PagePool> {
        PagePool::try_new(self)
    }
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// A page handed out by a [`PagePool`].
///
/// The handle is move-only: whoever holds it owns the page until it is given
/// back with [`PagePool::deallocate`].
#[must_use = "a dropped PoolPage is never returned to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct PoolPage {
    pool: usize,
    index: u32,
}

impl PoolPage {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn pfn(&self) -> Pfn {
        Pfn(self.index as usize)
    }
}

/// Sharded lock-free pool of fixed-size pages.
///
/// Every page is allocated up front inside one [`PhysMem`] arena. Page `i`
/// belongs to shard `i % shards` and always goes back there on deallocate,
/// whichever shard served it.
pub struct PagePool {
    id: usize,
    memory: Arc<PhysMem>,
    shards: Box<[Shard]>,
    links: Box<[AtomicU32]>,
}

impl PagePool {
    pub fn new(options: PoolOptions) -> Self {
        Self::try_new(options).unwrap_or_else(|err| fatal("page pool construction", err))
    }

    pub fn try_new(options: PoolOptions) -> Result<Self> {
        let PoolOptions {
            shards,
            pages_per_shard,
            page_size,
        } = options;

        let total = shards.checked_mul(pages_per_shard).unwrap_or(usize::MAX);
        if shards == 0 || pages_per_shard == 0 || total >= u32::MAX as usize {
            return Err(Errno::InvArg.with_message(format!(
                "bad pool geometry: {shards} shards x {pages_per_shard} pages"
            )));
        }

        let memory = Arc::new(PhysMem::new(total, page_size)?);
        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            memory,
            shards: (0..shards).map(|_| Shard::new()).collect(),
            links: (0..total).map(|_| AtomicU32::new(u32::MAX)).collect(),
        };

        // Reverse order so low indices sit on top of each stack.
        for index in (0..total).rev() {
            pool.shards[index % shards].push(&pool.links, index as u32);
        }
        for shard in pool.shards.iter() {
            assert_eq!(shard.remaining(), pages_per_shard);
        }

        log::debug!("page pool: {} shards, {}", shards, pool);
        Ok(pool)
    }
}

impl PagePool {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn page_size(&self) -> PageSize {
        self.memory.page_size()
    }

    pub fn total_pages(&self) -> usize {
        self.links.len()
    }

    /// Approximate while other threads allocate or deallocate.
    pub fn free_pages(&self) -> usize {
        self.shards.iter().map(Shard::remaining).sum()
    }

    pub fn shard_free_pages(&self, shard: usize) -> usize {
        self.shards[shard].remaining()
    }

    pub fn memory(&self) -> &Arc<PhysMem> {
        &self.memory
    }

    /// The shard `page` returns to.
    pub fn home_shard(&self, page: &PoolPage) -> usize {
        page.index() % self.shards.len()
    }

    /// Direct-map address of `page`.
    pub fn page_addr(&self, page: &PoolPage) -> usize {
        self.memory.base() + page.index() * self.page_size().bytes()
    }

    pub fn page_bytes<'a>(&'a self, page: &'a PoolPage) -> &'a [u8] {
        self.check_owner(page);
        unsafe {
            core::slice::from_raw_parts(self.page_addr(page) as *const u8, self.page_size().bytes())
        }
    }

    pub fn page_bytes_mut<'a>(&'a self, page: &'a mut PoolPage) -> &'a mut [u8] {
        self.check_owner(page);
        unsafe {
            core::slice::from_raw_parts_mut(self.page_addr(page) as *mut u8, self.page_size().bytes())
        }
    }

    fn check_owner(&self, page: &PoolPage) {
        assert_eq!(page.pool, self.id, "page {} belongs to another pool", page.index);
    }
}

impl PagePool {
    /// Take a page, or `None` when every shard looked empty.
    ///
    /// `None` is transient: pages come back as other owners deallocate.
    pub fn allocate(&self) -> Option<PoolPage> {
        let mut shard = self.thread_shard();
        loop {
            if let Some(index) = self.shards[shard].pop(&self.links) {
                return Some(PoolPage {
                    pool: self.id,
                    index,
                });
            }
            shard = self.richest_shard()?;
        }
    }

    pub fn deallocate(&self, page: PoolPage) {
        self.check_owner(&page);
        let home = self.home_shard(&page);
        self.shards[home].push(&self.links, page.index);
    }

    fn thread_shard(&self) -> usize {
        thread_local! {
            static THREAD_HASH: u64 = {
                let mut hasher = DefaultHasher::new();
                thread::current().id().hash(&mut hasher);
                hasher.finish()
            };
        }
        THREAD_HASH.with(|hash| (*hash % self.shards.len() as u64) as usize)
    }

    /// Unlocked scan; the answer may be stale by the time it is used.
    fn richest_shard(&self) -> Option<usize> {
        self.shards
            .iter()
            .enumerate()
            .map(|(index, shard)| (index, shard.remaining()))
            .filter(|&(_, remaining)| remaining > 0)
            .max_by_key(|&(_, remaining)| remaining)
            .map(|(index, _)| index)
    }
}

impl Display for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let page_size = self.page_size().bytes();
        let used = self.total_pages().saturating_sub(self.free_pages()) * page_size;
        write!(
            f,
            "{} used, {} total",
            format_size(used, BINARY),
            format_size(self.total_pages() * page_size, BINARY)
        )
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let free: usize = self
            .shards
            .iter()
            .map(|shard| shard.count_quiescent(&self.links))
            .sum();
        if free != self.total_pages() {
            log::warn!(
                "page pool dropped with {} of {} pages still handed out",
                self.total_pages() - free,
                self.total_pages()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Barrier, Mutex},
    };

    use super::*;

    fn pool(shards: usize, pages_per_shard: usize) -> PagePool {
        PoolOptions::new()
            .shards(shards)
            .pages_per_shard(pages_per_shard)
            .build()
            .unwrap()
    }

    #[test]
    fn pages_start_in_their_home_shard() {
        let pool = pool(4, 3);
        assert_eq!(pool.total_pages(), 12);
        for shard in 0..4 {
            assert_eq!(pool.shard_free_pages(shard), 3);
        }

        let page = pool.allocate().unwrap();
        assert_eq!(pool.home_shard(&page), page.index() % 4);
        pool.deallocate(page);
        assert_eq!(pool.free_pages(), 12);
    }

    #[test]
    fn exhaustion_is_reported_and_recovers() {
        let pool = pool(2, 2);
        let mut pages: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());
        assert_eq!(pool.free_pages(), 0);

        pool.deallocate(pages.pop().unwrap());
        assert!(pool.allocate().map(|page| pool.deallocate(page)).is_some());

        for page in pages {
            pool.deallocate(page);
        }
        assert_eq!(pool.free_pages(), 4);
    }

    #[test]
    fn deallocate_returns_to_home_shard() {
        let pool = pool(4, 2);
        // Drain everything so the fallback scan serves most of these.
        let pages: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
        for page in pages {
            pool.deallocate(page);
        }
        for shard in 0..4 {
            assert_eq!(pool.shard_free_pages(shard), 2);
        }
    }

    #[test]
    fn page_contents_are_private_to_owner() {
        let pool = pool(1, 2);
        let mut first = pool.allocate().unwrap();
        let mut second = pool.allocate().unwrap();
        assert_ne!(first, second);

        pool.page_bytes_mut(&mut first).fill(42);
        pool.page_bytes_mut(&mut second).fill(7);
        assert!(pool.page_bytes(&first).iter().all(|&byte| byte == 42));
        assert_eq!(pool.memory().pfn_of(pool.page_addr(&second)), Some(second.pfn()));

        pool.deallocate(first);
        pool.deallocate(second);
    }

    #[test]
    #[should_panic]
    fn rejects_foreign_pages() {
        let one = pool(1, 1);
        let other = pool(1, 1);
        let page = one.allocate().unwrap();
        other.deallocate(page);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(PoolOptions::new().shards(0).build().is_err());
        assert!(PoolOptions::new().pages_per_shard(0).build().is_err());
    }

    #[test]
    fn refuses_pools_the_host_cannot_back() {
        let Some(physical) = crate::mem::physical_memory() else { return };
        let pages = physical / PageSize::Size4K.bytes();
        let err = PoolOptions::new()
            .shards(4)
            .pages_per_shard(pages / 2)
            .build()
            .err()
            .map(|err| err.errno());
        assert_eq!(err, Some(Errno::OutOfMemory));
    }

    #[test]
    fn concurrent_rounds_never_share_pages() {
        const THREADS: usize = 8;
        const CYCLES: usize = 64;

        let pool = pool(4, 256);
        let issued = Mutex::new(HashSet::new());
        let barrier = Barrier::new(THREADS);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    let mut held = Vec::with_capacity(CYCLES);
                    for _ in 0..CYCLES {
                        let mut page = pool.allocate().unwrap();
                        pool.page_bytes_mut(&mut page).fill(42);
                        held.push(page);
                    }
                    {
                        let mut issued = issued.lock().unwrap();
                        for page in held.iter() {
                            assert!(issued.insert(page.index()), "page issued twice");
                        }
                    }
                    barrier.wait();
                    for page in held {
                        pool.deallocate(page);
                    }
                });
            }
        });

        assert_eq!(issued.lock().unwrap().len(), THREADS * CYCLES);
        assert_eq!(pool.free_pages(), pool.total_pages());
    }

    #[test]
    fn churn_conserves_pages() {
        let pool = pool(2, 8);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..2000 {
                        if let Some(page) = pool.allocate() {
                            pool.deallocate(page);
                        }
                    }
                });
            }
        });
        assert_eq!(pool.free_pages(), 16);
    }

    #[test]
    fn display_reports_usage() {
        let pool = pool(1, 4);
        let page = pool.allocate().unwrap();
        assert_eq!(pool.to_string(), "4 KiB used, 16 KiB total");
        pool.deallocate(page);
    }
}
