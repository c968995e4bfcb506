//! In-process stand-ins for the host: a delegation whose faults are injected
//! by the test, and a page table that only records entries.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use ulmm_hal::{
    mem::{PageSize, PageTableEditor, Pfn, PhysMem, PteFlags, VirtAddr},
    vm::Protection,
};

use super::{FaultChannel, FaultDelegation, FaultEvent};
use crate::{Errno, Result};

const WAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct QueueState {
    events: VecDeque<Option<FaultEvent>>,
    wakes: Vec<(VirtAddr, usize)>,
    unregistered: bool,
}

#[derive(Default)]
pub(crate) struct Queue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Queue {
    pub(crate) fn push(&self, event: Option<FaultEvent>) {
        self.state.lock().unwrap().events.push_back(event);
        self.cond.notify_all();
    }

    /// Raise a missing-page fault and block like the faulting thread would.
    pub(crate) fn fault(&self, addr: VirtAddr) -> bool {
        let page = PageSize::Size4K.align_down(addr);
        let mut state = self.state.lock().unwrap();
        let seen = state.wakes.len();
        state
            .events
            .push_back(Some(FaultEvent::MissingPage { addr }));
        self.cond.notify_all();

        let deadline = Instant::now() + WAKE_TIMEOUT;
        loop {
            let woken = state.wakes[seen..]
                .iter()
                .any(|&(start, len)| (start..start + len).contains(&page));
            if woken {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    pub(crate) fn wakes(&self) -> Vec<(VirtAddr, usize)> {
        self.state.lock().unwrap().wakes.clone()
    }

    pub(crate) fn is_unregistered(&self) -> bool {
        self.state.lock().unwrap().unregistered
    }
}

pub(crate) struct FakeChannel {
    queue: Arc<Queue>,
}

impl FakeChannel {
    /// A channel nobody injects into.
    pub(crate) fn detached() -> Self {
        Self {
            queue: Arc::default(),
        }
    }

    pub(crate) fn queue(&self) -> Arc<Queue> {
        self.queue.clone()
    }
}

impl FaultChannel for FakeChannel {
    fn wait(&self) -> Result<Option<FaultEvent>> {
        let mut state = self.queue.state.lock().unwrap();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            state = self.queue.cond.wait(state).unwrap();
        }
    }

    fn wake(&self, page: VirtAddr, len: usize) -> Result<()> {
        self.queue.state.lock().unwrap().wakes.push((page, len));
        self.queue.cond.notify_all();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.queue.push(None);
        Ok(())
    }

    fn unregister(&self, _base: VirtAddr, _len: usize) -> Result<()> {
        self.queue.state.lock().unwrap().unregistered = true;
        Ok(())
    }
}

#[derive(Default)]
struct Host {
    next: AtomicUsize,
    fail_register: AtomicBool,
    queues: Mutex<BTreeMap<VirtAddr, (usize, Arc<Queue>)>>,
    released: Mutex<Vec<(VirtAddr, usize)>>,
}

/// Hands out synthetic, never-mapped address ranges.
#[derive(Clone, Default)]
pub(crate) struct FakeDelegation(Arc<Host>);

impl FakeDelegation {
    pub(crate) fn new() -> Self {
        let delegation = Self::default();
        delegation.0.next.store(0x7f00_0000_0000, Ordering::Relaxed);
        delegation
    }

    pub(crate) fn fail_next_register(&self) {
        self.0.fail_register.store(true, Ordering::Relaxed);
    }

    fn queue_of(&self, addr: VirtAddr) -> Arc<Queue> {
        let queues = self.0.queues.lock().unwrap();
        let (base, (len, queue)) = queues.range(..=addr).next_back().unwrap();
        assert!(addr < base + len, "{:#x} is not in a registered range", addr);
        queue.clone()
    }

    pub(crate) fn fault(&self, addr: VirtAddr) -> bool {
        self.queue_of(addr).fault(addr)
    }

    pub(crate) fn inject(&self, addr: VirtAddr, event: FaultEvent) {
        self.queue_of(addr).push(Some(event));
    }

    pub(crate) fn released(&self) -> Vec<(VirtAddr, usize)> {
        self.0.released.lock().unwrap().clone()
    }

    pub(crate) fn registered(&self) -> usize {
        self.0.queues.lock().unwrap().len()
    }
}

impl FaultDelegation for FakeDelegation {
    type Channel = FakeChannel;

    fn reserve(&self, _hint: Option<VirtAddr>, len: usize, _prot: Protection) -> Result<VirtAddr> {
        Ok(self.0.next.fetch_add(len + 0x1000, Ordering::Relaxed))
    }

    fn register(&self, base: VirtAddr, len: usize) -> Result<FakeChannel> {
        if self.0.fail_register.swap(false, Ordering::Relaxed) {
            return Err(Errno::RegisterFailed.with_message("injected failure"));
        }
        let channel = FakeChannel::detached();
        self.0
            .queues
            .lock()
            .unwrap()
            .insert(base, (len, channel.queue()));
        Ok(channel)
    }

    fn release(&self, base: VirtAddr, len: usize) -> Result<()> {
        self.0.queues.lock().unwrap().remove(&base);
        self.0.released.lock().unwrap().push((base, len));
        Ok(())
    }
}

/// Records entries instead of editing a real table. Frame contents are read
/// back through the arena's direct map.
pub(crate) struct FakePageTable {
    memory: Arc<PhysMem>,
    entries: Mutex<BTreeMap<VirtAddr, (Pfn, PteFlags)>>,
}

impl FakePageTable {
    pub(crate) fn new(memory: Arc<PhysMem>) -> Self {
        Self {
            memory,
            entries: Mutex::default(),
        }
    }

    pub(crate) fn entry(&self, addr: VirtAddr) -> Option<(Pfn, PteFlags)> {
        let page = self.memory.page_size().align_down(addr);
        self.entries.lock().unwrap().get(&page).copied()
    }

    pub(crate) fn contents(&self, addr: VirtAddr) -> Option<Vec<u8>> {
        let (pfn, _) = self.entry(addr)?;
        Some(unsafe { self.memory.frame(pfn) }.unwrap().to_vec())
    }
}

impl PageTableEditor for FakePageTable {
    fn read_frame(&self, vaddr: VirtAddr) -> Result<Pfn> {
        self.memory
            .pfn_of(vaddr)
            .or_else(|| self.entry(vaddr).map(|(pfn, _)| pfn))
            .ok_or_else(|| Errno::NotFound.with_message(format!("no frame behind {:#x}", vaddr)))
    }

    fn install_frame(&self, vaddr: VirtAddr, pfn: Pfn, flags: PteFlags) -> Result<()> {
        let page = self.memory.page_size().align_down(vaddr);
        self.entries.lock().unwrap().insert(page, (pfn, flags));
        Ok(())
    }

    fn clear_range(&self, vaddr: VirtAddr, len: usize) {
        self.entries
            .lock()
            .unwrap()
            .retain(|&page, _| !(vaddr..vaddr + len).contains(&page));
    }
}
