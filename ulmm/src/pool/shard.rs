use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const NIL: u32 = u32::MAX;

const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

const fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// One lock-free free list of page indices.
///
/// The head packs a tag with the top index so a pop racing with a
/// pop-push of the same index fails its CAS instead of corrupting the list.
/// Next links live in the pool-wide `links` array, one per page.
pub(super) struct Shard {
    head: AtomicU64,
    remaining: AtomicUsize,
}

impl Shard {
    pub(super) const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
            remaining: AtomicUsize::new(0),
        }
    }

    /// Approximate number of free pages; never lower than the true count.
    pub(super) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }

    pub(super) fn push(&self, links: &[AtomicU32], index: u32) {
        debug_assert!(index != NIL);
        self.remaining.fetch_add(1, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack(head);
            links[index as usize].store(top, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    pub(super) fn pop(&self, links: &[AtomicU32]) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            if top == NIL {
                return None;
            }
            let next = links[top as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.remaining.fetch_sub(1, Ordering::Relaxed);
                    return Some(top);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Walk the list without popping. Only meaningful while no one else touches the shard.
    pub(super) fn count_quiescent(&self, links: &[AtomicU32]) -> usize {
        let (_, mut top) = unpack(self.head.load(Ordering::Acquire));
        let mut count = 0;
        while top != NIL {
            count += 1;
            top = links[top as usize].load(Ordering::Relaxed);
        }
        count
    }
}
