use core::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one page's access state, packed in a single word.
///
/// Bit 0 is `evicted`, bit 1 `marked`, bit 2 `locked`; the rest is reserved.
/// An evicted page is never marked or locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageState(u64);

impl PageState {
    const EVICTED: u64 = 1 << 0;
    const MARKED: u64 = 1 << 1;
    const LOCKED: u64 = 1 << 2;

    pub const fn unlocked() -> Self {
        Self(0)
    }

    pub const fn evicted() -> Self {
        Self(Self::EVICTED)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_evicted(self) -> bool {
        self.0 & Self::EVICTED != 0
    }

    pub const fn is_marked(self) -> bool {
        self.0 & Self::MARKED != 0
    }

    pub const fn is_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    pub const fn is_unlocked(self) -> bool {
        !self.is_locked()
    }

    /// The same state with the lock taken.
    pub const fn locked_state(self) -> Self {
        Self(self.0 | Self::LOCKED)
    }

    pub const fn unlocked_state(self) -> Self {
        Self(self.0 & !Self::LOCKED)
    }

    pub const fn with_marked(self) -> Self {
        Self(self.0 | Self::MARKED)
    }
}

/// The shared atomic word holding a [`PageState`].
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct StateWord(AtomicU64);

impl StateWord {
    pub const fn new(state: PageState) -> Self {
        Self(AtomicU64::new(state.bits()))
    }

    /// # Safety
    /// `ptr` must be valid, 8-byte aligned and only ever accessed atomically
    /// for as long as the returned reference lives.
    pub unsafe fn from_ptr<'a>(ptr: *mut u64) -> &'a Self {
        unsafe { &*(ptr as *const Self) }
    }

    pub fn load(&self) -> PageState {
        PageState(self.0.load(Ordering::Acquire))
    }

    /// One CAS from `expected` to its locked form.
    pub fn try_lock(&self, expected: PageState) -> bool {
        self.0
            .compare_exchange(
                expected.bits(),
                expected.locked_state().bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Release the lock. Only the holder may call this, so a plain store suffices.
    pub fn unlock(&self) {
        let state = self.load();
        debug_assert!(state.is_locked());
        self.0.store(state.unlocked_state().bits(), Ordering::Release);
    }

    /// Set `marked` on an unlocked page. Returns false if the page is locked or evicted.
    pub fn mark(&self) -> bool {
        let mut state = self.load();
        loop {
            if state.is_locked() || state.is_evicted() {
                return false;
            }
            match self.0.compare_exchange_weak(
                state.bits(),
                state.with_marked().bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => state = PageState(current),
            }
        }
    }
}
