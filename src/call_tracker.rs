use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

// Sentinel for "never observed". Stores never hand back i64::MIN for a counter that
// only moves by one.
const UNOBSERVED: i64 = i64::MIN;

/// Per-instance bookkeeping of local calls.
///
/// Not shared across processes and never consulted for cross-process admission,
/// apart from the cached counter the admission loop uses to skip a store round trip
/// when it already knows the key is over capacity.
#[derive(Debug)]
pub(crate) struct CallTracker {
    waiting: AtomicU64,
    observed: AtomicI64,
    generation: AtomicU64,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self {
            waiting: AtomicU64::new(0),
            observed: AtomicI64::new(UNOBSERVED),
            generation: AtomicU64::new(0),
        }
    }
}

impl CallTracker {
    /// Create a tracker with both tallies at zero and no observed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls submitted on this instance that have not settled yet, including the
    /// ones currently executing.
    pub fn waiting(&self) -> u64 {
        self.waiting.load(Ordering::Acquire)
    }

    /// Last counter value this instance saw in the store, if any.
    pub fn observed(&self) -> Option<i64> {
        match self.observed.load(Ordering::Acquire) {
            UNOBSERVED => None,
            value => Some(value),
        }
    }

    /// Last observed counter value, or `0` if the store was never read.
    pub fn running(&self) -> i64 {
        self.observed().unwrap_or(0)
    }

    /// Bumped on every observation, so a caller can tell whether the cached value
    /// changed hands since it last looked.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn observe(&self, value: i64) {
        self.observed.store(value, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Register a new call. The returned guard unregisters it when dropped, whatever
    /// path the call leaves by.
    pub(crate) fn enter(self: &Arc<Self>) -> WaitingGuard {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        WaitingGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Zero both tallies. Calls still in flight keep their guards; their drops
    /// saturate at zero instead of wrapping.
    pub(crate) fn reset(&self) {
        self.waiting.store(0, Ordering::Release);
        self.observe(0);
    }

    fn leave(&self) {
        let _ = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// RAII registration of one call on a [`CallTracker`].
#[derive(Debug)]
pub(crate) struct WaitingGuard {
    tracker: Arc<CallTracker>,
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.tracker.leave();
    }
}
