//! Collector hooks - the script engine's view of garbage collection
//!
//! Wrappers released by the keep-alive set are parked here instead of
//! being dropped on the spot, so finalization never runs inside a refcount
//! operation. `collect` drops them with the sweeping flag raised.

use super::wrapper::Wrapper;
use crate::logging::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Collector {
    sweeping: AtomicBool,
    garbage: Mutex<Vec<Arc<Wrapper>>>,
    collections: AtomicUsize,
    finalized: AtomicUsize,
}

/// Clears the sweeping flag on drop
pub struct SweepGuard<'a> {
    collector: &'a Collector,
    was_sweeping: bool,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.collector.sweeping.store(self.was_sweeping, Ordering::Release);
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sweep is in progress; the engine cannot be entered
    #[inline]
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Raise the sweeping flag until the guard drops
    pub fn begin_sweep(&self) -> SweepGuard<'_> {
        let was_sweeping = self.sweeping.swap(true, Ordering::AcqRel);
        SweepGuard { collector: self, was_sweeping }
    }

    /// Hand a wrapper's strong hold to the collector
    pub fn release(&self, wrapper: Arc<Wrapper>) {
        self.garbage.lock().push(wrapper);
    }

    /// Flag a wrapper as garbage so toggle-ups during a sweep drop it
    pub fn mark_unreachable(&self, wrapper: &Wrapper) {
        wrapper.mark_unreachable();
    }

    /// Wrappers waiting for the next collection
    pub fn pending(&self) -> usize {
        self.garbage.lock().len()
    }

    /// Drop parked wrappers while sweeping; returns how many were finalized
    pub fn collect(&self) -> usize {
        let garbage = std::mem::take(&mut *self.garbage.lock());
        let _sweep = self.begin_sweep();

        let mut finalized = 0;
        for wrapper in garbage {
            if Arc::strong_count(&wrapper) == 1 {
                finalized += 1;
            }
            drop(wrapper);
        }

        self.collections.fetch_add(1, Ordering::Relaxed);
        self.finalized.fetch_add(finalized, Ordering::Relaxed);
        debug!(event = "collect", finalized, "Collection finished");
        finalized
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            collections_run: self.collections.load(Ordering::Relaxed),
            wrappers_finalized: self.finalized.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }
}

/// Collector statistics for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectorStats {
    pub collections_run: usize,
    pub wrappers_finalized: usize,
    pub pending: usize,
}
