//! Overlap guard for periodic loops

use std::sync::atomic::{AtomicBool, Ordering};

/// A tick runs only if no other tick holds the flag; overlapping ticks are skipped.
#[derive(Debug, Default)]
pub struct BusyFlag(AtomicBool);

impl BusyFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the flag, or `None` if a tick is already running.
    pub fn try_enter(&self) -> Option<BusyGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.0))
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flag on drop
#[derive(Debug)]
pub struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
