//! Re-entrancy Guard
//!
//! Marks a subscription as "delivery in progress". A callback that
//! synchronously causes another delivery to the same subscription (for
//! example by setting a leaf the subscription transitively depends on) finds
//! the guard held and defers instead of recursing.
//!
//! # Implementation
//!
//! The guard is an atomic flag owned by the subscription, acquired through an
//! RAII token rather than thread-local state. Because the flag is shared, a
//! delivery attempted concurrently from another thread is deferred the same
//! way as a re-entrant one, which is what keeps a subscriber's callbacks
//! strictly serialized.

use std::sync::atomic::{AtomicBool, Ordering};

/// Per-subscription delivery flag.
#[derive(Debug, Default)]
pub(crate) struct ReentrancyGuard {
    busy: AtomicBool,
}

impl ReentrancyGuard {
    pub(crate) const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    /// Try to start a delivery.
    ///
    /// Returns `None` if a delivery is already in progress, either further
    /// up this thread's call stack or on another thread.
    pub(crate) fn enter(&self) -> Option<GuardToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GuardToken { busy: &self.busy })
    }

    /// Check whether a delivery is in progress.
    pub(crate) fn is_held(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Token that releases the guard when dropped.
///
/// This ensures the flag is cleared even if the callback panics.
pub(crate) struct GuardToken<'a> {
    busy: &'a AtomicBool,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}
