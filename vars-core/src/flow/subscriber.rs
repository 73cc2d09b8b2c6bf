//! Subscriber types for the flow-control protocol.
//!
//! A Subscriber is anything that consumes values from a node: user code,
//! callback adapters, and the internal hooks a derived node uses to listen
//! to its inputs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VarError};

use super::subscription::Subscription;

/// Unique identifier for a subscription.
///
/// Each call to `subscribe` creates a new registration with its own ID, even
/// when the same subscriber object is subscribed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Consumer side of the protocol.
///
/// The engine guarantees that:
///
/// - `on_subscribe` is called exactly once, before any other callback.
/// - No two callbacks for the same subscription ever run at the same time,
///   neither nested on one thread nor concurrently on several.
/// - `on_error` and `on_complete` are terminal: nothing follows them.
/// - `on_next` is called at most as many times as credit was requested.
///
/// Callbacks take `&self`; subscribers that record state use interior
/// mutability. A panicking callback fails only its own subscription.
pub trait Subscriber<T>: Send + Sync {
    /// Receive the subscription handle used to request credit or cancel.
    fn on_subscribe(&self, subscription: Subscription);

    /// Receive the next value.
    fn on_next(&self, value: T);

    /// Receive a terminal error.
    fn on_error(&self, error: VarError);

    /// Receive the end-of-stream signal.
    fn on_complete(&self);

    /// Error-recovery capability.
    ///
    /// Subscribers returning `None` (the default) treat every error as fatal.
    fn recovery(&self) -> Option<&dyn ErrorRecovery> {
        None
    }
}

/// Outcome of [`ErrorRecovery::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The error was handled; `consumed` units of credit were used up by
    /// values the subscriber delivered to itself in place of the error.
    Recovered { consumed: u64 },

    /// The subscriber cannot handle the error right now. It stays staged and
    /// is offered again on the next credit grant.
    Declined,
}

/// Optional capability that turns an error into a non-fatal event.
pub trait ErrorRecovery: Send + Sync {
    /// Handle `error` with `available` units of credit at hand.
    ///
    /// Returning `Err` fails the subscription with
    /// [`VarError::RecoveryFailed`].
    fn recover(&self, error: &VarError, available: u64) -> Result<Recovery>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl Subscriber<i32> for Silent {
        fn on_subscribe(&self, _subscription: Subscription) {}
        fn on_next(&self, _value: i32) {}
        fn on_error(&self, _error: VarError) {}
        fn on_complete(&self) {}
    }

    #[test]
    fn subscription_ids_are_unique() {
        let id1 = SubscriptionId::new();
        let id2 = SubscriptionId::new();
        let id3 = SubscriptionId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
        assert!(id1 < id2);
    }

    #[test]
    fn subscribers_have_no_recovery_by_default() {
        assert!(Silent.recovery().is_none());
    }

    #[test]
    fn subscription_id_display() {
        let id = SubscriptionId::new();
        assert_eq!(id.to_string(), format!("sub#{}", id.raw()));
    }
}
