//! The handle a subscriber uses to talk back to its node.

use std::fmt;
use std::sync::Arc;

use super::ledger::UNBOUNDED;
use super::subscriber::SubscriptionId;

/// Operations a subscription handle forwards to its state machine.
pub(crate) trait SubscriptionControl: Send + Sync {
    fn id(&self) -> SubscriptionId;
    fn request(&self, n: u64);
    fn cancel(&self);
    fn peek(&self) -> bool;
}

/// Handle given to a subscriber in `on_subscribe`.
///
/// Cheap to clone. Every method is safe to call from any thread and from
/// inside the subscriber's own callbacks.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn SubscriptionControl>,
}

impl Subscription {
    pub(crate) fn new(inner: Arc<dyn SubscriptionControl>) -> Self {
        Self { inner }
    }

    /// ID of the registration this handle controls.
    pub fn id(&self) -> SubscriptionId {
        self.inner.id()
    }

    /// Authorize `n` more deliveries.
    ///
    /// `n == 0` is a protocol violation and fails the subscription with
    /// [`VarError::InvalidRequest`](crate::VarError::InvalidRequest).
    /// Requests accumulate with saturating arithmetic.
    pub fn request(&self, n: u64) {
        self.inner.request(n);
    }

    /// Authorize every future delivery.
    pub fn request_unbounded(&self) {
        self.inner.request(UNBOUNDED);
    }

    /// Stop all future notifications. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether a staged, undelivered item exists on this subscription or
    /// anywhere upstream of it.
    pub fn peek(&self) -> bool {
        self.inner.peek()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id()).finish()
    }
}
