//! Downstream Subscription
//!
//! The state machine a node keeps for each registered subscriber. It decides,
//! for every event, whether to deliver now or to stage the item for later.
//!
//! # States
//!
//! ```text
//! PendingHandshake --handshake--> Idle <--deliver-- ItemAvailable
//!        |                         |  --no credit / guard held-->  |
//!        +-------------------------+-------------------------------+--> Terminal
//! ```
//!
//! # Delivery
//!
//! Items are never queued. A staged item is "whatever the node holds now",
//! identified by the node's publication version, so values that arrive while
//! credit is exhausted are coalesced and only the latest is delivered.
//!
//! A delivery holds the subscription's re-entrancy guard while the callback
//! runs. Anything that wants to deliver while the guard is held stages its
//! item and returns; the guard holder drains staged items (and any terminal
//! signal raised meanwhile) before it lets go.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::VarError;
use crate::graph::{Node, Value};

use super::guard::ReentrancyGuard;
use super::ledger::CreditLedger;
use super::subscriber::{Recovery, Subscriber, SubscriptionId};
use super::subscription::{Subscription, SubscriptionControl};

/// Delivery state of a subscription.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeliveryState {
    /// Registered, but `on_subscribe` has not returned yet.
    PendingHandshake = 0,

    /// Nothing staged.
    Idle = 1,

    /// A value is staged but could not be delivered yet.
    ItemAvailable = 2,

    /// Cancelled, completed, or failed. No further transitions.
    Terminal = 3,
}

impl DeliveryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::PendingHandshake,
            1 => Self::Idle,
            2 => Self::ItemAvailable,
            _ => Self::Terminal,
        }
    }

    fn is_active(self) -> bool {
        matches!(self, Self::Idle | Self::ItemAvailable)
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: DeliveryState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> DeliveryState {
        DeliveryState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: DeliveryState, to: DeliveryState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `Terminal` from any other state. Returns false if already there.
    fn terminate(&self) -> bool {
        self.0.swap(DeliveryState::Terminal as u8, Ordering::SeqCst) != DeliveryState::Terminal as u8
    }
}

enum TerminalSignal {
    Complete,
    Error(VarError),
}

/// Per-subscriber state machine owned by a node.
pub(crate) struct Downstream<T: Value> {
    id: SubscriptionId,

    /// Weak so a subscription never keeps its node alive. A node that is
    /// gone completes its subscriptions on drop.
    node: Weak<Node<T>>,

    /// Cleared on termination so the subscriber and its handle do not keep
    /// each other alive.
    subscriber: RwLock<Option<Arc<dyn Subscriber<T>>>>,

    ledger: CreditLedger,
    state: AtomicState,
    guard: ReentrancyGuard,

    /// Last error offered but not yet resolved.
    pending_error: Mutex<Option<VarError>>,

    /// Terminal signal waiting for the guard holder to deliver it.
    terminal: Mutex<Option<TerminalSignal>>,

    /// Node version of the last value handed to `on_next`.
    delivered: AtomicU64,
}

impl<T: Value> Downstream<T> {
    pub(crate) fn new(node: &Arc<Node<T>>, subscriber: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionId::new(),
            node: Arc::downgrade(node),
            subscriber: RwLock::new(Some(subscriber)),
            ledger: CreditLedger::new(),
            state: AtomicState::new(DeliveryState::PendingHandshake),
            guard: ReentrancyGuard::new(),
            pending_error: Mutex::new(None),
            terminal: Mutex::new(None),
            delivered: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn state(&self) -> DeliveryState {
        self.state.load()
    }

    pub(crate) fn credit(&self) -> u64 {
        self.ledger.available()
    }

    /// Register via `register`, hand the subscriber its handle, then open
    /// the subscription for delivery.
    ///
    /// The guard is held throughout, so nothing reaches the subscriber
    /// before `on_subscribe` returns. Returns false if the subscription was
    /// terminated during the handshake.
    pub(crate) fn handshake(self: &Arc<Self>, register: impl FnOnce()) -> bool {
        {
            let _token = self.guard.enter();
            register();

            if let Some(subscriber) = self.subscriber() {
                let handle = Subscription::new(self.clone());
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber.on_subscribe(handle))) {
                    warn!(subscription = %self.id, "on_subscribe panicked");
                    self.fail(VarError::from_panic(payload));
                }
            }
        }

        self.flush_terminal();
        self.state
            .transition(DeliveryState::PendingHandshake, DeliveryState::Idle)
    }

    /// The node holds a new value; deliver it or stage it.
    pub(crate) fn offer_value(&self) {
        self.pending_error.lock().take();

        if self.state.transition(DeliveryState::Idle, DeliveryState::ItemAvailable)
            || self.state.load() == DeliveryState::ItemAvailable
        {
            self.drain();
        }
    }

    /// The node raised an error.
    ///
    /// Fatal for subscribers without a recovery capability; otherwise handed
    /// to the subscriber's [`ErrorRecovery`](super::ErrorRecovery).
    pub(crate) fn offer_error(&self, error: VarError) {
        *self.pending_error.lock() = Some(error.clone());
        // The error supersedes any staged value.
        self.state
            .transition(DeliveryState::ItemAvailable, DeliveryState::Idle);

        let Some(subscriber) = self.subscriber() else {
            return;
        };

        if subscriber.recovery().is_some() {
            self.resolve_error(subscriber.as_ref());
        } else {
            self.fail(error);
        }

        self.drain();
    }

    /// End of stream.
    pub(crate) fn complete(&self) {
        if !self.state.terminate() {
            return;
        }
        debug!(subscription = %self.id, "subscription completed");
        self.detach();
        *self.terminal.lock() = Some(TerminalSignal::Complete);
        self.flush_terminal();
    }

    /// Fail the subscription with `error`, delivering it exactly once.
    pub(crate) fn fail(&self, error: VarError) {
        if !self.state.terminate() {
            return;
        }
        debug!(subscription = %self.id, error = %error, "subscription failed");
        self.detach();
        *self.terminal.lock() = Some(TerminalSignal::Error(error));
        self.flush_terminal();
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.subscriber.read().clone()
    }

    fn detach(&self) {
        self.ledger.drain();
        self.pending_error.lock().take();
        if let Some(node) = self.node.upgrade() {
            node.remove_subscription(self.id);
        }
    }

    /// Deliver everything that can be delivered now.
    ///
    /// Loops because work may be deferred to this thread while it held the
    /// guard for error resolution rather than for values.
    fn drain(&self) {
        loop {
            self.drain_values();
            let resolved = self.retry_pending_error();
            self.flush_terminal();

            let values_ready = self.state.load() == DeliveryState::ItemAvailable
                && self.ledger.available() > 0;
            let errors_ready = resolved && self.pending_error.lock().is_some();
            if !(values_ready || errors_ready) || self.guard.is_held() {
                return;
            }
        }
    }

    /// Deliver the node's latest value for as long as something is staged
    /// and credit remains.
    fn drain_values(&self) {
        loop {
            if self.state.load() != DeliveryState::ItemAvailable || self.ledger.available() == 0 {
                return;
            }

            let Some(_token) = self.guard.enter() else {
                trace!(subscription = %self.id, "delivery deferred while guard is held");
                return;
            };

            if !self
                .state
                .transition(DeliveryState::ItemAvailable, DeliveryState::Idle)
            {
                continue;
            }

            let latest = self.node.upgrade().and_then(|node| node.latest_value());
            let Some((version, value)) = latest else {
                continue;
            };
            if version <= self.delivered.load(Ordering::SeqCst) {
                continue;
            }

            if !self.ledger.try_consume(1) {
                self.state
                    .transition(DeliveryState::Idle, DeliveryState::ItemAvailable);
                continue;
            }
            self.delivered.store(version, Ordering::SeqCst);

            let Some(subscriber) = self.subscriber() else {
                return;
            };

            trace!(subscription = %self.id, version, "delivering value");
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber.on_next(value))) {
                warn!(subscription = %self.id, "on_next panicked");
                self.fail(VarError::from_panic(payload));
                return;
            }
        }
    }

    fn retry_pending_error(&self) -> bool {
        if self.pending_error.lock().is_none() {
            return false;
        }
        match self.subscriber() {
            Some(subscriber) => self.resolve_error(subscriber.as_ref()),
            None => false,
        }
    }

    /// Hand the pending error to the subscriber's recovery capability.
    ///
    /// Returns false if nothing was resolved: no capability, no pending
    /// error, the guard was held, or the subscriber declined.
    fn resolve_error(&self, subscriber: &dyn Subscriber<T>) -> bool {
        let Some(recovery) = subscriber.recovery() else {
            return false;
        };
        if !self.state.load().is_active() {
            return false;
        }

        let Some(_token) = self.guard.enter() else {
            trace!(subscription = %self.id, "error resolution deferred while guard is held");
            return false;
        };

        let Some(error) = self.pending_error.lock().take() else {
            return false;
        };

        let available = self.ledger.available();
        match catch_unwind(AssertUnwindSafe(|| recovery.recover(&error, available))) {
            Ok(Ok(Recovery::Recovered { consumed })) => {
                if consumed > 0 && !self.ledger.try_consume(consumed) {
                    warn!(
                        subscription = %self.id,
                        consumed,
                        available = self.ledger.available(),
                        "recovery consumed more credit than was granted"
                    );
                    self.ledger.drain();
                }
            }
            Ok(Ok(Recovery::Declined)) => {
                let mut pending = self.pending_error.lock();
                if pending.is_none() {
                    *pending = Some(error);
                }
                return false;
            }
            Ok(Err(failure)) => self.fail(VarError::recovery_failed(failure, error)),
            Err(payload) => {
                warn!(subscription = %self.id, "error recovery panicked");
                self.fail(VarError::recovery_failed(VarError::from_panic(payload), error));
            }
        }
        true
    }

    /// Deliver a stashed terminal signal if nobody else is delivering.
    fn flush_terminal(&self) {
        if self.terminal.lock().is_none() {
            return;
        }

        let Some(_token) = self.guard.enter() else {
            return;
        };
        let Some(signal) = self.terminal.lock().take() else {
            return;
        };
        let Some(subscriber) = self.subscriber.write().take() else {
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| match signal {
            TerminalSignal::Complete => subscriber.on_complete(),
            TerminalSignal::Error(error) => subscriber.on_error(error),
        }));
        if outcome.is_err() {
            warn!(subscription = %self.id, "terminal callback panicked");
        }
    }
}

impl<T: Value> SubscriptionControl for Downstream<T> {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn request(&self, n: u64) {
        if self.state.load() == DeliveryState::Terminal {
            return;
        }

        if let Err(error) = self.ledger.grant(n) {
            self.fail(error);
            return;
        }

        self.retry_pending_error();

        // Pull first so a fresher value can use the new credit.
        if let Some(node) = self.node.upgrade().filter(|node| node.is_lazy()) {
            node.request_upstream(n);
        }

        self.drain();
    }

    fn cancel(&self) {
        if !self.state.terminate() {
            return;
        }
        debug!(subscription = %self.id, "subscription cancelled");
        self.detach();
        self.subscriber.write().take();
    }

    fn peek(&self) -> bool {
        self.state.load() == DeliveryState::ItemAvailable
            || self.pending_error.lock().is_some()
            || self
                .node
                .upgrade()
                .is_some_and(|node| node.peek_upstream())
    }
}

impl<T: Value> fmt::Debug for Downstream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downstream")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("credit", &self.credit())
            .field("delivering", &self.guard.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Hook = Box<dyn Fn(&Probe, i32) + Send + Sync>;

    #[derive(Default)]
    struct Probe {
        initial: u64,
        handle: Mutex<Option<Subscription>>,
        values: Mutex<Vec<i32>>,
        errors: Mutex<Vec<VarError>>,
        completions: AtomicUsize,
        depth: AtomicUsize,
        max_depth: AtomicUsize,
        hook: Option<Hook>,
    }

    impl Probe {
        fn with_credit(initial: u64) -> Arc<Self> {
            Arc::new(Self {
                initial,
                ..Default::default()
            })
        }

        fn request(&self, n: u64) {
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                handle.request(n);
            }
        }

        fn cancel(&self) {
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                handle.cancel();
            }
        }
    }

    impl Subscriber<i32> for Probe {
        fn on_subscribe(&self, subscription: Subscription) {
            *self.handle.lock() = Some(subscription.clone());
            if self.initial > 0 {
                subscription.request(self.initial);
            }
        }

        fn on_next(&self, value: i32) {
            let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_depth.fetch_max(depth, Ordering::SeqCst);
            self.values.lock().push(value);
            if let Some(hook) = &self.hook {
                hook(self, value);
            }
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }

        fn on_error(&self, error: VarError) {
            self.errors.lock().push(error);
        }

        fn on_complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn open(node: &Arc<Node<i32>>, probe: Arc<Probe>) -> Arc<Downstream<i32>> {
        let downstream = Downstream::new(node, probe);
        assert!(downstream.handshake(|| {}));
        downstream
    }

    #[test]
    fn handshake_opens_subscription() {
        let node = Node::leaf(1);
        let downstream = Downstream::new(&node, Probe::with_credit(0));
        assert_eq!(downstream.state(), DeliveryState::PendingHandshake);

        assert!(downstream.handshake(|| {}));
        assert_eq!(downstream.state(), DeliveryState::Idle);
    }

    #[test]
    fn nothing_delivered_during_handshake() {
        let node = Node::leaf(1);
        let probe = Probe::with_credit(5);
        let downstream = Downstream::new(&node, probe.clone());

        downstream.handshake(|| downstream.offer_value());
        assert!(probe.values.lock().is_empty());
        assert_eq!(downstream.credit(), 5);

        downstream.offer_value();
        assert_eq!(*probe.values.lock(), vec![1]);
        assert_eq!(downstream.credit(), 4);
    }

    #[test]
    fn staged_values_coalesce() {
        let node = Node::leaf(1);
        let probe = Probe::with_credit(0);
        let downstream = open(&node, probe.clone());

        for value in 2..=5 {
            node.publish(value);
            downstream.offer_value();
        }
        assert_eq!(downstream.state(), DeliveryState::ItemAvailable);
        assert!(probe.values.lock().is_empty());

        probe.request(3);
        assert_eq!(*probe.values.lock(), vec![5]);
        assert_eq!(downstream.state(), DeliveryState::Idle);
        assert_eq!(downstream.credit(), 2);
    }

    #[test]
    fn same_version_is_not_redelivered() {
        let node = Node::leaf(1);
        let probe = Probe::with_credit(10);
        let downstream = open(&node, probe.clone());

        downstream.offer_value();
        downstream.offer_value();
        assert_eq!(*probe.values.lock(), vec![1]);
    }

    #[test]
    fn zero_request_is_fatal() {
        let node = Node::leaf(1);
        let probe = Probe::with_credit(0);
        let downstream = open(&node, probe.clone());

        probe.request(0);
        assert_eq!(downstream.state(), DeliveryState::Terminal);
        assert!(matches!(probe.errors.lock().as_slice(), [VarError::InvalidRequest(0)]));

        probe.request(1);
        assert_eq!(probe.errors.lock().len(), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let node = Node::leaf(1);
        let probe = Probe::with_credit(1);
        let downstream = open(&node, probe.clone());

        probe.cancel();
        probe.cancel();
        assert_eq!(downstream.state(), DeliveryState::Terminal);
        assert_eq!(downstream.credit(), 0);

        downstream.offer_value();
        probe.request(1);
        assert!(probe.values.lock().is_empty());
        assert!(probe.errors.lock().is_empty());
        assert_eq!(probe.completions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_signal_delivered_once() {
        let node = Node::leaf(1);
        let probe = Probe::with_credit(1);
        let downstream = open(&node, probe.clone());

        downstream.complete();
        downstream.complete();
        downstream.fail(VarError::msg("late"));

        assert_eq!(probe.completions.load(Ordering::SeqCst), 1);
        assert!(probe.errors.lock().is_empty());
    }

    #[test]
    fn panicking_callback_fails_only_its_subscription() {
        let node = Node::leaf(1);
        let probe = Arc::new(Probe {
            initial: 1,
            hook: Some(Box::new(|_, _| panic!("subscriber bug"))),
            ..Default::default()
        });
        let downstream = open(&node, probe.clone());

        downstream.offer_value();
        assert_eq!(downstream.state(), DeliveryState::Terminal);
        let errors = probe.errors.lock();
        assert!(matches!(errors.as_slice(), [VarError::Panicked(message)] if &**message == "subscriber bug"));
    }

    #[test]
    fn reentrant_delivery_is_deferred() {
        let node = Node::leaf(1);
        let source = Arc::clone(&node);
        let probe = Arc::new(Probe {
            initial: 1,
            hook: Some(Box::new(move |probe, value| {
                if value < 5 {
                    source.publish(value + 1);
                    probe.request(1);
                }
            })),
            ..Default::default()
        });
        node.subscribe(probe.clone());

        assert_eq!(*probe.values.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(probe.max_depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_inside_on_next_stops_delivery() {
        let node = Node::leaf(1);
        let probe = Arc::new(Probe {
            initial: 10,
            hook: Some(Box::new(|probe, _| probe.cancel())),
            ..Default::default()
        });
        node.subscribe(probe.clone());
        node.publish(2);

        assert_eq!(*probe.values.lock(), vec![1]);
        assert_eq!(node.subscriber_count(), 0);
    }

    #[test]
    fn cancel_during_handshake_is_honoured() {
        struct Quitter;

        impl Subscriber<i32> for Quitter {
            fn on_subscribe(&self, subscription: Subscription) {
                subscription.cancel();
            }
            fn on_next(&self, _value: i32) {
                panic!("no values after cancel");
            }
            fn on_error(&self, _error: VarError) {}
            fn on_complete(&self) {}
        }

        let node = Node::leaf(1);
        node.subscribe(Arc::new(Quitter));
        assert_eq!(node.subscriber_count(), 0);
    }
}
