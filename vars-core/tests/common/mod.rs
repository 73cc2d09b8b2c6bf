//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vars_core::{ErrorRecovery, Recovery, Result, Subscriber, Subscription, VarError};

/// Subscriber that records everything it receives.
pub struct TestSubscriber<T> {
    initial: u64,
    recovers: bool,
    handle: Mutex<Option<Subscription>>,
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<VarError>>,
    recovered: Mutex<Vec<VarError>>,
    completions: AtomicUsize,
}

impl<T: Clone> TestSubscriber<T> {
    /// Subscriber that requests `initial` credit on subscribe.
    pub fn new(initial: u64) -> Arc<Self> {
        Self::build(initial, false)
    }

    /// Subscriber that records errors as recovered instead of failing.
    pub fn recovering(initial: u64) -> Arc<Self> {
        Self::build(initial, true)
    }

    fn build(initial: u64, recovers: bool) -> Arc<Self> {
        Arc::new(Self {
            initial,
            recovers,
            handle: Mutex::new(None),
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            recovered: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
        })
    }

    pub fn request(&self, n: u64) {
        let handle = self.handle.lock().clone();
        handle.expect("subscribed").request(n);
    }

    pub fn cancel(&self) {
        let handle = self.handle.lock().clone();
        handle.expect("subscribed").cancel();
    }

    pub fn subscription(&self) -> Subscription {
        self.handle.lock().clone().expect("subscribed")
    }

    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub fn last(&self) -> Option<T> {
        self.values.lock().last().cloned()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().iter().map(ToString::to_string).collect()
    }

    pub fn recovered(&self) -> Vec<String> {
        self.recovered.lock().iter().map(ToString::to_string).collect()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + Sync> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        *self.handle.lock() = Some(subscription.clone());
        if self.initial > 0 {
            subscription.request(self.initial);
        }
    }

    fn on_next(&self, value: T) {
        self.values.lock().push(value);
    }

    fn on_error(&self, error: VarError) {
        self.errors.lock().push(error);
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    fn recovery(&self) -> Option<&dyn ErrorRecovery> {
        if self.recovers {
            Some(self)
        } else {
            None
        }
    }
}

impl<T: Clone + Send + Sync> ErrorRecovery for TestSubscriber<T> {
    fn recover(&self, error: &VarError, _available: u64) -> Result<Recovery> {
        self.recovered.lock().push(error.clone());
        Ok(Recovery::Recovered { consumed: 0 })
    }
}
