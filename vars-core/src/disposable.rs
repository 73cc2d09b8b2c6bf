//! Callback Subscriptions
//!
//! A simpler way to listen to a var: hand over closures, get back a
//! [`Disposable`]. Credit is requested one unit at a time, so the callback
//! sees every value that is current when it is ready for the next one.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use vars_core::{Callbacks, Var};
//!
//! let count = Var::leaf(0);
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let sink = Arc::clone(&seen);
//! let handle = count.subscribe_callbacks(
//!     Callbacks::new(move |value| sink.lock().unwrap().push(value))
//!         .on_complete(|| println!("done")),
//! );
//!
//! count.set(1);
//! handle.dispose();
//! count.set(2);
//!
//! assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::VarError;
use crate::flow::{Subscriber, Subscription};

type ValueFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(VarError) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Closures to run for each kind of notification.
pub struct Callbacks<T> {
    on_value: ValueFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
}

impl<T> Callbacks<T> {
    /// Start with a value callback. Errors are logged unless an error
    /// callback is added.
    pub fn new<F>(on_value: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            on_value: Box::new(on_value),
            on_error: None,
            on_complete: None,
        }
    }

    /// Run `f` with the terminal error.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(VarError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Run `f` at end of stream.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl<T> fmt::Debug for Callbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Subscriber that forwards to [`Callbacks`].
pub(crate) struct CallbackSubscriber<T> {
    callbacks: Callbacks<T>,
    subscription: Mutex<Option<Subscription>>,
    subscribed: AtomicBool,
    disposed: AtomicBool,
}

impl<T> CallbackSubscriber<T> {
    pub(crate) fn new(callbacks: Callbacks<T>) -> Self {
        Self {
            callbacks,
            subscription: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn handle(&self) -> Option<Subscription> {
        self.subscription.lock().clone()
    }

    /// Drop the handle without cancelling; the stream already ended.
    fn release(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.subscription.lock().take();
    }

    fn report(&self, error: VarError) {
        match &self.callbacks.on_error {
            Some(on_error) => on_error(error),
            None => warn!(error = %error, "unhandled error delivered to callback subscriber"),
        }
    }
}

impl<T: Send + Sync> Subscriber<T> for CallbackSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            warn!(subscription = %subscription.id(), "callback subscriber handed a second subscription");
            subscription.cancel();
            self.dispose();
            self.report(VarError::AlreadySubscribed);
            return;
        }

        if self.disposed.load(Ordering::SeqCst) {
            subscription.cancel();
            return;
        }

        *self.subscription.lock() = Some(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&self, value: T) {
        (self.callbacks.on_value)(value);
        if let Some(subscription) = self.handle() {
            subscription.request(1);
        }
    }

    fn on_error(&self, error: VarError) {
        self.release();
        self.report(error);
    }

    fn on_complete(&self) {
        self.release();
        if let Some(on_complete) = &self.callbacks.on_complete {
            on_complete();
        }
    }
}

trait Dispose: Send + Sync {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

impl<T: Send + Sync> Dispose for CallbackSubscriber<T> {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Handle returned by callback subscriptions.
///
/// Disposing cancels the underlying subscription. Dropping the handle does
/// not; the callbacks keep running until disposed or until the stream ends.
#[derive(Clone)]
pub struct Disposable {
    inner: Arc<dyn Dispose>,
}

impl Disposable {
    pub(crate) fn new<T: Send + Sync + 'static>(subscriber: Arc<CallbackSubscriber<T>>) -> Self {
        Self { inner: subscriber }
    }

    /// Stop receiving notifications. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether the subscription was disposed or its stream ended.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
