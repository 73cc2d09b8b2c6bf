//! Subscriber adapters built on the recovery capability.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, VarError};
use crate::flow::{ErrorRecovery, Recovery, Subscriber, Subscription};

type FallbackFn<T> = Box<dyn Fn(&VarError) -> Result<T> + Send + Sync>;

/// Wraps a subscriber and turns errors into fallback values.
///
/// An error is only recovered while credit is available; otherwise it stays
/// staged until the wrapped subscriber requests more. Each recovery consumes
/// one unit of credit. If the fallback itself fails, the subscription fails
/// with [`VarError::RecoveryFailed`].
pub struct Recovering<T> {
    inner: Arc<dyn Subscriber<T>>,
    fallback: FallbackFn<T>,
}

impl<T> Recovering<T> {
    /// Wrap `inner`, substituting `fallback(error)` for each error.
    pub fn new<F>(inner: Arc<dyn Subscriber<T>>, fallback: F) -> Self
    where
        F: Fn(&VarError) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            inner,
            fallback: Box::new(fallback),
        }
    }

    /// Wrap `inner`, substituting a fixed value for each error.
    pub fn with_value(inner: Arc<dyn Subscriber<T>>, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::new(inner, move |_| Ok(value.clone()))
    }
}

impl<T: Send + Sync> Subscriber<T> for Recovering<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.inner.on_next(value);
    }

    fn on_error(&self, error: VarError) {
        self.inner.on_error(error);
    }

    fn on_complete(&self) {
        self.inner.on_complete();
    }

    fn recovery(&self) -> Option<&dyn ErrorRecovery> {
        Some(self)
    }
}

impl<T: Send + Sync> ErrorRecovery for Recovering<T> {
    fn recover(&self, error: &VarError, available: u64) -> Result<Recovery> {
        if available == 0 {
            return Ok(Recovery::Declined);
        }
        let value = (self.fallback)(error)?;
        self.inner.on_next(value);
        Ok(Recovery::Recovered { consumed: 1 })
    }
}

impl<T> fmt::Debug for Recovering<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovering").finish_non_exhaustive()
    }
}
