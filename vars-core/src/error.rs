//! Error types shared by every node and subscription.
//!
//! Errors travel through the graph like values: they are cached on nodes and
//! handed to many subscribers, so `VarError` is cheap to clone and carries its
//! payloads behind `Arc`.

use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = VarError> = std::result::Result<T, E>;

/// Failure raised by a node, a subscription, or a subscriber.
#[derive(Debug, Clone, Error)]
pub enum VarError {
    /// `request(n)` was called with `n < 1`.
    #[error("request amount must be at least 1, got {0}")]
    InvalidRequest(u64),

    /// A subscriber received a second subscription handle.
    #[error("subscriber already holds a subscription")]
    AlreadySubscribed,

    /// The node has never held a value.
    #[error("value has not been computed yet")]
    Uninitialized,

    /// A combining function failed.
    #[error("{0}")]
    Compute(Arc<dyn StdError + Send + Sync>),

    /// A combining function or a subscriber callback panicked.
    #[error("panicked: {0}")]
    Panicked(Arc<str>),

    /// A recovery-capable subscriber failed while handling `original`.
    #[error("error recovery failed: {failure} (while handling: {original})")]
    RecoveryFailed {
        failure: Arc<VarError>,
        original: Arc<VarError>,
    },
}

impl VarError {
    /// Wrap an arbitrary error raised by a combining function.
    pub fn compute<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(error))
    }

    /// Build a compute failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = message.into().into();
        Self::Compute(Arc::from(boxed))
    }

    /// Protocol violations are always fatal to the subscription that caused them.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::AlreadySubscribed)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(Arc::from(message))
    }

    pub(crate) fn recovery_failed(failure: VarError, original: VarError) -> Self {
        Self::RecoveryFailed {
            failure: Arc::new(failure),
            original: Arc::new(original),
        }
    }
}
