//! Flow Control
//!
//! The protocol between a node and its subscribers, modelled on Reactive
//! Streams: a subscriber is handed a [`Subscription`] and receives at most as
//! many values as it has requested through it.
//!
//! # Components
//!
//! - [`Subscriber`]: the consumer side, with optional [`ErrorRecovery`].
//! - [`Subscription`]: the handle used to request credit or cancel.
//! - [`CreditLedger`]: lock-free per-subscription credit counter.
//! - The delivery state machine that decides, per subscription, whether an
//!   event is delivered now or staged for later.

pub(crate) mod downstream;
pub(crate) mod guard;
pub mod ledger;
mod subscriber;
mod subscription;

pub use downstream::DeliveryState;
pub use ledger::{CreditLedger, UNBOUNDED};
pub use subscriber::{ErrorRecovery, Recovery, Subscriber, SubscriptionId};
pub use subscription::Subscription;
