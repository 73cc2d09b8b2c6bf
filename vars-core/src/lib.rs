//! Vars Core
//!
//! This crate provides a reactive variable engine with credit-based flow
//! control. It implements:
//!
//! - Leaf vars that are set from outside and derived vars computed from them
//! - Eager (push-driven) and lazy (pull-driven) evaluation
//! - A Reactive Streams style subscription protocol with backpressure
//! - Errors that travel through the graph like values
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `flow`: Subscriber protocol, credit ledger, and delivery state machine
//! - `graph`: Value nodes and derived-node recomputation
//! - `var`: The public `Var` / `Leaf` handles
//! - `disposable`: Callback-style subscriptions
//! - `support`: Subscriber adapters
//!
//! # Delivery Semantics
//!
//! Vars carry behaviour, not events. A subscriber without credit does not
//! queue updates; when it requests more it gets the latest value only.
//! Publishing a value equal to the current one delivers nothing.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use vars_core::Var;
//!
//! let revenue = Var::leaf(1000);
//! let expenses = Var::leaf(800);
//! let earnings = revenue.combine(&expenses, |r, e| r - e);
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _handle = earnings.subscribe_fn(move |v| sink.lock().unwrap().push(v));
//!
//! revenue.set(1100);
//! assert_eq!(*seen.lock().unwrap(), vec![200, 300]);
//! ```

mod disposable;
mod error;
pub mod flow;
mod graph;
pub mod support;
mod var;

pub use disposable::{Callbacks, Disposable};
pub use error::{Result, VarError};
pub use flow::{
    CreditLedger, DeliveryState, ErrorRecovery, Recovery, Subscriber, Subscription,
    SubscriptionId, UNBOUNDED,
};
pub use graph::{Evaluation, NodeId, NodeStats, Value};
pub use var::{Leaf, Upstream, Var};
