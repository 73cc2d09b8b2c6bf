//! Value Graph
//!
//! Nodes hold the current value (or error) of a variable and the set of
//! subscriptions that want to hear about changes to it.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Leaf nodes are externally mutable sources of truth.
//! - Derived nodes compute their value from one or more upstream nodes.
//! - Edges are subscriptions: a derived node listens to each input through
//!   an internal hook that subscribes like any other subscriber.
//!
//! Edges are created once, when a derived node is constructed, and never
//! change afterwards.
//!
//! # Ownership
//!
//! A derived node owns strong references to its inputs (its combining
//! function reads them), while inputs only reach their dependents through
//! weak hooks. A live subscription keeps its node alive; once a derived node
//! is dropped it cancels its hooks.

mod derived;
mod node;

pub use derived::Evaluation;
pub(crate) use derived::{Demand, UpstreamHook};
pub(crate) use node::Node;
pub use node::{NodeId, NodeStats};

/// Payload carried by a node.
///
/// Equality is what suppresses redundant updates: publishing a value equal to
/// the cached one delivers nothing.
pub trait Value: Clone + PartialEq + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + PartialEq + Send + Sync + 'static {}
