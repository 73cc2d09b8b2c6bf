//! Graph Nodes
//!
//! A node caches the latest outcome of a variable (a value or an error) and
//! owns the downstream subscriptions registered against it.
//!
//! # Versions
//!
//! Every publication that changes the cached outcome bumps the node's
//! version. Subscriptions remember the version they last delivered, which is
//! how a staged item is told apart from one that was already seen.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{Result, VarError};
use crate::flow::downstream::Downstream;
use crate::flow::{DeliveryState, Subscriber, SubscriptionId};

use super::derived::Derivation;
use super::Value;

/// Unique identifier for a node in the value graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Where a node's values come from.
pub(super) enum Source<T: Value> {
    /// Set from outside through [`Leaf`](crate::Leaf).
    Leaf,

    /// Computed from upstream nodes.
    Derived(Derivation<T>),
}

/// Versioned cache cell.
struct Current<T> {
    version: u64,
    outcome: Option<Result<T>>,
}

/// Point-in-time snapshot of a node, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NodeStats {
    pub id: NodeId,
    pub lazy: bool,
    pub version: u64,
    pub has_value: bool,
    pub has_error: bool,
    pub subscribers: usize,

    /// Subscriptions holding an item they could not deliver yet.
    pub staged: usize,
}

type Snapshot<T> = SmallVec<[Arc<Downstream<T>>; 4]>;

/// A value in the graph.
pub(crate) struct Node<T: Value> {
    id: NodeId,
    current: RwLock<Current<T>>,
    subscriptions: DashMap<SubscriptionId, Arc<Downstream<T>>>,
    source: Source<T>,
}

impl<T: Value> Node<T> {
    /// Create a leaf node holding `value`.
    pub(crate) fn leaf(value: T) -> Arc<Self> {
        let node = Self::with_source(Source::Leaf);
        {
            let mut current = node.current.write();
            current.version = 1;
            current.outcome = Some(Ok(value));
        }
        Arc::new(node)
    }

    /// Create an empty node. Derived nodes start here and fill in on their
    /// first recompute.
    pub(super) fn with_source(source: Source<T>) -> Self {
        Self {
            id: NodeId::new(),
            current: RwLock::new(Current {
                version: 0,
                outcome: None,
            }),
            subscriptions: DashMap::new(),
            source,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(super) fn derivation(&self) -> Option<&Derivation<T>> {
        match &self.source {
            Source::Leaf => None,
            Source::Derived(derivation) => Some(derivation),
        }
    }

    /// Whether values are only computed on demand.
    pub(crate) fn is_lazy(&self) -> bool {
        self.derivation().is_some_and(Derivation::is_lazy)
    }

    /// Register `subscriber`, then offer it whatever the node holds now.
    pub(crate) fn subscribe(self: &Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let downstream = Downstream::new(self, subscriber);
        let id = downstream.id();
        debug!(node = %self.id, subscription = %id, "subscribing");

        let opened = downstream.handshake(|| {
            self.subscriptions.insert(id, Arc::clone(&downstream));
        });
        if !opened {
            return;
        }

        let existing = {
            let current = self.current.read();
            match &current.outcome {
                Some(Ok(_)) => Some(Ok(())),
                Some(Err(error)) => Some(Err(error.clone())),
                None => None,
            }
        };
        match existing {
            Some(Ok(())) => downstream.offer_value(),
            Some(Err(error)) => downstream.offer_error(error),
            None => {}
        }
    }

    /// Cache `value` and offer it to every subscription if it differs from
    /// the previous outcome.
    pub(crate) fn publish(&self, value: T) {
        let version = {
            let mut current = self.current.write();
            let changed = !matches!(&current.outcome, Some(Ok(previous)) if *previous == value);
            current.outcome = Some(Ok(value));
            if !changed {
                None
            } else {
                current.version += 1;
                Some(current.version)
            }
        };

        let Some(version) = version else {
            trace!(node = %self.id, "value unchanged, nothing published");
            return;
        };

        trace!(node = %self.id, version, "publishing value");
        for downstream in self.snapshot() {
            downstream.offer_value();
        }
    }

    /// Cache `error` and offer it to every subscription.
    pub(crate) fn publish_error(&self, error: VarError) {
        let version = {
            let mut current = self.current.write();
            current.outcome = Some(Err(error.clone()));
            current.version += 1;
            current.version
        };

        debug!(node = %self.id, version, error = %error, "publishing error");
        for downstream in self.snapshot() {
            downstream.offer_error(error.clone());
        }
    }

    /// Terminate every subscription with the end-of-stream signal.
    pub(crate) fn complete(&self) {
        debug!(node = %self.id, subscribers = self.subscriptions.len(), "completing");
        for downstream in self.snapshot() {
            downstream.complete();
        }
    }

    pub(crate) fn remove_subscription(&self, id: SubscriptionId) {
        if self.subscriptions.remove(&id).is_some() {
            trace!(node = %self.id, subscription = %id, "subscription removed");
        }
    }

    /// The cached value and the version it was published under. `None` while
    /// the node holds an error or nothing at all.
    pub(crate) fn latest_value(&self) -> Option<(u64, T)> {
        let current = self.current.read();
        match &current.outcome {
            Some(Ok(value)) => Some((current.version, value.clone())),
            _ => None,
        }
    }

    /// The cached outcome, without pulling.
    pub(crate) fn cached(&self) -> Result<T> {
        self.current
            .read()
            .outcome
            .clone()
            .unwrap_or(Err(VarError::Uninitialized))
    }

    pub(crate) fn last_value(&self) -> Option<T> {
        match &self.current.read().outcome {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn last_error(&self) -> Option<VarError> {
        match &self.current.read().outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Pull `n` from every upstream of a derived node.
    pub(crate) fn request_upstream(&self, n: u64) {
        if let Some(derivation) = self.derivation() {
            derivation.request_upstream(self, n);
        }
    }

    /// Whether any upstream hook has a staged, undelivered item.
    pub(crate) fn peek_upstream(&self) -> bool {
        self.derivation().is_some_and(Derivation::peek_upstream)
    }

    /// Recompute a derived node from the cached outcomes of its inputs.
    pub(crate) fn recompute(&self) {
        if let Some(derivation) = self.derivation() {
            derivation.recompute(self);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn stats(&self) -> NodeStats {
        let (version, has_value, has_error) = {
            let current = self.current.read();
            (
                current.version,
                matches!(current.outcome, Some(Ok(_))),
                matches!(current.outcome, Some(Err(_))),
            )
        };
        let snapshot = self.snapshot();
        let staged = snapshot
            .iter()
            .filter(|downstream| downstream.state() == DeliveryState::ItemAvailable)
            .count();

        NodeStats {
            id: self.id,
            lazy: self.is_lazy(),
            version,
            has_value,
            has_error,
            subscribers: snapshot.len(),
            staged,
        }
    }

    /// Copy the subscription set so callbacks may subscribe or cancel while
    /// it is being walked.
    fn snapshot(&self) -> Snapshot<T> {
        self.subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// A dropped node can never change again, so its streams end here.
impl<T: Value> Drop for Node<T> {
    fn drop(&mut self) {
        if !self.subscriptions.is_empty() {
            self.complete();
        }
    }
}

impl<T: Value> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.read();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("version", &current.version)
            .field("lazy", &self.is_lazy())
            .field("subscribers", &self.subscriptions.len())
            .finish()
    }
}
