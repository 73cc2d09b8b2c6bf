//! Derived Nodes
//!
//! A derived node caches the result of a combining function over one or more
//! upstream nodes, and re-evaluates when those inputs change.
//!
//! # How Derived Nodes Work
//!
//! 1. At construction, the node subscribes an [`UpstreamHook`] to each input.
//!    Hooks are ordinary subscribers with error recovery, so an upstream
//!    error becomes this node's error instead of killing the hook.
//!
//! 2. When a hook is handed a value, the node recomputes by reading the
//!    cached outcome of every input directly.
//!
//! 3. An eager node keeps exactly one unit of credit outstanding per input,
//!    so every upstream change is pushed through as it happens.
//!
//! 4. A lazy node grants its hooks nothing on its own. Credit only flows
//!    upstream when something downstream of the node requests it, so the
//!    combining function never runs before somebody asks. A pull that finds
//!    nothing new leaves its credit with the hooks, and the next change to
//!    that input is evaluated as soon as it arrives.
//!
//! 5. A derived node holds its inputs strongly. Subscriptions do not keep
//!    anything alive, so a node lives exactly as long as some `Var` or some
//!    downstream node refers to it.
//!
//! # Why Peek
//!
//! When a lazy node pulls from several inputs, each input's delivery
//! triggers a recompute. Recomputing while another input still has a staged
//! value would only produce an intermediate result, so the recompute is
//! skipped until every hook has drained.
//!
//! The staged input may turn out to equal what its node already held, in
//! which case nothing is delivered and nothing triggers the skipped
//! recompute. A pull therefore evaluates once more after every hook has been
//! asked, if the last evaluation was skipped.
//!
//! # Thread Safety
//!
//! Hooks on different inputs may deliver on different threads. Recomputes of
//! one node never overlap: a request to recompute marks the node stale, and
//! whichever thread holds the compute guard keeps evaluating until the node
//! is no longer stale. Results are therefore published in evaluation order.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, trace, warn};

use crate::error::{Result, VarError};
use crate::flow::guard::ReentrancyGuard;
use crate::flow::{ErrorRecovery, Recovery, Subscriber, Subscription, UNBOUNDED};
use crate::var::Upstream;

use super::node::{Node, Source};
use super::Value;

pub(crate) type ComputeFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// When a derived node re-evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Evaluation {
    /// Recompute as soon as an input changes.
    #[default]
    Eager,

    /// Recompute only when a value is pulled.
    Lazy,
}

impl Evaluation {
    pub(crate) fn demand(self) -> Demand {
        match self {
            Self::Eager => Demand::Incremental,
            Self::Lazy => Demand::None,
        }
    }
}

/// Credit a hook grants its upstream on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demand {
    /// Only what downstream requests pass through.
    None,

    /// One unit at construction and one more after each value.
    Incremental,

    /// Everything, once.
    Unbounded,
}

/// The inputs and combining function of a derived node.
pub(crate) struct Derivation<T: Value> {
    evaluation: Evaluation,
    compute: ComputeFn<T>,
    hooks: Vec<Arc<UpstreamHook>>,

    /// Keeps the input nodes alive; their subscriptions only hold them weakly.
    #[allow(dead_code)]
    inputs: Vec<Arc<dyn Any + Send + Sync>>,

    /// An input changed since the last evaluation started.
    stale: AtomicBool,

    /// The last evaluation was skipped for a staged input.
    deferred: AtomicBool,
    computing: ReentrancyGuard,
}

impl<T: Value> Derivation<T> {
    pub(super) fn is_lazy(&self) -> bool {
        self.evaluation == Evaluation::Lazy
    }

    pub(super) fn peek_upstream(&self) -> bool {
        self.hooks.iter().any(|hook| hook.peek())
    }

    pub(super) fn request_upstream(&self, node: &Node<T>, n: u64) {
        if self.hooks.is_empty() {
            self.recompute(node);
            return;
        }
        for hook in &self.hooks {
            hook.request(n);
        }
        if self.deferred.load(Ordering::SeqCst) {
            self.recompute(node);
        }
    }

    pub(super) fn recompute(&self, node: &Node<T>) {
        self.stale.store(true, Ordering::SeqCst);
        while self.stale.load(Ordering::SeqCst) {
            let Some(_token) = self.computing.enter() else {
                trace!(node = %node.id(), "recompute left to the evaluation in progress");
                return;
            };
            while self.stale.swap(false, Ordering::SeqCst) {
                self.evaluate(node);
            }
        }
    }

    fn evaluate(&self, node: &Node<T>) {
        if self.is_lazy() && self.peek_upstream() {
            self.deferred.store(true, Ordering::SeqCst);
            trace!(node = %node.id(), "recompute skipped, an input has a staged value");
            return;
        }
        self.deferred.store(false, Ordering::SeqCst);

        match catch_unwind(AssertUnwindSafe(|| (self.compute)())) {
            Ok(Ok(value)) => node.publish(value),
            Ok(Err(VarError::Uninitialized)) => {
                trace!(node = %node.id(), "recompute skipped, an input has no value yet");
            }
            Ok(Err(error)) => node.publish_error(error),
            Err(payload) => {
                let error = VarError::from_panic(payload);
                warn!(node = %node.id(), error = %error, "combining function panicked");
                node.publish_error(error);
            }
        }
    }
}

impl<T: Value> Drop for Derivation<T> {
    fn drop(&mut self) {
        for hook in &self.hooks {
            hook.cancel();
        }
    }
}

impl<T: Value> Node<T> {
    /// Create a derived node and subscribe its hooks to `inputs`.
    pub(crate) fn derived(
        inputs: &[&dyn Upstream],
        evaluation: Evaluation,
        demand: Demand,
        compute: ComputeFn<T>,
    ) -> Arc<Self> {
        let node = Arc::new_cyclic(|weak: &Weak<Node<T>>| {
            let target: Weak<dyn DerivedTarget> = weak.clone();
            let mut hooks = Vec::with_capacity(inputs.len());
            let mut retained = Vec::with_capacity(inputs.len());
            for input in inputs {
                let hook = Arc::new(UpstreamHook::new(target.clone(), demand));
                retained.push(input.attach(Arc::clone(&hook)));
                hooks.push(hook);
            }

            Node::with_source(Source::Derived(Derivation {
                evaluation,
                compute,
                hooks,
                inputs: retained,
                stale: AtomicBool::new(false),
                deferred: AtomicBool::new(false),
                computing: ReentrancyGuard::new(),
            }))
        });

        if let Some(derivation) = node.derivation() {
            for hook in &derivation.hooks {
                hook.prime();
            }
            if derivation.hooks.is_empty() && !derivation.is_lazy() {
                derivation.recompute(&node);
            }
        }

        node
    }
}

/// What an upstream hook reports back to its derived node.
pub(crate) trait DerivedTarget: Send + Sync {
    fn upstream_changed(&self);
    fn upstream_failed(&self, error: &VarError);
    fn upstream_terminated(&self, error: VarError);
    fn upstream_completed(&self);
}

impl<T: Value> DerivedTarget for Node<T> {
    fn upstream_changed(&self) {
        self.recompute();
    }

    /// The input now caches `error`; recomputing reads it from there.
    fn upstream_failed(&self, error: &VarError) {
        debug!(node = %self.id(), error = %error, "input failed");
        self.recompute();
    }

    fn upstream_terminated(&self, error: VarError) {
        self.publish_error(error);
    }

    fn upstream_completed(&self) {
        self.complete();
    }
}

/// Subscriber a derived node registers on each of its inputs.
///
/// Holds the node weakly; the node owns the hook.
pub struct UpstreamHook {
    target: Weak<dyn DerivedTarget>,
    subscription: OnceLock<Subscription>,
    demand: Demand,
}

impl UpstreamHook {
    fn new(target: Weak<dyn DerivedTarget>, demand: Demand) -> Self {
        Self {
            target,
            subscription: OnceLock::new(),
            demand,
        }
    }

    fn prime(&self) {
        match self.demand {
            Demand::None => {}
            Demand::Incremental => self.request(1),
            Demand::Unbounded => self.request(UNBOUNDED),
        }
    }

    fn request(&self, n: u64) {
        if let Some(subscription) = self.subscription.get() {
            subscription.request(n);
        }
    }

    fn peek(&self) -> bool {
        self.subscription
            .get()
            .is_some_and(Subscription::peek)
    }

    fn cancel(&self) {
        if let Some(subscription) = self.subscription.get() {
            subscription.cancel();
        }
    }
}

impl<A: Value> Subscriber<A> for UpstreamHook {
    fn on_subscribe(&self, subscription: Subscription) {
        if let Err(rejected) = self.subscription.set(subscription) {
            warn!(subscription = %rejected.id(), "upstream hook handed a second subscription");
            rejected.cancel();
        }
    }

    fn on_next(&self, _value: A) {
        if let Some(target) = self.target.upgrade() {
            target.upstream_changed();
        }
        if self.demand == Demand::Incremental {
            self.request(1);
        }
    }

    fn on_error(&self, error: VarError) {
        if let Some(target) = self.target.upgrade() {
            target.upstream_terminated(error);
        }
    }

    fn on_complete(&self) {
        if let Some(target) = self.target.upgrade() {
            target.upstream_completed();
        }
    }

    fn recovery(&self) -> Option<&dyn ErrorRecovery> {
        Some(self)
    }
}

impl ErrorRecovery for UpstreamHook {
    fn recover(&self, error: &VarError, available: u64) -> Result<Recovery> {
        // Lazy nodes only look at an error once it has been pulled.
        if self.demand == Demand::None && available == 0 {
            return Ok(Recovery::Declined);
        }
        // Unreachable target means construction is still running or the
        // node is gone; keep the error staged either way.
        let Some(target) = self.target.upgrade() else {
            return Ok(Recovery::Declined);
        };
        target.upstream_failed(error);

        let consumed = match self.demand {
            Demand::None => 1,
            Demand::Incremental | Demand::Unbounded => 0,
        };
        Ok(Recovery::Recovered { consumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::Var;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_double(
        input: &Var<i32>,
        evaluation: Evaluation,
        calls: &Arc<AtomicUsize>,
    ) -> Arc<Node<i32>> {
        let source = input.clone();
        let calls = Arc::clone(calls);
        Node::derived(
            &[input],
            evaluation,
            evaluation.demand(),
            Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                source.current().map(|x| x * 2)
            }),
        )
    }

    #[test]
    fn eager_node_computes_at_construction() {
        let a = Var::leaf(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let node = counted_double(&a, Evaluation::Eager, &calls);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.cached().unwrap(), 4);

        a.set(5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(node.cached().unwrap(), 10);
    }

    #[test]
    fn lazy_node_waits_for_pull() {
        let a = Var::leaf(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let node = counted_double(&a, Evaluation::Lazy, &calls);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(node.cached(), Err(VarError::Uninitialized)));
        assert!(node.peek_upstream());

        node.request_upstream(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.cached().unwrap(), 4);
        assert!(!node.peek_upstream());
    }

    #[test]
    fn compute_panic_becomes_error() {
        let a = Var::leaf(1);
        let source = a.clone();
        let node: Arc<Node<i32>> = Node::derived(
            &[&*a],
            Evaluation::Eager,
            Demand::Incremental,
            Box::new(move || {
                let x = source.current()?;
                if x == 0 {
                    panic!("division by zero");
                }
                Ok(100 / x)
            }),
        );
        assert_eq!(node.cached().unwrap(), 100);

        a.set(0);
        let error = node.last_error().unwrap();
        assert!(matches!(error, VarError::Panicked(_)));
        assert!(error.to_string().contains("division by zero"));

        a.set(4);
        assert_eq!(node.cached().unwrap(), 25);
    }

    #[test]
    fn dropping_node_cancels_hooks() {
        let a = Var::leaf(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let node = counted_double(&a, Evaluation::Eager, &calls);
        assert_eq!(a.subscriber_count(), 1);

        drop(node);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn nodes_without_inputs_compute_once() {
        let node: Arc<Node<i32>> =
            Node::derived(&[], Evaluation::Eager, Demand::Incremental, Box::new(|| Ok(42)));
        assert_eq!(node.cached().unwrap(), 42);
    }
}
