//! Vars
//!
//! A [`Var`] is a handle to a node in the value graph. Leaves are set from
//! outside; everything else is derived from other vars through a combining
//! function.
//!
//! # Example
//!
//! ```rust
//! use vars_core::Var;
//!
//! let revenue = Var::leaf(1000);
//! let expenses = Var::leaf(800);
//! let earnings = revenue.combine(&expenses, |r, e| r - e);
//!
//! assert_eq!(earnings.get().unwrap(), 200);
//!
//! revenue.set(1100);
//! assert_eq!(earnings.get().unwrap(), 300);
//! ```
//!
//! # Reading
//!
//! - [`Var::get`] pulls first if the var is lazy, then returns the cached
//!   outcome.
//! - [`Var::current`] returns the cached outcome as is. Combining functions
//!   use it to read their inputs.
//!
//! # Handles
//!
//! Cloning a `Var` clones the handle, not the node. A derived node stays
//! alive while any handle, dependent node, or live subscription refers to it.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::disposable::{CallbackSubscriber, Callbacks, Disposable};
use crate::error::{Result, VarError};
use crate::flow::Subscriber;
use crate::graph::{Demand, Evaluation, Node, NodeId, NodeStats, UpstreamHook, Value};

/// Anything a derived var can read from.
///
/// Implemented by [`Var`] and [`Leaf`]; it cannot be implemented outside
/// this crate.
pub trait Upstream: Send + Sync {
    /// Subscribe `hook` and return the node to keep alive.
    #[doc(hidden)]
    fn attach(&self, hook: Arc<UpstreamHook>) -> Arc<dyn Any + Send + Sync>;
}

/// Read-only handle to a node.
pub struct Var<T: Value> {
    node: Arc<Node<T>>,
}

impl<T: Value> Var<T> {
    /// Create a leaf holding `value`.
    pub fn leaf(value: T) -> Leaf<T> {
        Leaf::new(value)
    }

    /// Eagerly derive a var from `inputs`.
    ///
    /// `compute` reads its inputs through [`Var::current`]; returning
    /// `Err(VarError::Uninitialized)` means "inputs not ready" and publishes
    /// nothing.
    pub fn derive<F>(inputs: &[&dyn Upstream], compute: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::derive_with(inputs, Evaluation::Eager, compute)
    }

    /// Lazily derive a var from `inputs`. Nothing is computed until a value
    /// is pulled.
    pub fn lazy_derive<F>(inputs: &[&dyn Upstream], compute: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::derive_with(inputs, Evaluation::Lazy, compute)
    }

    /// Derive a var from `inputs` with the given evaluation strategy.
    pub fn derive_with<F>(inputs: &[&dyn Upstream], evaluation: Evaluation, compute: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            node: Node::derived(inputs, evaluation, evaluation.demand(), Box::new(compute)),
        }
    }

    /// Get the var's unique ID.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Whether this var only recomputes when pulled.
    pub fn is_lazy(&self) -> bool {
        self.node.is_lazy()
    }

    /// Get the current value, pulling from upstream first if lazy.
    pub fn get(&self) -> Result<T> {
        if self.node.is_lazy() {
            self.node.request_upstream(1);
        }
        self.node.cached()
    }

    /// Get the cached outcome without pulling.
    ///
    /// Fails with [`VarError::Uninitialized`] if the var never held a value.
    pub fn current(&self) -> Result<T> {
        self.node.cached()
    }

    /// The cached value, if the var currently holds one.
    pub fn last_value(&self) -> Option<T> {
        self.node.last_value()
    }

    /// The cached error, if the var is currently failed.
    pub fn last_error(&self) -> Option<VarError> {
        self.node.last_error()
    }

    /// Eagerly map this var through `f`.
    pub fn map<U, F>(&self, f: F) -> Var<U>
    where
        U: Value,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.map_with(Evaluation::Eager, move |value| Ok(f(value)))
    }

    /// Eagerly map this var through a fallible `f`.
    pub fn try_map<U, F>(&self, f: F) -> Var<U>
    where
        U: Value,
        F: Fn(&T) -> Result<U> + Send + Sync + 'static,
    {
        self.map_with(Evaluation::Eager, f)
    }

    /// Lazily map this var through `f`.
    pub fn lazy_map<U, F>(&self, f: F) -> Var<U>
    where
        U: Value,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.map_with(Evaluation::Lazy, move |value| Ok(f(value)))
    }

    /// Lazily map this var through a fallible `f`.
    pub fn lazy_try_map<U, F>(&self, f: F) -> Var<U>
    where
        U: Value,
        F: Fn(&T) -> Result<U> + Send + Sync + 'static,
    {
        self.map_with(Evaluation::Lazy, f)
    }

    /// Eagerly combine this var with `other`.
    pub fn combine<B, U, F>(&self, other: &impl AsRef<Var<B>>, f: F) -> Var<U>
    where
        B: Value,
        U: Value,
        F: Fn(&T, &B) -> U + Send + Sync + 'static,
    {
        self.combine_with(other.as_ref(), Evaluation::Eager, move |a, b| Ok(f(a, b)))
    }

    /// Eagerly combine this var with `other` through a fallible `f`.
    pub fn try_combine<B, U, F>(&self, other: &impl AsRef<Var<B>>, f: F) -> Var<U>
    where
        B: Value,
        U: Value,
        F: Fn(&T, &B) -> Result<U> + Send + Sync + 'static,
    {
        self.combine_with(other.as_ref(), Evaluation::Eager, f)
    }

    /// Lazily combine this var with `other`.
    pub fn lazy_combine<B, U, F>(&self, other: &impl AsRef<Var<B>>, f: F) -> Var<U>
    where
        B: Value,
        U: Value,
        F: Fn(&T, &B) -> U + Send + Sync + 'static,
    {
        self.combine_with(other.as_ref(), Evaluation::Lazy, move |a, b| Ok(f(a, b)))
    }

    /// Lazily combine this var with `other` through a fallible `f`.
    pub fn lazy_try_combine<B, U, F>(&self, other: &impl AsRef<Var<B>>, f: F) -> Var<U>
    where
        B: Value,
        U: Value,
        F: Fn(&T, &B) -> Result<U> + Send + Sync + 'static,
    {
        self.combine_with(other.as_ref(), Evaluation::Lazy, f)
    }

    /// A var with the same values that recomputes this one on every change.
    ///
    /// Grants unbounded demand, so a lazy chain behind it becomes push-driven.
    /// Returns a plain clone if this var is already eager.
    pub fn eager(&self) -> Var<T> {
        if !self.is_lazy() {
            return self.clone();
        }

        let source = self.clone();
        Var {
            node: Node::derived(
                &[self],
                Evaluation::Eager,
                Demand::Unbounded,
                Box::new(move || source.current()),
            ),
        }
    }

    /// Register a raw protocol subscriber.
    ///
    /// The subscriber is handed its [`Subscription`](crate::Subscription)
    /// first and receives nothing until it requests credit.
    ///
    /// The subscription does not keep the var alive. Once the last handle to
    /// the node is dropped the subscriber is sent `on_complete`.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.node.subscribe(subscriber);
    }

    /// Call `on_value` for every value, one credit at a time.
    ///
    /// Errors are logged, since there is no callback to hand them to.
    pub fn subscribe_fn<F>(&self, on_value: F) -> Disposable
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_callbacks(Callbacks::new(on_value))
    }

    /// Subscribe a set of callbacks, one credit at a time.
    pub fn subscribe_callbacks(&self, callbacks: Callbacks<T>) -> Disposable {
        let subscriber = Arc::new(CallbackSubscriber::new(callbacks));
        self.node.subscribe(subscriber.clone());
        Disposable::new(subscriber)
    }

    /// Terminate every subscription with the end-of-stream signal.
    ///
    /// Dependent vars pass the signal on to their own subscribers.
    pub fn complete(&self) {
        self.node.complete();
    }

    /// Number of live subscriptions, including those of dependent vars.
    pub fn subscriber_count(&self) -> usize {
        self.node.subscriber_count()
    }

    /// Diagnostic snapshot of the underlying node.
    pub fn stats(&self) -> NodeStats {
        self.node.stats()
    }

    fn map_with<U, F>(&self, evaluation: Evaluation, f: F) -> Var<U>
    where
        U: Value,
        F: Fn(&T) -> Result<U> + Send + Sync + 'static,
    {
        let source = self.clone();
        Var::derive_with(&[self], evaluation, move || f(&source.current()?))
    }

    fn combine_with<B, U, F>(&self, other: &Var<B>, evaluation: Evaluation, f: F) -> Var<U>
    where
        B: Value,
        U: Value,
        F: Fn(&T, &B) -> Result<U> + Send + Sync + 'static,
    {
        let (left, right) = (self.clone(), other.clone());
        Var::derive_with(&[self, other], evaluation, move || {
            let a = left.current()?;
            let b = right.current()?;
            f(&a, &b)
        })
    }
}

impl<T: Value> Clone for Var<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T: Value> AsRef<Var<T>> for Var<T> {
    fn as_ref(&self) -> &Var<T> {
        self
    }
}

impl<T: Value> Upstream for Var<T> {
    fn attach(&self, hook: Arc<UpstreamHook>) -> Arc<dyn Any + Send + Sync> {
        self.node.subscribe(hook);
        self.node.clone()
    }
}

impl<T> fmt::Debug for Var<T>
where
    T: Value + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id())
            .field("value", &self.current())
            .field("lazy", &self.is_lazy())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// A var that can be set from outside the graph.
///
/// Dereferences to [`Var`] for everything except mutation.
pub struct Leaf<T: Value> {
    var: Var<T>,
}

impl<T: Value> Leaf<T> {
    /// Create a new leaf with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            var: Var {
                node: Node::leaf(value),
            },
        }
    }

    /// Set a new value and push it to subscribers.
    ///
    /// A value equal to the current one is cached but not delivered.
    pub fn set(&self, value: T) {
        self.var.node.publish(value);
    }

    /// Update the value using a function of the current one.
    ///
    /// Not atomic: a `set` or `update` from another thread between the read
    /// and the write is overwritten.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        if let Some(current) = self.var.last_value() {
            self.set(f(&current));
        }
    }

    /// Read-only handle to the same node.
    pub fn to_var(&self) -> Var<T> {
        self.var.clone()
    }
}

impl<T: Value> Clone for Leaf<T> {
    fn clone(&self) -> Self {
        Self {
            var: self.var.clone(),
        }
    }
}

impl<T: Value> Deref for Leaf<T> {
    type Target = Var<T>;

    fn deref(&self) -> &Var<T> {
        &self.var
    }
}

impl<T: Value> AsRef<Var<T>> for Leaf<T> {
    fn as_ref(&self) -> &Var<T> {
        &self.var
    }
}

impl<T: Value> From<Leaf<T>> for Var<T> {
    fn from(leaf: Leaf<T>) -> Self {
        leaf.var
    }
}

impl<T: Value> Upstream for Leaf<T> {
    fn attach(&self, hook: Arc<UpstreamHook>) -> Arc<dyn Any + Send + Sync> {
        self.var.attach(hook)
    }
}

impl<T> fmt::Debug for Leaf<T>
where
    T: Value + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Leaf").field(&self.var).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn leaf_get_set() {
        let leaf = Var::leaf(0);
        assert_eq!(leaf.get().unwrap(), 0);

        leaf.set(5);
        assert_eq!(leaf.get().unwrap(), 5);
    }

    #[test]
    fn leaf_update() {
        let leaf = Var::leaf(10);
        leaf.update(|x| x + 5);
        assert_eq!(leaf.get().unwrap(), 15);
    }

    #[test]
    fn map_follows_leaf() {
        let a = Var::leaf(2);
        let doubled = a.map(|x| x * 2);
        assert_eq!(doubled.get().unwrap(), 4);

        a.set(21);
        assert_eq!(doubled.current().unwrap(), 42);
    }

    #[test]
    fn lazy_map_pulls_on_get() {
        let a = Var::leaf(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let doubled = a.lazy_map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * 2
        });

        assert!(doubled.is_lazy());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(doubled.current(), Err(VarError::Uninitialized)));

        assert_eq!(doubled.get().unwrap(), 4);
        a.set(3);
        assert_eq!(doubled.current().unwrap(), 4);
        assert_eq!(doubled.get().unwrap(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn combine_reads_both_inputs() {
        let revenue = Var::leaf(1000);
        let expenses = Var::leaf(800);
        let earnings = revenue.combine(&expenses, |r, e| r - e);
        assert_eq!(earnings.get().unwrap(), 200);

        expenses.set(900);
        assert_eq!(earnings.get().unwrap(), 100);
    }

    #[test]
    fn lazy_combine_computes_once_per_pull() {
        let x = Var::leaf(2);
        let y = Var::leaf(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sum = x.lazy_combine(&y, move |a, b| {
            counter.fetch_add(1, Ordering::SeqCst);
            a + b
        });

        assert_eq!(sum.get().unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        x.set(20);
        y.set(30);
        assert_eq!(sum.get().unwrap(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn try_map_publishes_errors() {
        let a = Var::leaf(10);
        let checked = a.try_map(|x| {
            if *x < 0 {
                Err(VarError::msg("value < 0"))
            } else {
                Ok(*x)
            }
        });
        assert_eq!(checked.get().unwrap(), 10);

        a.set(-1);
        assert_eq!(checked.get().unwrap_err().to_string(), "value < 0");
        assert_eq!(checked.last_value(), None);

        a.set(40);
        assert_eq!(checked.last_value(), Some(40));
        assert!(checked.last_error().is_none());
    }

    #[test]
    fn errors_flow_through_chains() {
        let a = Var::leaf(1);
        let b = a.try_map(|x| {
            if *x == 0 {
                Err(VarError::msg("division by zero"))
            } else {
                Ok(100 / x)
            }
        });
        let c = b.map(|x| x + 1);
        assert_eq!(c.get().unwrap(), 101);

        a.set(0);
        assert_eq!(c.get().unwrap_err().to_string(), "division by zero");

        a.set(1);
        assert_eq!(c.get().unwrap(), 101);
    }

    #[test]
    fn derive_over_many_inputs() {
        let a = Var::leaf(1);
        let b = Var::leaf(2);
        let c = Var::leaf(3);
        let (ra, rb, rc) = (a.to_var(), b.to_var(), c.to_var());
        let total = Var::derive(&[&a, &b, &c], move || {
            Ok(ra.current()? + rb.current()? + rc.current()?)
        });
        assert_eq!(total.get().unwrap(), 6);

        c.set(30);
        assert_eq!(total.get().unwrap(), 33);
    }

    #[test]
    fn eager_promotes_lazy_chain() {
        let a = Var::leaf(1);
        let lazy = a.lazy_map(|x| x * 10);
        let eager = lazy.eager();

        assert!(!eager.is_lazy());
        assert_eq!(eager.current().unwrap(), 10);

        a.set(2);
        assert_eq!(lazy.current().unwrap(), 20);
        assert_eq!(eager.current().unwrap(), 20);
    }

    #[test]
    fn eager_of_eager_is_same_node() {
        let a = Var::leaf(1);
        let b = a.map(|x| x + 1);
        assert_eq!(b.eager().id(), b.id());
    }

    #[test]
    fn dropping_derived_detaches_from_leaf() {
        let a = Var::leaf(1);
        let b = a.map(|x| x + 1);
        assert_eq!(a.subscriber_count(), 1);

        drop(b);
        assert_eq!(a.subscriber_count(), 0);
    }

    /// Counts how often any copy of it is dropped.
    #[derive(Clone)]
    struct Tracked {
        id: i32,
        drops: Arc<AtomicUsize>,
    }

    impl PartialEq for Tracked {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn subscribed_leaf_is_freed_when_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let leaf = Var::leaf(Tracked {
            id: 1,
            drops: Arc::clone(&drops),
        });

        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let handle = leaf.subscribe_callbacks(
            Callbacks::new(|_: Tracked| {}).on_complete(move || flag.store(true, Ordering::SeqCst)),
        );
        // Only the delivered copy so far
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(leaf);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(completed.load(Ordering::SeqCst));
        assert!(handle.is_disposed());
    }

    #[test]
    fn dropping_derived_completes_its_subscribers() {
        let a = Var::leaf(1);
        let b = a.map(|x| x * 2);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = b.subscribe_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(b);
        assert!(handle.is_disposed());
        assert_eq!(a.subscriber_count(), 0);

        a.set(2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn derived_var_keeps_its_inputs_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let derived = {
            let input = Var::leaf(Tracked {
                id: 1,
                drops: Arc::clone(&drops),
            });
            Var::lazy_derive(&[&input], || Ok(0))
        };
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(derived);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
