//! Node Handles
//!
//! Typed views over a node state:
//!
//! - [`NodeHandle`] is the node's own update surface. It is what a provider
//!   implementation uses to change its value and drive the notification
//!   protocol.
//! - [`Dependency`] is the capability one node receives for another through
//!   `depend_on`. It stops working once the requesting node is disposed.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::subscriber::{SelectorSubscription, Subscription};
use crate::error::{GraphError, Result};
use crate::graph::node::{Capability, Node, NodeRef, Value};
use crate::graph::Descriptor;

/// Move an erased value back into typed code.
pub(crate) fn downcast<T>(node: &Node, value: Value) -> Result<T>
where
    T: Clone + 'static,
{
    value.downcast_ref::<T>().cloned().ok_or_else(|| {
        GraphError::protocol(format!(
            "{} does not hold a value of type {}",
            node.origin(),
            type_name::<T>()
        ))
    })
}

/// Typed handle to one node state.
pub struct NodeHandle<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for NodeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            node: NodeRef::clone(&self.node),
            _marker: PhantomData,
        }
    }
}

impl<T> NodeHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(node: NodeRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        self.node.origin()
    }

    /// The current value, without flushing a pending change.
    pub fn state(&self) -> Result<T> {
        downcast(&self.node, self.node.value()?)
    }

    /// Replace the value and mark the node as may have changed. The change
    /// is confirmed by the next flush.
    pub fn set(&self, value: T) -> Result<()> {
        self.node.set_value(Arc::new(value))
    }

    /// Replace the value with `f(current)`.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.state()?;
        self.set(f(&current))
    }

    pub fn mark_may_have_changed(&self) -> Result<()> {
        self.node.mark_may_have_changed()
    }

    /// Confirm or cancel a pending change. No-op on a clean node.
    pub fn flush(&self) -> Result<()> {
        self.node.flush()
    }

    pub fn notify_changed(&self) -> Result<()> {
        self.node.notify_changed()
    }

    pub fn cancel_change_notification(&self) -> Result<()> {
        self.node.cancel_change_notification()
    }

    pub fn is_dirty(&self) -> bool {
        self.node.is_dirty()
    }

    pub fn is_mounted(&self) -> bool {
        self.node.is_mounted()
    }

    /// Number of confirmed changes so far.
    pub fn generation(&self) -> u64 {
        self.node.generation()
    }

    pub fn listener_count(&self) -> usize {
        self.node.listener_count()
    }

    /// Descriptors of the nodes this node read.
    pub fn dependencies(&self) -> Vec<Descriptor> {
        self.node
            .dependencies()
            .iter()
            .map(|node| node.origin().clone())
            .collect()
    }

    /// Descriptors of the nodes that read this node.
    pub fn dependents(&self) -> Vec<Descriptor> {
        self.node
            .dependents()
            .iter()
            .map(|node| node.origin().clone())
            .collect()
    }

    pub fn on_dispose<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.node.on_dispose(Box::new(callback))
    }

    /// Subscribe to the node.
    ///
    /// `on_change` is called right away with the current value, then once
    /// per confirmed change when the subscription is flushed.
    /// `may_have_changed` is called synchronously whenever the node is
    /// marked; it should only schedule a flush.
    pub fn add_lazy_listener<M, C>(&self, may_have_changed: M, on_change: C) -> Result<Subscription<T>>
    where
        M: Fn() + Send + Sync + 'static,
        C: FnMut(&T) + Send + 'static,
    {
        Subscription::attach(
            NodeRef::clone(&self.node),
            Arc::new(may_have_changed),
            Box::new(on_change),
        )
    }

    /// Subscribe to a projection of the node's value. `may_have_changed`
    /// behaves as in [`add_lazy_listener`](Self::add_lazy_listener);
    /// `on_change` only runs when the projection changes.
    pub fn select<S, M, P, C>(
        &self,
        may_have_changed: M,
        projection: P,
        on_change: C,
    ) -> Result<SelectorSubscription<T, S>>
    where
        S: Clone + PartialEq + Send + Sync + 'static,
        M: Fn() + Send + Sync + 'static,
        P: Fn(&T) -> S + Send + Sync + 'static,
        C: FnMut(&S) + Send + 'static,
    {
        SelectorSubscription::attach(
            NodeRef::clone(&self.node),
            Arc::new(may_have_changed),
            projection,
            on_change,
        )
    }

    /// Whether both handles point at the same node state.
    pub fn same_node<U>(&self, other: &NodeHandle<U>) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl<T> std::fmt::Debug for NodeHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.node).finish()
    }
}

/// A capability to read another node, obtained through
/// [`NodeContext::depend_on`](super::NodeContext::depend_on).
pub struct Dependency<T> {
    capability: Capability,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Dependency<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(capability: Capability) -> Self {
        Self {
            capability,
            _marker: PhantomData,
        }
    }

    pub(crate) fn node(&self) -> &NodeRef {
        &self.capability.node
    }

    /// The dependency's current value, flushed first.
    pub fn get(&self) -> Result<T> {
        let node = &self.capability.node;
        if self.is_revoked() {
            return Err(GraphError::disposed(node.origin()));
        }
        node.flush()?;
        downcast(node, node.value()?)
    }

    /// A handle to the dependency's node.
    pub fn handle(&self) -> NodeHandle<T> {
        NodeHandle::new(NodeRef::clone(&self.capability.node))
    }

    /// Whether the requesting node was disposed.
    pub fn is_revoked(&self) -> bool {
        self.capability.revoked.load(Ordering::SeqCst)
    }

    /// Whether both were handed out by the same `depend_on` call.
    pub fn same_capability(&self, other: &Dependency<T>) -> bool {
        Arc::ptr_eq(&self.capability.revoked, &other.capability.revoked)
    }
}

impl<T> Clone for Dependency<T> {
    fn clone(&self) -> Self {
        Self {
            capability: self.capability.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Dependency<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("node", self.capability.node.origin())
            .field("revoked", &self.capability.revoked.load(Ordering::SeqCst))
            .finish()
    }
}
