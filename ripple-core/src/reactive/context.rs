//! Node Context
//!
//! The context handed to an initializer. It is the node's view of the rest
//! of the graph: every provider read through it becomes a dependency of the
//! node being built.
//!
//! # Implementation
//!
//! Reads resolve through the container that constructed the node, not the
//! container the read started from, so a node shared by a child container
//! keeps the dependencies its own container gave it.
//!
//! Dependencies are memoized per requesting node: asking for the same
//! provider again hands back the same capability without touching the
//! container.

use std::marker::PhantomData;
use std::sync::Arc;

use super::handle::{Dependency, NodeHandle};
use super::provider::Provider;
use crate::error::Result;
use crate::graph::node::NodeRef;
use crate::graph::owner::ContainerInner;
use crate::graph::Descriptor;

/// What an initializer can do with the graph while it builds its node.
pub struct NodeContext<T> {
    node: NodeRef,
    owner: Arc<ContainerInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NodeContext<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(node: NodeRef, owner: Arc<ContainerInner>) -> Self {
        Self {
            node,
            owner,
            _marker: PhantomData,
        }
    }

    /// The descriptor of the node being built.
    pub fn descriptor(&self) -> &Descriptor {
        self.node.origin()
    }

    /// Depend on `provider` and get a capability to read it.
    ///
    /// Adds the edge between the two nodes. Disposing this node removes the
    /// edge and revokes the capability. Depending on a node that (directly
    /// or transitively) depends on this one fails with
    /// [`CircularDependency`](crate::GraphError::CircularDependency).
    pub fn depend_on<U>(&self, provider: &Provider<U>) -> Result<Dependency<U>>
    where
        U: Clone + Send + Sync + 'static,
    {
        let key = provider.descriptor().key();
        if let Some(capability) = self.node.capability(key)? {
            return Ok(Dependency::new(capability));
        }

        let target = self.owner.read_node(&provider.erased())?;
        let capability = self.node.link(key, &target)?;
        Ok(Dependency::new(capability))
    }

    /// Depend on `provider` and return its current value.
    pub fn read<U>(&self, provider: &Provider<U>) -> Result<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.depend_on(provider)?.get()
    }

    /// Like [`read`](Self::read), and also mark this node as may have
    /// changed whenever `provider`'s node is.
    pub fn watch<U>(&self, provider: &Provider<U>) -> Result<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        let dependency = self.depend_on(provider)?;
        self.node.watch(dependency.node())?;
        dependency.get()
    }

    /// Register a callback that runs when this node is disposed.
    pub fn on_dispose<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.node.on_dispose(Box::new(callback))
    }

    /// A handle to the node being built, for use after the initializer
    /// returns (timers, background work).
    pub fn handle(&self) -> NodeHandle<T> {
        NodeHandle::new(NodeRef::clone(&self.node))
    }
}

impl<T> std::fmt::Debug for NodeContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", self.node.origin())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProviderContainer;
    use crate::GraphError;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn depend_on_is_memoized() {
        let base = Provider::new(|_| Ok(1));
        let same = Arc::new(AtomicI32::new(0));
        let same_clone = same.clone();
        let reader = {
            let base = base.clone();
            Provider::new(move |ctx| {
                let first = ctx.depend_on(&base)?;
                let second = ctx.depend_on(&base)?;
                if first.same_capability(&second) {
                    same_clone.fetch_add(1, Ordering::SeqCst);
                }
                first.get()
            })
        };

        let container = ProviderContainer::new();
        assert_eq!(container.read(&reader).unwrap(), 1);
        assert_eq!(same.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reading_self_is_circular() {
        let slot: Arc<parking_lot::Mutex<Option<Provider<i32>>>> = Arc::default();
        let slot_clone = slot.clone();
        let provider = Provider::new(move |ctx| {
            let this = slot_clone.lock().clone();
            match this {
                Some(this) => ctx.read(&this),
                None => Ok(0),
            }
        });
        *slot.lock() = Some(provider.clone());

        let container = ProviderContainer::new();
        let error = container.read(&provider).unwrap_err();
        assert!(error.is_circular());
    }

    #[test]
    fn on_dispose_runs_once_on_container_dispose() {
        let disposed = Arc::new(AtomicI32::new(0));
        let disposed_clone = disposed.clone();
        let provider = Provider::new(move |ctx| {
            let disposed = disposed_clone.clone();
            ctx.on_dispose(move || {
                disposed.fetch_add(1, Ordering::SeqCst);
            })?;
            Ok(())
        });

        let container = ProviderContainer::new();
        container.read(&provider).unwrap();
        container.dispose().unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_survives_the_initializer() {
        let escaped: Arc<parking_lot::Mutex<Option<NodeHandle<i32>>>> = Arc::default();
        let escaped_clone = escaped.clone();
        let provider = Provider::new(move |ctx| {
            *escaped_clone.lock() = Some(ctx.handle());
            Ok(1)
        });

        let container = ProviderContainer::new();
        container.read(&provider).unwrap();

        let handle = escaped.lock().clone().unwrap();
        handle.set(5).unwrap();
        assert_eq!(container.read(&provider).unwrap(), 5);

        container.dispose().unwrap();
        assert!(matches!(handle.set(6), Err(GraphError::AlreadyDisposed { .. })));
    }
}
