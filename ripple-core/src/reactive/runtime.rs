//! Typed Container Surface
//!
//! The graph stores values type-erased. These methods are where a typed
//! [`Provider<T>`] goes in and a `T` (or a typed handle) comes out.
//!
//! Every entry point reads through the container, so the node is built on
//! first use and flushed before anything is returned.

use super::handle::{downcast, NodeHandle};
use super::provider::Provider;
use super::subscriber::{SelectorSubscription, Subscription};
use crate::error::Result;
use crate::graph::ProviderContainer;

impl ProviderContainer {
    /// Read `provider`'s value, building its node if needed.
    pub fn read<T>(&self, provider: &Provider<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let node = self.inner.read_node(&provider.erased())?;
        downcast(&node, node.value()?)
    }

    /// A handle to `provider`'s node, building it if needed.
    pub fn node<T>(&self, provider: &Provider<T>) -> Result<NodeHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let node = self.inner.read_node(&provider.erased())?;
        Ok(NodeHandle::new(node))
    }

    /// Subscribe to `provider`. `may_have_changed` runs whenever the node is
    /// marked and should only schedule a flush. `on_change` gets the current
    /// value right away and every confirmed change after that, on flush.
    pub fn listen<T, M, C>(
        &self,
        provider: &Provider<T>,
        may_have_changed: M,
        on_change: C,
    ) -> Result<Subscription<T>>
    where
        T: Clone + Send + Sync + 'static,
        M: Fn() + Send + Sync + 'static,
        C: FnMut(&T) + Send + 'static,
    {
        self.node(provider)?.add_lazy_listener(may_have_changed, on_change)
    }

    /// Subscribe to a projection of `provider`'s value.
    pub fn select<T, S, M, P, C>(
        &self,
        provider: &Provider<T>,
        may_have_changed: M,
        projection: P,
        on_change: C,
    ) -> Result<SelectorSubscription<T, S>>
    where
        T: Clone + Send + Sync + 'static,
        S: Clone + PartialEq + Send + Sync + 'static,
        M: Fn() + Send + Sync + 'static,
        P: Fn(&T) -> S + Send + Sync + 'static,
        C: FnMut(&S) + Send + 'static,
    {
        self.node(provider)?.select(may_have_changed, projection, on_change)
    }
}
