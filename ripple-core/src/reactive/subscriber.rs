//! Subscriptions
//!
//! A subscription listens to one node in two tiers:
//!
//! 1. A cheap `may_have_changed` callback, registered as a node listener and
//!    called synchronously whenever the node is marked. It should only
//!    schedule work.
//! 2. An `on_change` callback, called by [`Subscription::flush`] with the
//!    confirmed value, at most once per generation of the node.
//!
//! Subscriptions deregister themselves when closed or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::handle::downcast;
use crate::error::{isolate, CallbackOrigin, Result};
use crate::graph::node::{Listener, NodeRef};
use crate::graph::ListenerId;

type ChangeFn<T> = Box<dyn FnMut(&T) + Send>;

/// A lazy listener on one node. Closes on drop.
pub struct Subscription<T> {
    node: NodeRef,
    listener: Option<ListenerId>,
    last_generation: u64,
    on_change: ChangeFn<T>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Register `may_have_changed` on `node` and deliver the current value.
    pub(crate) fn attach(node: NodeRef, may_have_changed: Listener, on_change: ChangeFn<T>) -> Result<Self> {
        let owner = node.owner()?;
        let value: T = downcast(&node, node.value()?)?;
        let listener = node.add_listener(may_have_changed)?;

        let mut subscription = Self {
            last_generation: node.generation(),
            node,
            listener: Some(listener),
            on_change,
        };

        let Self { node, on_change, .. } = &mut subscription;
        isolate(owner.sink(), CallbackOrigin::ChangeCallback, node.origin(), || on_change(&value));
        Ok(subscription)
    }

    /// Flush the node and, if it changed since the last emission, call
    /// `on_change` with the new value. Returns whether it was called.
    pub fn flush(&mut self) -> Result<bool> {
        if self.listener.is_none() {
            return Ok(false);
        }

        self.node.flush()?;
        let generation = self.node.generation();
        if generation == self.last_generation {
            return Ok(false);
        }
        self.last_generation = generation;

        let value: T = downcast(&self.node, self.node.value()?)?;
        let owner = self.node.owner()?;
        let _notifying = owner.enter_notifying(&self.node);
        let on_change = &mut self.on_change;
        isolate(owner.sink(), CallbackOrigin::ChangeCallback, self.node.origin(), || on_change(&value));
        Ok(true)
    }

    /// The node's current value, flushed first.
    pub fn read(&self) -> Result<T> {
        self.node.flush()?;
        downcast(&self.node, self.node.value()?)
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }
}

impl<T> Subscription<T> {
    /// Deregister the listener. Idempotent.
    pub fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.node.remove_listener(listener);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("node", self.node.origin())
            .field("closed", &self.listener.is_none())
            .field("last_generation", &self.last_generation)
            .finish()
    }
}

/// A subscription that emits a projection of the node's value, and only
/// when the projection changes.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use ripple_core::{Provider, ProviderContainer};
///
/// let point = Provider::new(|_| Ok((1, 2)));
/// let container = ProviderContainer::new();
/// let handle = container.node(&point).unwrap();
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let mut selection = container
///     .select(
///         &point,
///         || {},
///         |p: &(i32, i32)| p.0,
///         move |x: &i32| sink.lock().unwrap().push(*x),
///     )
///     .unwrap();
///
/// handle.set((1, 5)).unwrap();
/// assert!(!selection.flush().unwrap());
/// handle.set((3, 5)).unwrap();
/// assert!(selection.flush().unwrap());
///
/// assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
/// ```
pub struct SelectorSubscription<T, S> {
    inner: Subscription<T>,
    selected: Arc<Mutex<Option<S>>>,
    emitted: Arc<AtomicBool>,
}

impl<T, S> SelectorSubscription<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn attach<P, C>(
        node: NodeRef,
        may_have_changed: Listener,
        projection: P,
        mut on_change: C,
    ) -> Result<Self>
    where
        P: Fn(&T) -> S + Send + Sync + 'static,
        C: FnMut(&S) + Send + 'static,
    {
        let selected: Arc<Mutex<Option<S>>> = Arc::new(Mutex::new(None));
        let emitted = Arc::new(AtomicBool::new(false));

        let selected_clone = Arc::clone(&selected);
        let emitted_clone = Arc::clone(&emitted);
        let on_value = move |value: &T| {
            let next = projection(value);
            {
                let mut previous = selected_clone.lock();
                if previous.as_ref() == Some(&next) {
                    return;
                }
                *previous = Some(next.clone());
            }
            emitted_clone.store(true, Ordering::SeqCst);
            on_change(&next);
        };

        let inner = Subscription::attach(node, may_have_changed, Box::new(on_value))?;
        Ok(Self {
            inner,
            selected,
            emitted,
        })
    }

    /// Flush the node and emit the projection if it changed. Returns whether
    /// `on_change` was called.
    pub fn flush(&mut self) -> Result<bool> {
        self.emitted.store(false, Ordering::SeqCst);
        self.inner.flush()?;
        Ok(self.emitted.swap(false, Ordering::SeqCst))
    }

    /// The last emitted projection.
    pub fn selected(&self) -> Option<S> {
        self.selected.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl<T, S: std::fmt::Debug> std::fmt::Debug for SelectorSubscription<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorSubscription")
            .field("inner", &self.inner)
            .field("selected", &*self.selected.lock())
            .finish()
    }
}
