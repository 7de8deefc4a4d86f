//! Graph Nodes
//!
//! This module defines the runtime record for one instantiated node: its
//! value slot, dirty and mounted flags, listeners, dependency edges and
//! disposal callbacks.
//!
//! # Lifecycle
//!
//! 1. A node is created by a reader on the first read of its descriptor, in
//!    the `Uninitialized` slot with `dirty == true`.
//!
//! 2. `ensure_built` runs the provider's initializer once. The slot becomes
//!    `Ready` or, if the initializer fails, a sticky `Failed`. Either way the
//!    dirty flag is forced to `false`.
//!
//! 3. `mark_may_have_changed` sets the dirty flag and pings every listener.
//!    `flush` later confirms the change (bumping the generation) or, for
//!    derived nodes whose recomputed value is unchanged, cancels it.
//!
//! 4. `dispose` runs the disposal callbacks and unmounts the node for good.
//!
//! # Locking
//!
//! Each node's mutable state sits behind its own mutex. The lock is only held
//! to read or write fields; it is always released before calling into user
//! code (initializers, listeners, observers, disposal callbacks), which may
//! re-enter the graph.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::descriptor::{Descriptor, NodeKey};
use super::owner::ContainerInner;
use super::scheduler;
use crate::error::{isolate, panic_message, CallbackOrigin, GraphError, Result};

/// Type-erased node value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Type-erased provider stored on a node.
pub(crate) type ErasedProvider = Arc<dyn AnyProvider>;

pub(crate) type NodeRef = Arc<Node>;

/// What the graph needs from a provider definition.
///
/// The typed [`Provider<T>`](crate::Provider) implements this; the graph only
/// ever sees the erased form.
pub(crate) trait AnyProvider: Send + Sync + 'static {
    /// The provider's own descriptor.
    fn descriptor(&self) -> &Descriptor;

    /// Whether nodes running this provider recompute on flush. Asked of the
    /// installed provider, which differs from the node's origin under an
    /// override.
    fn is_derived(&self) -> bool {
        self.descriptor().is_derived()
    }

    /// Run the initializer for `node`.
    fn build(&self, node: &NodeRef, owner: &Arc<ContainerInner>) -> Result<Value>;

    /// Re-run a derived node's initializer. Returns `None` when the new value
    /// equals the current one.
    fn recompute(&self, node: &NodeRef, owner: &Arc<ContainerInner>) -> Result<Option<Value>>;

    /// Called on the new provider after it replaced `previous` on a live node.
    fn did_update_provider(&self, node: &NodeRef, previous: ErasedProvider) -> Result<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Unique identifier for a node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Identifier of a lazy listener registered on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The value slot of a node.
pub(crate) enum Slot {
    /// Created but never built.
    Uninitialized,

    /// The initializer is running. Reading the node again now is a cycle.
    Building,

    /// Built successfully.
    Ready(Value),

    /// The initializer failed. Re-surfaced verbatim on every read.
    Failed(Arc<GraphError>),
}

pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

type DisposeCallback = Box<dyn FnOnce() + Send>;

/// A dependency handed to a requesting node, memoized per requester.
#[derive(Debug, Clone)]
pub(crate) struct Capability {
    pub(crate) node: NodeRef,
    pub(crate) revoked: Arc<AtomicBool>,
}

/// A node state in the dependency graph.
pub(crate) struct Node {
    /// Unique identifier for this node state.
    id: NodeId,

    /// The descriptor the node was read through (the override origin, not
    /// the replacement).
    origin: Descriptor,

    /// The container that constructed this node. Only it may dispose it.
    owner: Weak<ContainerInner>,

    inner: Mutex<NodeInner>,
}

struct NodeInner {
    provider: ErasedProvider,
    slot: Slot,
    dirty: bool,
    mounted: bool,

    /// Set once teardown starts. New registrations are refused from then on.
    disposing: bool,
    generation: u64,

    /// Nodes this node has read.
    dependencies: IndexMap<NodeId, NodeRef>,

    /// Nodes that have read this node. Held weakly so the graph has no
    /// strong cycles.
    dependents: IndexMap<NodeId, Weak<Node>>,

    listeners: IndexMap<ListenerId, Listener>,
    dispose_callbacks: Vec<DisposeCallback>,

    /// `depend_on` results, keyed by the requested descriptor.
    capabilities: HashMap<NodeKey, Capability>,

    /// Dependencies this node already listens to through `watch`.
    watching: HashSet<NodeId>,
}

impl NodeInner {
    fn accepts_registrations(&self) -> bool {
        self.mounted && !self.disposing
    }
}

impl Node {
    pub(crate) fn new(
        origin: Descriptor,
        provider: ErasedProvider,
        owner: &Arc<ContainerInner>,
    ) -> NodeRef {
        Arc::new(Self {
            id: NodeId::new(),
            origin,
            owner: Arc::downgrade(owner),
            inner: Mutex::new(NodeInner {
                provider,
                slot: Slot::Uninitialized,
                dirty: true,
                mounted: true,
                disposing: false,
                generation: 0,
                dependencies: IndexMap::new(),
                dependents: IndexMap::new(),
                listeners: IndexMap::new(),
                dispose_callbacks: Vec::new(),
                capabilities: HashMap::new(),
                watching: HashSet::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn origin(&self) -> &Descriptor {
        &self.origin
    }

    pub(crate) fn owner(&self) -> Result<Arc<ContainerInner>> {
        self.owner
            .upgrade()
            .ok_or_else(|| GraphError::disposed("container"))
    }

    pub(crate) fn is_owned_by(&self, owner: &Arc<ContainerInner>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(owner))
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.inner.lock().mounted
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Whether the initializer has run to completion (either way).
    pub(crate) fn is_constructed(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Ready(_) | Slot::Failed(_))
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub(crate) fn dependencies(&self) -> Vec<NodeRef> {
        self.inner.lock().dependencies.values().cloned().collect()
    }

    pub(crate) fn dependents(&self) -> Vec<NodeRef> {
        self.inner
            .lock()
            .dependents
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn construction_error(&self, source: &Arc<GraphError>) -> GraphError {
        GraphError::Construction {
            node: self.origin.to_string(),
            source: Arc::clone(source),
        }
    }

    /// The current value, without flushing.
    pub(crate) fn value(&self) -> Result<Value> {
        let inner = self.inner.lock();
        if !inner.mounted {
            return Err(GraphError::disposed(&self.origin));
        }
        match &inner.slot {
            Slot::Ready(value) => Ok(Arc::clone(value)),
            Slot::Failed(source) => Err(self.construction_error(source)),
            Slot::Uninitialized | Slot::Building => Err(GraphError::protocol(format!(
                "{} has not finished initializing",
                self.origin
            ))),
        }
    }

    /// Run the initializer if it has not run yet.
    pub(crate) fn ensure_built(self: &Arc<Self>) -> Result<()> {
        let owner = self.owner()?;
        let provider = {
            let mut inner = self.inner.lock();
            if !inner.mounted {
                return Err(GraphError::disposed(&self.origin));
            }
            match &inner.slot {
                Slot::Ready(_) => return Ok(()),
                Slot::Failed(source) => return Err(self.construction_error(source)),
                Slot::Building => {
                    return Err(GraphError::CircularDependency {
                        node: self.origin.to_string(),
                    })
                }
                Slot::Uninitialized => {}
            }
            inner.slot = Slot::Building;
            Arc::clone(&inner.provider)
        };

        tracing::trace!(node = %self.origin, "building node");
        let outcome = {
            let _exclusive = owner.enter_exclusive(self.id);
            panic::catch_unwind(AssertUnwindSafe(|| provider.build(self, &owner))).unwrap_or_else(
                |payload| Err(GraphError::Panicked(panic_message(payload.as_ref()))),
            )
        };

        let value = {
            let mut inner = self.inner.lock();
            inner.dirty = false;
            match outcome {
                Ok(value) => {
                    inner.slot = Slot::Ready(Arc::clone(&value));
                    value
                }
                Err(error) => {
                    let source = Arc::new(error);
                    inner.slot = Slot::Failed(Arc::clone(&source));
                    drop(inner);
                    tracing::warn!(node = %self.origin, error = %source, "node failed to initialize");
                    return Err(self.construction_error(&source));
                }
            }
        };

        owner.report_added(&self.origin, &value);
        Ok(())
    }

    /// Checks shared by every mutation of a built node.
    fn check_mutable(self: &Arc<Self>, owner: &ContainerInner) -> Result<()> {
        {
            let inner = self.inner.lock();
            if !inner.mounted {
                return Err(GraphError::disposed(&self.origin));
            }
            if let Slot::Failed(source) = &inner.slot {
                return Err(self.construction_error(source));
            }
        }
        owner.check_exclusive(self)?;
        owner.check_notification_order(self)
    }

    /// Flag the node as possibly stale and ping its listeners.
    ///
    /// Listeners only schedule a later flush; nothing is recomputed here.
    pub(crate) fn mark_may_have_changed(self: &Arc<Self>) -> Result<()> {
        let owner = self.owner()?;
        {
            let inner = self.inner.lock();
            if !inner.mounted {
                return Err(GraphError::disposed(&self.origin));
            }
            if let Slot::Failed(source) = &inner.slot {
                return Err(self.construction_error(source));
            }
            if inner.dirty {
                return Ok(());
            }
        }
        owner.check_exclusive(self)?;
        owner.check_notification_order(self)?;

        let listeners: SmallVec<[Listener; 4]> = {
            let mut inner = self.inner.lock();
            inner.dirty = true;
            inner.listeners.values().cloned().collect()
        };

        tracing::trace!(node = %self.origin, listeners = listeners.len(), "node may have changed");
        for listener in listeners {
            isolate(owner.sink(), CallbackOrigin::Listener, &self.origin, || listener());
        }
        Ok(())
    }

    /// Replace the value and mark the node as possibly changed.
    pub(crate) fn set_value(self: &Arc<Self>, value: Value) -> Result<()> {
        let owner = self.owner()?;
        self.check_mutable(&owner)?;
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.slot, Slot::Ready(_)) {
                return Err(GraphError::protocol(format!(
                    "cannot set the state of {} before it finished initializing",
                    self.origin
                )));
            }
            inner.slot = Slot::Ready(value);
        }
        self.mark_may_have_changed()
    }

    /// Confirm a pending change, if any.
    ///
    /// Derived nodes recompute first and cancel the notification when the new
    /// value equals the old one.
    pub(crate) fn flush(self: &Arc<Self>) -> Result<()> {
        let provider = {
            let inner = self.inner.lock();
            if !inner.dirty || !matches!(inner.slot, Slot::Ready(_)) {
                return Ok(());
            }
            Arc::clone(&inner.provider)
        };

        if !provider.is_derived() {
            return self.notify_changed();
        }

        let owner = self.owner()?;
        match provider.recompute(self, &owner) {
            Ok(Some(value)) => {
                self.inner.lock().slot = Slot::Ready(value);
                self.notify_changed()
            }
            Ok(None) => self.cancel_change_notification(),
            Err(error) => {
                let source = Arc::new(error);
                {
                    let mut inner = self.inner.lock();
                    inner.slot = Slot::Failed(Arc::clone(&source));
                    inner.dirty = false;
                }
                tracing::warn!(node = %self.origin, error = %source, "derived node failed to recompute");
                Err(self.construction_error(&source))
            }
        }
    }

    /// Clear the dirty flag, bump the generation and tell the observers.
    pub(crate) fn notify_changed(self: &Arc<Self>) -> Result<()> {
        let value = {
            let mut inner = self.inner.lock();
            if !inner.mounted {
                return Err(GraphError::disposed(&self.origin));
            }
            if !inner.dirty {
                return Err(GraphError::protocol(format!(
                    "{} was not marked as may have changed",
                    self.origin
                )));
            }
            let Slot::Ready(value) = &inner.slot else {
                return Err(GraphError::protocol(format!("{} has no value to notify", self.origin)));
            };
            let value = Arc::clone(value);
            inner.dirty = false;
            inner.generation += 1;
            value
        };

        tracing::trace!(node = %self.origin, "node changed");
        self.owner()?.report_updated(self, &value);
        Ok(())
    }

    /// Clear the dirty flag without notifying anyone.
    pub(crate) fn cancel_change_notification(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Err(GraphError::protocol(format!(
                "{} was not marked as may have changed",
                self.origin
            )));
        }
        inner.dirty = false;
        Ok(())
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> Result<ListenerId> {
        let mut inner = self.inner.lock();
        if !inner.accepts_registrations() {
            return Err(GraphError::disposed(&self.origin));
        }
        let id = ListenerId::new();
        inner.listeners.insert(id, listener);
        Ok(id)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.shift_remove(&id);
    }

    pub(crate) fn on_dispose(&self, callback: DisposeCallback) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.accepts_registrations() {
            return Err(GraphError::disposed(&self.origin));
        }
        inner.dispose_callbacks.push(callback);
        Ok(())
    }

    /// A memoized capability for `key`, if this node already depends on it.
    pub(crate) fn capability(&self, key: NodeKey) -> Result<Option<Capability>> {
        let inner = self.inner.lock();
        if !inner.accepts_registrations() {
            return Err(GraphError::disposed(&self.origin));
        }
        Ok(inner.capabilities.get(&key).cloned())
    }

    /// Add the edge `self -> target` and hand back a capability for it.
    ///
    /// Disposing `self` removes the edge pair and revokes the capability.
    pub(crate) fn link(self: &Arc<Self>, key: NodeKey, target: &NodeRef) -> Result<Capability> {
        if let Some(existing) = self.capability(key)? {
            return Ok(existing);
        }
        if Arc::ptr_eq(self, target) || scheduler::depends_on(target, self.id) {
            return Err(GraphError::CircularDependency {
                node: self.origin.to_string(),
            });
        }

        let capability = Capability {
            node: Arc::clone(target),
            revoked: Arc::new(AtomicBool::new(false)),
        };

        let (dependent_id, dependency_id) = (self.id, target.id);
        let weak_dependent = Arc::downgrade(self);
        let weak_dependency = Arc::downgrade(target);
        let revoked = Arc::clone(&capability.revoked);
        let unlink: DisposeCallback = Box::new(move || {
            revoked.store(true, Ordering::SeqCst);
            if let Some(dependent) = weak_dependent.upgrade() {
                dependent.inner.lock().dependencies.shift_remove(&dependency_id);
            }
            if let Some(dependency) = weak_dependency.upgrade() {
                dependency.inner.lock().dependents.shift_remove(&dependent_id);
            }
        });

        {
            let mut inner = self.inner.lock();
            if !inner.accepts_registrations() {
                return Err(GraphError::disposed(&self.origin));
            }
            inner.dependencies.insert(target.id, Arc::clone(target));
            inner.capabilities.insert(key, capability.clone());
            inner.dispose_callbacks.push(unlink);
        }
        target
            .inner
            .lock()
            .dependents
            .insert(self.id, Arc::downgrade(self));

        Ok(capability)
    }

    /// Mark `self` as possibly changed whenever `target` is.
    pub(crate) fn watch(self: &Arc<Self>, target: &NodeRef) -> Result<()> {
        if !self.inner.lock().watching.insert(target.id) {
            return Ok(());
        }

        let weak_self = Arc::downgrade(self);
        let listener = target.add_listener(Arc::new(move || {
            if let Some(node) = weak_self.upgrade() {
                if let Err(error) = node.mark_may_have_changed() {
                    tracing::warn!(node = %node.origin, %error, "could not propagate change");
                }
            }
        }))?;

        let weak_target = Arc::downgrade(target);
        let unwatch = move || {
            if let Some(target) = weak_target.upgrade() {
                target.remove_listener(listener);
            }
        };
        if let Err(error) = self.on_dispose(Box::new(unwatch)) {
            target.remove_listener(listener);
            return Err(error);
        }
        Ok(())
    }

    /// Point a node at a new provider. Returns the previous provider when the
    /// node was already built, so the caller can run the update hook.
    pub(crate) fn swap_provider(&self, provider: ErasedProvider) -> Option<ErasedProvider> {
        let mut inner = self.inner.lock();
        let previous = std::mem::replace(&mut inner.provider, provider);
        matches!(inner.slot, Slot::Ready(_)).then_some(previous)
    }

    /// Tear the node down. Runs at most once.
    pub(crate) fn dispose(self: &Arc<Self>, owner: &Arc<ContainerInner>) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if !inner.mounted || inner.disposing {
                return;
            }
            inner.disposing = true;
            inner.listeners.clear();
            std::mem::take(&mut inner.dispose_callbacks)
        };

        tracing::trace!(node = %self.origin, callbacks = callbacks.len(), "disposing node");
        {
            let _exclusive = owner.enter_exclusive(self.id);
            for callback in callbacks {
                isolate(owner.sink(), CallbackOrigin::DisposeCallback, &self.origin, callback);
            }
        }
        owner.report_disposed(&self.origin);

        let mut inner = self.inner.lock();
        inner.mounted = false;
        inner.dirty = false;
        inner.capabilities.clear();
        inner.watching.clear();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("dirty", &inner.dirty)
            .field("mounted", &inner.mounted)
            .field("generation", &inner.generation)
            .field("dependencies", &inner.dependencies.len())
            .field("dependents", &inner.dependents.len())
            .finish()
    }
}
