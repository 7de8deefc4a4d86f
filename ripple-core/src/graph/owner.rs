//! Provider Container
//!
//! The container owns the graph: it maps descriptors to lazily created node
//! states, applies overrides, orchestrates reads, routes notifications to
//! observers and tears everything down in dependency order.
//!
//! # How It Works
//!
//! 1. Reading a descriptor finds or creates its reader. Derived nodes always
//!    get a reader private to this container. Members of an overridden family
//!    get a replacement from the family factory. Anything else falls through
//!    to the parent container, if there is one, and the parent's reader is
//!    cached locally.
//!
//! 2. The reader creates the node state on first use and the node runs its
//!    initializer. While it runs, the container records it as the current
//!    exclusive operation; marking any other node dirty in the meantime is a
//!    protocol violation.
//!
//! 3. The node is flushed before the read returns, so callers never see a
//!    dirty node.
//!
//! 4. `dispose` walks every node this container constructed, dependents
//!    before dependencies.
//!
//! # Shared Nodes
//!
//! A child container shares every node of its parent that it does not
//! override. The node's owner stays the container that constructed it, and
//! only that container disposes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::descriptor::{Descriptor, NodeKey};
use super::node::{ErasedProvider, Node, NodeId, NodeRef, Value};
use super::observer::GraphObserver;
use super::overrides::{Override, OverrideRegistry, Swap};
use super::scheduler;
use crate::config::GraphConfig;
use crate::error::{isolate, CallbackOrigin, ErrorSink, GraphError, Result, TracingSink};

/// Lazily resolves one descriptor to its node state.
pub(crate) struct Reader {
    origin: Descriptor,
    owner: Weak<ContainerInner>,
    provider: Mutex<ErasedProvider>,
    node: Mutex<Option<NodeRef>>,
}

impl Reader {
    fn new(origin: Descriptor, provider: ErasedProvider, owner: &Arc<ContainerInner>) -> Self {
        Self {
            origin,
            owner: Arc::downgrade(owner),
            provider: Mutex::new(provider),
            node: Mutex::new(None),
        }
    }

    /// The node state, created on first call.
    pub(crate) fn resolve(&self) -> Result<NodeRef> {
        let mut slot = self.node.lock();
        if let Some(node) = slot.as_ref() {
            return Ok(NodeRef::clone(node));
        }
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| GraphError::disposed("container"))?;
        let provider = Arc::clone(&*self.provider.lock());
        let node = Node::new(self.origin.clone(), provider, &owner);
        *slot = Some(NodeRef::clone(&node));
        Ok(node)
    }

    fn node(&self) -> Option<NodeRef> {
        self.node.lock().clone()
    }

    fn is_owned_by(&self, owner: &Arc<ContainerInner>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(owner))
    }

    /// Point the reader (and its node, if any) at a new provider.
    fn swap(&self, replacement: ErasedProvider) -> Option<(NodeRef, ErasedProvider)> {
        *self.provider.lock() = Arc::clone(&replacement);
        let node = self.node()?;
        let previous = node.swap_provider(replacement)?;
        Some((node, previous))
    }
}

pub(crate) struct ContainerInner {
    config: GraphConfig,
    parent: Option<Arc<ContainerInner>>,
    readers: Mutex<IndexMap<NodeKey, Arc<Reader>>>,
    overrides: Mutex<OverrideRegistry>,
    observers: Vec<Arc<dyn GraphObserver>>,
    sink: Arc<dyn ErrorSink>,
    disposed: AtomicBool,

    /// The node whose construction or disposal is in progress. Shared by a
    /// root container and all of its descendants, since they share nodes.
    exclusive: Arc<Mutex<Option<NodeId>>>,

    /// The node whose change is currently being delivered.
    notifying: Mutex<Option<NodeRef>>,

    children: Mutex<Vec<Weak<ContainerInner>>>,
}

/// Restores the previous exclusive operation when dropped.
pub(crate) struct ExclusiveGuard<'a> {
    owner: &'a ContainerInner,
    previous: Option<NodeId>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        *self.owner.exclusive.lock() = self.previous;
    }
}

/// Restores the previously notifying node when dropped.
pub(crate) struct NotifyGuard<'a> {
    owner: &'a ContainerInner,
    previous: Option<NodeRef>,
}

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        *self.owner.notifying.lock() = self.previous.take();
    }
}

impl ContainerInner {
    fn assemble(
        config: GraphConfig,
        parent: Option<Arc<ContainerInner>>,
        overrides: OverrideRegistry,
        observers: Vec<Arc<dyn GraphObserver>>,
        sink: Arc<dyn ErrorSink>,
    ) -> Arc<Self> {
        let exclusive = parent
            .as_ref()
            .map(|parent| Arc::clone(&parent.exclusive))
            .unwrap_or_default();
        let inner = Arc::new(Self {
            config,
            parent,
            readers: Mutex::new(IndexMap::new()),
            overrides: Mutex::new(overrides),
            observers,
            sink,
            disposed: AtomicBool::new(false),
            exclusive,
            notifying: Mutex::new(None),
            children: Mutex::new(Vec::new()),
        });

        let inherited = {
            let registry = inner.overrides.lock();
            let mut readers = inner.readers.lock();

            if let Some(parent) = &inner.parent {
                for (key, reader) in parent.readers.lock().iter() {
                    if reader.origin.is_derived() || registry.shadows(&reader.origin) {
                        continue;
                    }
                    readers.insert(*key, Arc::clone(reader));
                }
            }
            let inherited = readers.len();

            for (origin, replacement) in registry.node_overrides() {
                let reader = Reader::new(origin.clone(), replacement, &inner);
                readers.insert(origin.key(), Arc::new(reader));
            }
            inherited
        };

        if let Some(parent) = &inner.parent {
            let mut children = parent.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&inner));
        }

        tracing::debug!(
            container = inner.config.label(),
            overrides = inner.overrides.lock().len(),
            inherited,
            "container created"
        );
        inner
    }

    pub(crate) fn sink(&self) -> &dyn ErrorSink {
        self.sink.as_ref()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(GraphError::disposed(self.config.label()));
        }
        Ok(())
    }

    /// Find or create the reader for `provider`'s descriptor.
    pub(crate) fn reader_for(self: &Arc<Self>, provider: &ErasedProvider) -> Result<Arc<Reader>> {
        let origin = provider.descriptor().clone();
        if let Some(reader) = self.readers.lock().get(&origin.key()) {
            return Ok(Arc::clone(reader));
        }

        let family_factory = origin.family().and_then(|family| {
            let registry = self.overrides.lock();
            registry.family_factory(family.key())
        });

        let reader = if origin.is_derived() {
            Arc::new(Reader::new(origin.clone(), Arc::clone(provider), self))
        } else if let Some(factory) = family_factory {
            let recorded = self.overrides.lock().member_override(origin.key());
            let replacement = match recorded {
                Some(replacement) => replacement,
                None => {
                    let replacement = factory(&origin)?;
                    self.overrides
                        .lock()
                        .record_member(&origin, Arc::clone(&replacement));
                    replacement
                }
            };
            tracing::trace!(node = %origin, "family override resolved");
            Arc::new(Reader::new(origin.clone(), replacement, self))
        } else if let Some(parent) = &self.parent {
            parent.ensure_active()?;
            parent.reader_for(provider)?
        } else {
            Arc::new(Reader::new(origin.clone(), Arc::clone(provider), self))
        };

        let mut readers = self.readers.lock();
        let reader = Arc::clone(readers.entry(origin.key()).or_insert(reader));
        Ok(reader)
    }

    /// Resolve, build and flush the node for `provider`.
    pub(crate) fn read_node(self: &Arc<Self>, provider: &ErasedProvider) -> Result<NodeRef> {
        self.ensure_active()?;
        let node = self.reader_for(provider)?.resolve()?;
        node.ensure_built()?;
        node.flush()?;
        Ok(node)
    }

    pub(crate) fn enter_exclusive(&self, node: NodeId) -> ExclusiveGuard<'_> {
        let previous = self.exclusive.lock().replace(node);
        ExclusiveGuard {
            owner: self,
            previous,
        }
    }

    pub(crate) fn enter_notifying(&self, node: &NodeRef) -> NotifyGuard<'_> {
        let previous = self.notifying.lock().replace(NodeRef::clone(node));
        NotifyGuard {
            owner: self,
            previous,
        }
    }

    /// Reject marking `node` dirty while another node is being built or
    /// disposed anywhere in this container's hierarchy.
    pub(crate) fn check_exclusive(&self, node: &Node) -> Result<()> {
        match *self.exclusive.lock() {
            Some(current) if current != node.id() => Err(GraphError::protocol(format!(
                "cannot mark {} as may have changed while another node is being initialized or disposed",
                node.origin()
            ))),
            _ => Ok(()),
        }
    }

    /// Reject marking a dependency dirty while a node that sits deeper in the
    /// graph is delivering its change. Only runs with debug checks on.
    pub(crate) fn check_notification_order(&self, node: &NodeRef) -> Result<()> {
        if !self.config.debug_checks {
            return Ok(());
        }
        let notifying = self.notifying.lock().clone();
        let Some(notifying) = notifying else {
            return Ok(());
        };
        if Arc::ptr_eq(&notifying, node) {
            return Ok(());
        }
        if scheduler::depth(node) < scheduler::depth(&notifying) {
            return Err(GraphError::protocol(format!(
                "cannot mark {} as may have changed while its dependent {} is notifying",
                node.origin(),
                notifying.origin()
            )));
        }
        Ok(())
    }

    pub(crate) fn report_added(&self, descriptor: &Descriptor, value: &Value) {
        for observer in &self.observers {
            isolate(self.sink(), CallbackOrigin::Observer, descriptor, || {
                observer.did_add_node(descriptor, value.as_ref())
            });
        }
    }

    pub(crate) fn report_updated(&self, node: &NodeRef, value: &Value) {
        let _notifying = self.enter_notifying(node);
        for observer in &self.observers {
            isolate(self.sink(), CallbackOrigin::Observer, node.origin(), || {
                observer.did_update_node(node.origin(), value.as_ref())
            });
        }
    }

    pub(crate) fn report_disposed(&self, descriptor: &Descriptor) {
        for observer in &self.observers {
            isolate(self.sink(), CallbackOrigin::Observer, descriptor, || {
                observer.did_dispose_node(descriptor)
            });
        }
    }

    /// Every node this container constructed, dependents first.
    fn disposal_order(self: &Arc<Self>) -> Vec<NodeRef> {
        let owned: Vec<NodeRef> = self
            .readers
            .lock()
            .values()
            .filter(|reader| reader.is_owned_by(self))
            .filter_map(|reader| reader.node())
            .filter(|node| node.is_constructed() && node.is_mounted())
            .collect();

        scheduler::disposal_order(&owned)
            .into_iter()
            .filter(|node| node.is_owned_by(self) && node.is_mounted())
            .collect()
    }

    /// Swap every live reader first, then run the update hooks. A failing
    /// factory or hook does not stop the remaining swaps; the first error is
    /// returned once all of them ran.
    fn update_overrides(self: &Arc<Self>, next: Vec<Override>) -> Result<()> {
        self.ensure_active()?;
        let swaps = {
            let mut registry = self.overrides.lock();
            if self.config.debug_checks {
                registry.check_shape(&next)?;
            }
            registry.replace(next)
        };

        let mut first_error = None;
        let mut hooks = Vec::new();
        for swap in swaps {
            let (key, replacement) = match swap {
                Swap::Node {
                    origin,
                    replacement,
                } => (origin, replacement),
                Swap::Member { member, factory } => match factory(&member) {
                    Ok(replacement) => {
                        self.overrides
                            .lock()
                            .record_member(&member, Arc::clone(&replacement));
                        (member.key(), replacement)
                    }
                    Err(error) => {
                        tracing::warn!(node = %member, %error, "family override factory failed");
                        first_error.get_or_insert(error);
                        continue;
                    }
                },
            };

            let reader = self.readers.lock().get(&key).cloned();
            let Some(reader) = reader else {
                continue;
            };
            if !reader.is_owned_by(self) {
                continue;
            }
            if let Some((node, previous)) = reader.swap(Arc::clone(&replacement)) {
                tracing::trace!(node = %node.origin(), "provider replaced on live node");
                hooks.push((node, replacement, previous));
            }
        }

        let updated = hooks.len();
        for (node, replacement, previous) in hooks {
            if let Err(error) = replacement.did_update_provider(&node, previous) {
                tracing::warn!(node = %node.origin(), %error, "provider update hook failed");
                first_error.get_or_insert(error);
            }
        }

        tracing::debug!(container = self.config.label(), updated, "overrides updated");
        first_error.map_or(Ok(()), Err)
    }

    fn dispose(self: &Arc<Self>) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(GraphError::disposed(self.config.label()));
        }

        let children: Vec<_> = std::mem::take(&mut *self.children.lock())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for child in children.iter().rev() {
            if !child.is_disposed() {
                child.dispose()?;
            }
        }

        let order = self.disposal_order();
        tracing::debug!(container = self.config.label(), nodes = order.len(), "disposing container");
        for node in &order {
            node.dispose(self);
        }
        Ok(())
    }
}

/// The graph owner: a container of lazily created nodes.
///
/// Cloning a container creates a new handle to the same graph.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Provider, ProviderContainer};
///
/// let base = Provider::value(20);
/// let doubled = {
///     let base = base.clone();
///     Provider::new(move |ctx| Ok(ctx.read(&base)? * 2))
/// };
///
/// let container = ProviderContainer::new();
/// assert_eq!(container.read(&doubled).unwrap(), 40);
/// container.dispose().unwrap();
/// ```
#[derive(Clone)]
pub struct ProviderContainer {
    pub(crate) inner: Arc<ContainerInner>,
}

impl ProviderContainer {
    /// A root container with no overrides, observers or parent.
    pub fn new() -> Self {
        Self {
            inner: ContainerInner::assemble(
                GraphConfig::default(),
                None,
                OverrideRegistry::empty(),
                Vec::new(),
                Arc::new(TracingSink),
            ),
        }
    }

    /// Start configuring a container.
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::default()
    }

    /// Start configuring a child of this container.
    pub fn child(&self) -> ContainerBuilder {
        ContainerBuilder::default().parent(self)
    }

    /// The container's configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Replace the overrides' replacements.
    ///
    /// The list must have the same shape as the one the container was built
    /// with (checked when debug checks are on). Nodes that were already built
    /// keep their value and listeners; the new provider's update hook runs
    /// once for each of them. Every override is applied even when a hook
    /// fails, and the first failure is returned afterwards.
    pub fn update_overrides(&self, overrides: impl IntoIterator<Item = Override>) -> Result<()> {
        self.inner.update_overrides(overrides.into_iter().collect())
    }

    /// Descriptors of every node this container constructed, in the order
    /// `dispose` would tear them down.
    pub fn nodes_in_disposal_order(&self) -> Vec<Descriptor> {
        self.inner
            .disposal_order()
            .iter()
            .map(|node| node.origin().clone())
            .collect()
    }

    /// Dispose live child containers, then every node this container
    /// constructed, dependents first. Fails if called twice.
    pub fn dispose(&self) -> Result<()> {
        self.inner.dispose()
    }
}

impl Default for ProviderContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContainer")
            .field("label", &self.inner.config.label())
            .field("readers", &self.inner.readers.lock().len())
            .field("has_parent", &self.inner.parent.is_some())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Configures a [`ProviderContainer`].
#[derive(Default)]
pub struct ContainerBuilder {
    parent: Option<ProviderContainer>,
    overrides: Vec<Override>,
    observers: Vec<Arc<dyn GraphObserver>>,
    sink: Option<Arc<dyn ErrorSink>>,
    config: Option<GraphConfig>,
}

impl ContainerBuilder {
    /// Inherit unoverridden nodes from `parent`.
    pub fn parent(mut self, parent: &ProviderContainer) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Add overrides, in order.
    pub fn overrides(mut self, overrides: impl IntoIterator<Item = Override>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Register an observer.
    pub fn observer(mut self, observer: impl GraphObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Register an already shared observer.
    pub fn shared_observer(mut self, observer: Arc<dyn GraphObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Where isolated callback failures go. Defaults to the parent's sink, or
    /// to [`TracingSink`] for root containers.
    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Configuration. Defaults to the parent's, or to
    /// [`GraphConfig::default`] for root containers.
    pub fn config(mut self, config: GraphConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate the overrides and create the container.
    pub fn build(self) -> Result<ProviderContainer> {
        let parent = self.parent.map(|parent| parent.inner);
        if let Some(parent) = &parent {
            parent.ensure_active()?;
        }

        let overrides = OverrideRegistry::new(self.overrides)?;
        let config = self
            .config
            .or_else(|| parent.as_ref().map(|parent| parent.config.clone()))
            .unwrap_or_default();
        let sink = self
            .sink
            .or_else(|| parent.as_ref().map(|parent| Arc::clone(&parent.sink)))
            .unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn ErrorSink>);

        Ok(ProviderContainer {
            inner: ContainerInner::assemble(config, parent, overrides, self.observers, sink),
        })
    }
}
