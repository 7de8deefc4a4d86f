//! Providers
//!
//! A [`Provider<T>`] is the statically typed handle to one node descriptor:
//! it carries the initializer and, optionally, the hook that runs when an
//! override replaces it on a live node. Providers are cheap to clone and
//! clones share the descriptor, so a clone reads the same node.
//!
//! The graph only ever sees providers through the erased
//! [`AnyProvider`] trait; values cross back into typed code in
//! [`downcast`](super::handle::downcast).
//!
//! # Flavors
//!
//! - [`Provider::new`]: runs a closure once and keeps its result.
//! - [`Provider::value`]: a constant. When it replaces another provider on a
//!   live node, it writes its value into the node.
//! - [`Provider::computed`]: a derived node. It is recomputed on flush and
//!   only reports a change when the new value differs from the old one.
//! - [`Family`]: a parameterized provider. Each argument maps to its own
//!   member node.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::context::NodeContext;
use super::handle::{downcast, NodeHandle};
use crate::error::{panic_message, GraphError, Result};
use crate::graph::node::{AnyProvider, ErasedProvider, NodeRef, Value};
use crate::graph::owner::ContainerInner;
use crate::graph::{Descriptor, FamilyFactory, FamilyKey, FamilyRef, Override};

type BuildFn<T> = Arc<dyn Fn(&NodeContext<T>) -> Result<T> + Send + Sync>;
type UpdateFn<T> = Arc<dyn Fn(&NodeHandle<T>, &Provider<T>) -> Result<()> + Send + Sync>;

pub(crate) struct ProviderDef<T> {
    descriptor: Descriptor,
    build: BuildFn<T>,
    did_update: Option<UpdateFn<T>>,
    equals: Option<fn(&T, &T) -> bool>,
}

impl<T> ProviderDef<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn run(&self, node: &NodeRef, owner: &Arc<ContainerInner>) -> Result<T> {
        let context = NodeContext::new(Arc::clone(node), Arc::clone(owner));
        (self.build)(&context)
    }
}

impl<T> AnyProvider for ProviderDef<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn build(&self, node: &NodeRef, owner: &Arc<ContainerInner>) -> Result<Value> {
        let value = self.run(node, owner)?;
        Ok(Arc::new(value))
    }

    fn recompute(&self, node: &NodeRef, owner: &Arc<ContainerInner>) -> Result<Option<Value>> {
        let next = {
            let _exclusive = owner.enter_exclusive(node.id());
            panic::catch_unwind(AssertUnwindSafe(|| self.run(node, owner))).unwrap_or_else(
                |payload| Err(GraphError::Panicked(panic_message(payload.as_ref()))),
            )?
        };

        if let Some(equals) = self.equals {
            let current: T = downcast(node, node.value()?)?;
            if equals(&current, &next) {
                return Ok(None);
            }
        }
        Ok(Some(Arc::new(next)))
    }

    fn did_update_provider(&self, node: &NodeRef, previous: ErasedProvider) -> Result<()> {
        let Some(hook) = &self.did_update else {
            return Ok(());
        };
        let previous = previous
            .into_any()
            .downcast::<ProviderDef<T>>()
            .map_err(|_| {
                GraphError::protocol(format!(
                    "{} was replaced by a provider of a different type than {}",
                    node.origin(),
                    type_name::<T>()
                ))
            })?;
        hook(&NodeHandle::new(Arc::clone(node)), &Provider { def: previous })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A typed node descriptor plus the recipe for building the node.
pub struct Provider<T> {
    def: Arc<ProviderDef<T>>,
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self {
            def: Arc::clone(&self.def),
        }
    }
}

impl<T> Provider<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from_parts(
        descriptor: Descriptor,
        build: BuildFn<T>,
        did_update: Option<UpdateFn<T>>,
        equals: Option<fn(&T, &T) -> bool>,
    ) -> Self {
        Self {
            def: Arc::new(ProviderDef {
                descriptor,
                build,
                did_update,
                equals,
            }),
        }
    }

    /// A provider whose node holds the result of `build`.
    ///
    /// `build` runs once, on the first read. It may read other providers
    /// through the context, which records them as dependencies.
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&NodeContext<T>) -> Result<T> + Send + Sync + 'static,
    {
        Self::from_parts(Descriptor::source(None), Arc::new(build), None, None)
    }

    /// A provider whose node holds `value`.
    ///
    /// Used as an override replacement, it writes `value` into the live node
    /// when it replaces another provider.
    pub fn value(value: T) -> Self {
        let initial = value.clone();
        let hook: UpdateFn<T> = Arc::new(move |handle: &NodeHandle<T>, _: &Provider<T>| {
            handle.set(value.clone())
        });
        Self::from_parts(
            Descriptor::source(None),
            Arc::new(move |_: &NodeContext<T>| Ok(initial.clone())),
            Some(hook),
            None,
        )
    }

    /// A derived provider.
    ///
    /// Its node re-runs `build` whenever it is flushed while dirty, and only
    /// reports a change when the result differs from the previous value.
    /// Derived nodes are private to each container and cannot be overridden.
    pub fn computed<F>(build: F) -> Self
    where
        F: Fn(&NodeContext<T>) -> Result<T> + Send + Sync + 'static,
        T: PartialEq,
    {
        Self::from_parts(
            Descriptor::derived(None),
            Arc::new(build),
            None,
            Some(<T as PartialEq>::eq),
        )
    }

    /// Same provider, with a display name for logs and errors.
    pub fn named(self, name: impl Into<Arc<str>>) -> Self {
        Self::from_parts(
            self.def.descriptor.renamed(name.into()),
            Arc::clone(&self.def.build),
            self.def.did_update.clone(),
            self.def.equals,
        )
    }

    /// Same provider, with a hook that runs when it replaces `previous` on a
    /// node that was already built.
    pub fn on_update<F>(self, hook: F) -> Self
    where
        F: Fn(&NodeHandle<T>, &Provider<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_parts(
            self.def.descriptor.clone(),
            Arc::clone(&self.def.build),
            Some(Arc::new(hook)),
            self.def.equals,
        )
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.def.descriptor
    }

    pub fn name(&self) -> Option<&str> {
        self.def.descriptor.name()
    }

    /// Replace this provider with `replacement` inside one container.
    pub fn override_with(&self, replacement: Provider<T>) -> Override {
        Override::node(self.descriptor().clone(), replacement.erased())
    }

    /// Replace this provider with a constant inside one container.
    pub fn override_with_value(&self, value: T) -> Override {
        self.override_with(Provider::value(value))
    }

    pub(crate) fn erased(&self) -> ErasedProvider {
        Arc::clone(&self.def) as ErasedProvider
    }
}

impl<T> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("descriptor", &self.def.descriptor)
            .field("value", &type_name::<T>())
            .finish()
    }
}

type MemberFn<A, T> = Arc<dyn Fn(&NodeContext<T>, &A) -> Result<T> + Send + Sync>;

struct FamilyInner<A, T> {
    family: FamilyRef,
    build: MemberFn<A, T>,
    members: Mutex<HashMap<A, Provider<T>>>,
}

/// A provider parameterized by an argument.
///
/// Each distinct argument maps to its own member provider, and members are
/// memoized so `get` with an equal argument always returns the same one.
///
/// ```rust
/// use ripple_core::{Family, ProviderContainer};
///
/// let square = Family::named("square", |_, n: &u64| Ok(n * n));
/// let container = ProviderContainer::new();
/// assert_eq!(container.read(&square.get(7)).unwrap(), 49);
/// assert_eq!(square.get(7).name(), Some("square(7)"));
/// ```
pub struct Family<A, T> {
    inner: Arc<FamilyInner<A, T>>,
}

impl<A, T> Clone for Family<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> Family<A, T>
where
    A: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn with_name<F>(name: Option<Arc<str>>, build: F) -> Self
    where
        F: Fn(&NodeContext<T>, &A) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FamilyInner {
                family: FamilyRef::new(FamilyKey::mint(), name),
                build: Arc::new(build),
                members: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&NodeContext<T>, &A) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_name(None, build)
    }

    pub fn named<F>(name: impl Into<Arc<str>>, build: F) -> Self
    where
        F: Fn(&NodeContext<T>, &A) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_name(Some(name.into()), build)
    }

    /// The member provider for `argument`.
    pub fn get(&self, argument: A) -> Provider<T> {
        let mut members = self.inner.members.lock();
        if let Some(member) = members.get(&argument) {
            return member.clone();
        }

        let family = &self.inner.family;
        let name: Arc<str> = match family.name() {
            Some(name) => format!("{name}({argument:?})").into(),
            None => format!("Family#{}({argument:?})", family.key().raw()).into(),
        };
        let descriptor = Descriptor::member(family.clone(), name, Arc::new(argument.clone()));

        let build = Arc::clone(&self.inner.build);
        let bound = argument.clone();
        let member = Provider::from_parts(
            descriptor,
            Arc::new(move |context: &NodeContext<T>| build(context, &bound)),
            None,
            None,
        );
        members.insert(argument, member.clone());
        member
    }

    pub fn key(&self) -> FamilyKey {
        self.inner.family.key()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.family.name()
    }

    /// Replace every member inside one container. `factory` is called with
    /// the member's argument on the member's first read.
    pub fn override_with<F>(&self, factory: F) -> Override
    where
        F: Fn(&A) -> Provider<T> + Send + Sync + 'static,
    {
        let factory: FamilyFactory = Arc::new(move |member: &Descriptor| {
            let argument = member.argument::<A>().ok_or_else(|| {
                GraphError::protocol(format!(
                    "{member} does not carry an argument of type {}",
                    type_name::<A>()
                ))
            })?;
            Ok(factory(argument).erased())
        });
        Override::family(self.inner.family.clone(), factory)
    }
}

impl<A, T> fmt::Debug for Family<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("key", &self.inner.family.key())
            .field("name", &self.inner.family.name())
            .field("members", &self.inner.members.lock().len())
            .finish()
    }
}
