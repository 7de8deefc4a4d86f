//! Node Descriptors
//!
//! A descriptor is the immutable identity of a node: the key the container
//! uses to find a node's state. Equality and hashing go through an opaque
//! [`NodeKey`] minted once per descriptor, so two descriptors are equal only
//! if one is a clone of the other.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque identity of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u64);

impl NodeKey {
    /// Mint a new unique key.
    pub(crate) fn mint() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw key value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Opaque identity of a parameterized family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FamilyKey(u64);

impl FamilyKey {
    pub(crate) fn mint() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw key value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The kind of node a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An ordinary node. Can be overridden and is shared with child
    /// containers.
    Source,

    /// A derived (computed) node. Always private to the container that
    /// reads it, never overridden, and recomputed on flush.
    Derived,
}

/// Identity of the family a descriptor belongs to.
#[derive(Debug, Clone)]
pub struct FamilyRef {
    key: FamilyKey,
    name: Option<Arc<str>>,
}

impl FamilyRef {
    pub(crate) fn new(key: FamilyKey, name: Option<Arc<str>>) -> Self {
        Self { key, name }
    }

    /// The family's key.
    pub fn key(&self) -> FamilyKey {
        self.key
    }

    /// The family's display name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Type-erased family parameter.
pub(crate) type Argument = Arc<dyn Any + Send + Sync>;

/// Immutable identity and metadata of a node.
#[derive(Clone)]
pub struct Descriptor {
    key: NodeKey,
    kind: NodeKind,
    name: Option<Arc<str>>,
    family: Option<FamilyRef>,
    argument: Option<Argument>,
}

impl Descriptor {
    /// Create a descriptor for an ordinary node.
    pub(crate) fn source(name: Option<Arc<str>>) -> Self {
        Self {
            key: NodeKey::mint(),
            kind: NodeKind::Source,
            name,
            family: None,
            argument: None,
        }
    }

    /// Create a descriptor for a derived node.
    pub(crate) fn derived(name: Option<Arc<str>>) -> Self {
        Self {
            kind: NodeKind::Derived,
            ..Self::source(name)
        }
    }

    /// Create a descriptor for a member of a family.
    pub(crate) fn member(family: FamilyRef, name: Arc<str>, argument: Argument) -> Self {
        Self {
            key: NodeKey::mint(),
            kind: NodeKind::Source,
            name: Some(name),
            family: Some(family),
            argument: Some(argument),
        }
    }

    /// Same identity, different display name.
    pub(crate) fn renamed(&self, name: Arc<str>) -> Self {
        Self {
            name: Some(name),
            ..self.clone()
        }
    }

    /// The descriptor's identity.
    pub fn key(&self) -> NodeKey {
        self.key
    }

    /// The kind of node.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The display name, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The family this node is a member of, if any.
    pub fn family(&self) -> Option<&FamilyRef> {
        self.family.as_ref()
    }

    /// The family parameter, downcast to its concrete type.
    pub fn argument<A: Any>(&self) -> Option<&A> {
        self.argument.as_deref().and_then(|arg| arg.downcast_ref::<A>())
    }

    pub(crate) fn is_derived(&self) -> bool {
        self.kind == NodeKind::Derived
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "Provider#{}", self.key.0),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("key", &self.key.0)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("family", &self.family.as_ref().map(|family| family.key.0))
            .finish()
    }
}
