//! Override Registry
//!
//! Overrides replace what a descriptor resolves to inside one container:
//!
//! - a node override maps an origin descriptor to a replacement provider;
//! - a family override maps a family to a factory that produces a
//!   replacement for each member.
//!
//! Node overrides resolve when the container registers the reader. Family
//! members cannot be enumerated ahead of time, so a family override resolves
//! on the first read of each member and the result is recorded here. That
//! write happens during a read and is only sound because a container is used
//! from one thread at a time.
//!
//! After construction the list may be updated, but only with a list of the
//! same shape: same length, same kinds, same origins in the same order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::descriptor::{Descriptor, FamilyKey, FamilyRef, NodeKey};
use super::node::ErasedProvider;
use crate::error::{GraphError, Result};

/// Produces the replacement provider for one family member.
pub(crate) type FamilyFactory = Arc<dyn Fn(&Descriptor) -> Result<ErasedProvider> + Send + Sync>;

/// A single override declaration.
///
/// Built with [`Provider::override_with`](crate::Provider::override_with),
/// [`Provider::override_with_value`](crate::Provider::override_with_value)
/// or [`Family::override_with`](crate::Family::override_with).
#[derive(Clone)]
pub struct Override {
    kind: OverrideKind,
}

#[derive(Clone)]
enum OverrideKind {
    Node {
        origin: Descriptor,
        replacement: ErasedProvider,
    },
    Family {
        family: FamilyRef,
        factory: FamilyFactory,
    },
}

impl Override {
    pub(crate) fn node(origin: Descriptor, replacement: ErasedProvider) -> Self {
        Self {
            kind: OverrideKind::Node {
                origin,
                replacement,
            },
        }
    }

    pub(crate) fn family(family: FamilyRef, factory: FamilyFactory) -> Self {
        Self {
            kind: OverrideKind::Family { family, factory },
        }
    }

    /// Whether this overrides a whole family rather than one node.
    pub fn is_family(&self) -> bool {
        matches!(self.kind, OverrideKind::Family { .. })
    }

    /// Human-readable name of what is overridden.
    pub fn origin_name(&self) -> String {
        match &self.kind {
            OverrideKind::Node { origin, .. } => origin.to_string(),
            OverrideKind::Family { family, .. } => family
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Family#{}", family.key().raw())),
        }
    }

    fn same_origin(&self, other: &Override) -> bool {
        match (&self.kind, &other.kind) {
            (OverrideKind::Node { origin: a, .. }, OverrideKind::Node { origin: b, .. }) => a == b,
            (OverrideKind::Family { family: a, .. }, OverrideKind::Family { family: b, .. }) => {
                a.key() == b.key()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Override")
            .field("family", &self.is_family())
            .field("origin", &self.origin_name())
            .finish()
    }
}

/// A live change produced by [`OverrideRegistry::replace`].
pub(crate) enum Swap {
    /// Point the reader of `origin` at `replacement`.
    Node {
        origin: NodeKey,
        replacement: ErasedProvider,
    },
    /// Re-run the family factory for an already materialized member.
    Member {
        member: Descriptor,
        factory: FamilyFactory,
    },
}

pub(crate) struct OverrideRegistry {
    declared: Vec<Override>,
    nodes: HashMap<NodeKey, ErasedProvider>,
    families: HashMap<FamilyKey, FamilyFactory>,
    /// Family members resolved so far, in resolution order.
    members: IndexMap<NodeKey, (Descriptor, ErasedProvider)>,
}

impl OverrideRegistry {
    pub(crate) fn empty() -> Self {
        Self {
            declared: Vec::new(),
            nodes: HashMap::new(),
            families: HashMap::new(),
            members: IndexMap::new(),
        }
    }

    /// Validate and index the overrides a container is built with.
    pub(crate) fn new(declared: Vec<Override>) -> Result<Self> {
        let mut registry = Self::empty();
        let mut seen_nodes = HashSet::new();
        let mut seen_families = HashSet::new();

        for entry in &declared {
            match &entry.kind {
                OverrideKind::Node {
                    origin,
                    replacement,
                } => {
                    if origin.is_derived() {
                        return Err(GraphError::protocol(format!(
                            "derived node {origin} cannot be overridden"
                        )));
                    }
                    if !seen_nodes.insert(origin.key()) {
                        return Err(GraphError::protocol(format!(
                            "{origin} is overridden more than once"
                        )));
                    }
                    registry.nodes.insert(origin.key(), Arc::clone(replacement));
                }
                OverrideKind::Family { family, factory } => {
                    if !seen_families.insert(family.key()) {
                        return Err(GraphError::protocol(format!(
                            "{} is overridden more than once",
                            entry.origin_name()
                        )));
                    }
                    registry.families.insert(family.key(), Arc::clone(factory));
                }
            }
        }

        registry.declared = declared;
        Ok(registry)
    }

    pub(crate) fn len(&self) -> usize {
        self.declared.len()
    }

    /// Node overrides in declaration order.
    pub(crate) fn node_overrides(&self) -> Vec<(Descriptor, ErasedProvider)> {
        self.declared
            .iter()
            .filter_map(|entry| match &entry.kind {
                OverrideKind::Node {
                    origin,
                    replacement,
                } => Some((origin.clone(), Arc::clone(replacement))),
                OverrideKind::Family { .. } => None,
            })
            .collect()
    }

    pub(crate) fn family_factory(&self, family: FamilyKey) -> Option<FamilyFactory> {
        self.families.get(&family).cloned()
    }

    /// Whether a reader for `descriptor` must not be inherited from a parent.
    pub(crate) fn shadows(&self, descriptor: &Descriptor) -> bool {
        self.nodes.contains_key(&descriptor.key())
            || descriptor
                .family()
                .is_some_and(|family| self.families.contains_key(&family.key()))
    }

    /// Remember the replacement a family factory produced for `member`.
    pub(crate) fn record_member(&mut self, member: &Descriptor, replacement: ErasedProvider) {
        self.members
            .insert(member.key(), (member.clone(), replacement));
    }

    pub(crate) fn member_override(&self, member: NodeKey) -> Option<ErasedProvider> {
        self.members
            .get(&member)
            .map(|(_, replacement)| Arc::clone(replacement))
    }

    /// Reject a list whose shape differs from the declared one.
    pub(crate) fn check_shape(&self, next: &[Override]) -> Result<()> {
        if next.len() != self.declared.len() {
            return Err(GraphError::InvalidOverrideMutation {
                reason: format!(
                    "expected {} overrides, got {}",
                    self.declared.len(),
                    next.len()
                ),
            });
        }

        for (index, (previous, entry)) in self.declared.iter().zip(next).enumerate() {
            if !previous.same_origin(entry) {
                return Err(GraphError::InvalidOverrideMutation {
                    reason: format!(
                        "override #{index} changed from {} to {}",
                        previous.origin_name(),
                        entry.origin_name()
                    ),
                });
            }
        }

        Ok(())
    }

    /// Install `next` and list the live changes it implies.
    pub(crate) fn replace(&mut self, next: Vec<Override>) -> Vec<Swap> {
        let mut swaps = Vec::new();

        for entry in &next {
            match &entry.kind {
                OverrideKind::Node {
                    origin,
                    replacement,
                } => {
                    self.nodes.insert(origin.key(), Arc::clone(replacement));
                    swaps.push(Swap::Node {
                        origin: origin.key(),
                        replacement: Arc::clone(replacement),
                    });
                }
                OverrideKind::Family { family, factory } => {
                    self.families.insert(family.key(), Arc::clone(factory));
                    for (member, _) in self.members.values() {
                        let belongs = member
                            .family()
                            .is_some_and(|member_family| member_family.key() == family.key());
                        if belongs {
                            swaps.push(Swap::Member {
                                member: member.clone(),
                                factory: Arc::clone(factory),
                            });
                        }
                    }
                }
            }
        }

        self.declared = next;
        swaps
    }
}
