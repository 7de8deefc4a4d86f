//! Dependency Graph
//!
//! This module implements the graph of lazily created nodes that a
//! [`ProviderContainer`] owns, together with the bookkeeping around it.
//!
//! # Overview
//!
//! - Descriptors identify nodes. They are plain values; a node state is only
//!   created when a container first reads one.
//! - Edges run from a dependent to the nodes it read. Both directions are
//!   stored so changes can be pushed to dependents and disposal can walk
//!   dependents first.
//! - Changes travel in two phases: `mark_may_have_changed` flags a node and
//!   pings its listeners, and a later flush confirms or cancels the change.
//!
//! # Exclusivity
//!
//! At most one node is being built or disposed per container hierarchy at a
//! time. While that happens no other node may be marked as changed, including
//! nodes shared with a parent. The root container tracks the current holder
//! for all of its descendants and restores the previous one through a drop
//! guard, so nested builds unwind cleanly.

mod descriptor;
pub(crate) mod node;
mod observer;
mod overrides;
pub(crate) mod owner;
mod scheduler;

pub use descriptor::{Descriptor, FamilyKey, FamilyRef, NodeKey, NodeKind};
pub use node::{ListenerId, NodeId};
pub use observer::GraphObserver;
pub use overrides::Override;
pub use owner::{ContainerBuilder, ProviderContainer};

pub(crate) use overrides::FamilyFactory;
