//! Ripple Core
//!
//! This crate provides a reactive dependency-graph runtime. It implements:
//!
//! - A container that lazily builds named computation nodes on first read
//! - Dependency tracking between nodes, with cycle detection
//! - Two-phase change propagation ("may have changed", then flush)
//! - Subscriptions and selectors that emit once per confirmed change
//! - Overrides, including live replacement and parameterized families
//! - Teardown in reverse dependency order
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: node states, the container that owns them, overrides and the
//!   traversals used for cycle checks and disposal
//! - `reactive`: typed providers, contexts, handles and subscriptions
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Provider, ProviderContainer};
//!
//! let count = Provider::new(|_| Ok(1)).named("count");
//! let doubled = {
//!     let count = count.clone();
//!     Provider::computed(move |ctx| Ok(ctx.watch(&count)? * 2)).named("doubled")
//! };
//!
//! let container = ProviderContainer::new();
//! assert_eq!(container.read(&doubled).unwrap(), 2);
//!
//! container.node(&count).unwrap().set(5).unwrap();
//! assert_eq!(container.read(&doubled).unwrap(), 10);
//!
//! container.dispose().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::GraphConfig;
pub use error::{CallbackOrigin, ErrorSink, GraphError, Result, TracingSink, UncaughtError};
pub use graph::{
    ContainerBuilder, Descriptor, FamilyKey, FamilyRef, GraphObserver, ListenerId, NodeId, NodeKey,
    NodeKind, Override, ProviderContainer,
};
pub use reactive::{
    Dependency, Family, NodeContext, NodeHandle, Provider, SelectorSubscription, Subscription,
};
