//! Reactive Surface
//!
//! The typed layer over the graph. It defines what a node computes and how
//! user code talks to it.
//!
//! # Concepts
//!
//! ## Providers
//!
//! A [`Provider<T>`] describes a node: its identity and how to build its
//! value. It holds no state. Reading the same provider from two containers
//! yields two independent nodes.
//!
//! ## Contexts
//!
//! An initializer receives a [`NodeContext`]. Reading other providers through
//! it records them as dependencies, and `watch` additionally propagates
//! their "may have changed" marks to the node being built.
//!
//! ## Handles and Subscriptions
//!
//! A [`NodeHandle`] is the update surface of a built node. Subscriptions
//! observe a node in two tiers: a cheap synchronous callback on every mark
//! and a value callback on flush, once per confirmed change.

mod context;
mod handle;
mod provider;
mod runtime;
mod subscriber;

pub use context::NodeContext;
pub use handle::{Dependency, NodeHandle};
pub use provider::{Family, Provider};
pub use subscriber::{SelectorSubscription, Subscription};
