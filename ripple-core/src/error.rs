//! Error Types
//!
//! Two families of failure exist in the graph:
//!
//! - [`GraphError`]: structural or protocol violations, and initializer
//!   failures. These are returned to the caller immediately and never
//!   retried.
//! - [`UncaughtError`]: a listener, observer or dispose callback panicked.
//!   These are isolated per callback and handed to an [`ErrorSink`] so one
//!   broken subscriber cannot corrupt a graph traversal.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::graph::Descriptor;

/// Convenience alias used throughout the crate.
pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Errors produced by graph operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// The container or node was used after being disposed.
    #[error("{target} was used after being disposed")]
    AlreadyDisposed {
        /// What was disposed (a node name or "container").
        target: String,
    },

    /// A node transitively depends on itself.
    #[error("circular dependency detected: {node} depends on itself")]
    CircularDependency {
        /// The node that closed the cycle.
        node: String,
    },

    /// `update_overrides` received a list with a different shape.
    #[error("override list changed shape: {reason}")]
    InvalidOverrideMutation {
        /// Which element differed and how.
        reason: String,
    },

    /// The node's initializer failed earlier. The same source is returned
    /// on every read.
    #[error("{node} failed to initialize: {source}")]
    Construction {
        /// The failing node.
        node: String,
        /// The original failure, shared by every read.
        source: Arc<GraphError>,
    },

    /// A notification or mutation rule was broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An initializer reported its own failure.
    #[error("{0}")]
    Init(Arc<dyn std::error::Error + Send + Sync>),

    /// An initializer panicked.
    #[error("initializer panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

impl GraphError {
    /// Wrap an arbitrary error returned by an initializer.
    pub fn init<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GraphError::Init(Arc::new(error))
    }

    /// Build an initializer failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        GraphError::Init(Arc::new(Message(message.into())))
    }

    pub(crate) fn disposed(target: impl fmt::Display) -> Self {
        GraphError::AlreadyDisposed {
            target: target.to_string(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        GraphError::ProtocolViolation(message.into())
    }

    /// Follow `Construction` chains down to the failure that started them.
    ///
    /// When X reads Y and Y fails, X's own failure wraps Y's, so the root of
    /// a circular read is the `CircularDependency` raised deepest in the
    /// chain.
    pub fn root(&self) -> &GraphError {
        let mut current = self;
        while let GraphError::Construction { source, .. } = current {
            current = source.as_ref();
        }
        current
    }

    /// Whether the root failure is a circular dependency.
    pub fn is_circular(&self) -> bool {
        matches!(self.root(), GraphError::CircularDependency { .. })
    }
}

/// Which kind of callback raised an [`UncaughtError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackOrigin {
    /// A lazy listener's "may have changed" callback.
    Listener,
    /// A subscription's change callback.
    ChangeCallback,
    /// A [`GraphObserver`](crate::graph::GraphObserver) method.
    Observer,
    /// A callback registered with `on_dispose`.
    DisposeCallback,
}

impl fmt::Display for CallbackOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackOrigin::Listener => "listener",
            CallbackOrigin::ChangeCallback => "change callback",
            CallbackOrigin::Observer => "observer",
            CallbackOrigin::DisposeCallback => "dispose callback",
        };
        f.write_str(name)
    }
}

/// A callback failure that was isolated instead of propagated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("uncaught error in {origin} of {node}: {message}")]
pub struct UncaughtError {
    /// The kind of callback that failed.
    pub origin: CallbackOrigin,
    /// Display name of the node the callback belonged to.
    pub node: String,
    /// The panic message.
    pub message: String,
}

/// Destination for isolated callback failures.
pub trait ErrorSink: Send + Sync {
    /// Receive one isolated failure.
    fn report(&self, error: UncaughtError);
}

impl<F> ErrorSink for F
where
    F: Fn(UncaughtError) + Send + Sync,
{
    fn report(&self, error: UncaughtError) {
        self(error)
    }
}

/// The default sink: logs every failure at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, error: UncaughtError) {
        tracing::error!(
            origin = %error.origin,
            node = %error.node,
            "{}",
            error.message
        );
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a user callback, routing a panic to `sink` instead of unwinding
/// through the graph.
pub(crate) fn isolate<F>(sink: &dyn ErrorSink, origin: CallbackOrigin, node: &Descriptor, f: F)
where
    F: FnOnce(),
{
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        sink.report(UncaughtError {
            origin,
            node: node.to_string(),
            message: panic_message(payload.as_ref()),
        });
    }
}
