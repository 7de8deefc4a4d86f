//! Container observers.

use std::any::Any;

use super::Descriptor;

/// Receives lifecycle events for every node of a container.
///
/// Observers are registered when the container is built and invoked
/// synchronously. A panicking observer is reported to the container's
/// [`ErrorSink`](crate::ErrorSink) and the remaining observers still run.
///
/// Values are passed type-erased; downcast with
/// [`Any::downcast_ref`] to the provider's value type.
pub trait GraphObserver: Send + Sync {
    /// A node finished its initializer successfully.
    fn did_add_node(&self, descriptor: &Descriptor, value: &(dyn Any + Send + Sync)) {
        let _ = (descriptor, value);
    }

    /// A node confirmed a change.
    fn did_update_node(&self, descriptor: &Descriptor, value: &(dyn Any + Send + Sync)) {
        let _ = (descriptor, value);
    }

    /// A node was disposed.
    fn did_dispose_node(&self, descriptor: &Descriptor) {
        let _ = descriptor;
    }
}
