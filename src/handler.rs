//! Subscriber callbacks and the tokens that identify a registration.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
};

/// A subscriber callback for a channel holding values of type `T`.
///
/// Cloning a `Handler` yields another reference to the **same** callback.
/// Channels compare handlers by that identity, so subscribing a clone of an
/// already-registered handler is a no-op.
pub struct Handler<T> {
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> Handler<T> {
    /// Wraps a closure into a new handler with its own identity.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Invokes the callback.
    #[inline]
    pub fn call(&self, value: &T) {
        (self.callback)(value)
    }

    /// Returns `true` if both handlers refer to the same callback.
    #[must_use]
    pub fn same_handler(&self, other: &Self) -> bool {
        // Compare data pointers only; vtable pointers for the same closure
        // may differ across codegen units.
        std::ptr::addr_eq(Arc::as_ptr(&self.callback), Arc::as_ptr(&other.callback))
    }
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("ptr", &Arc::as_ptr(&self.callback).cast::<()>())
            .finish()
    }
}

/// Opaque token returned by `subscribe`, accepted by `unsubscribe`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriptionId(NEXT.fetch_add(1, Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}
