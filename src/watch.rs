//! Async observation of a single channel.
//!
//! Subscribed handlers run synchronously on the publisher's thread. A
//! [`Watcher`] is the pull-based alternative: it remembers the last version
//! it has seen and can wait for the next genuine change from any async
//! runtime.

use std::{fmt, ops::Deref, sync::Arc};

use parking_lot::MappedMutexGuard;

use crate::{channel::Channel, error::RecvError, state::Version};

/// A read-only guard over a channel's stored value.
///
/// Holds the channel lock while alive: publishers and subscribers of the
/// same channel block until it is dropped. Keep guard lifetimes short.
pub struct Guard<'a, V> {
    inner: MappedMutexGuard<'a, Option<V>>,
    has_changed: bool,
}

impl<V> Guard<'_, V> {
    /// Returns `true` if the value changed since the watcher last marked it
    /// as seen.
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }
}

impl<V> Deref for Guard<'_, V> {
    type Target = Option<V>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<V: fmt::Debug> fmt::Debug for Guard<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("value", &*self.inner)
            .field("has_changed", &self.has_changed)
            .finish()
    }
}

/// Tracks changes to one channel.
///
/// Created with [`Channel::watch`], `TypedStore::watch` or
/// `NamedStore::watch`. Cloning a watcher copies its seen version.
pub struct Watcher<V> {
    channel: Arc<Channel<V>>,
    version: Version,
}

impl<V> Watcher<V> {
    pub(crate) fn new(channel: Arc<Channel<V>>) -> Self {
        let version = channel.snapshot().version();
        Self { channel, version }
    }

    /// The channel being watched.
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel<V>> {
        &self.channel
    }

    /// Borrows the stored value without marking it as seen.
    #[must_use]
    pub fn borrow(&self) -> Guard<'_, V> {
        let inner = self.channel.lock_value();
        // Versions only move under the channel lock, so the version loaded
        // here matches the borrowed value.
        let has_changed = self.version != self.channel.snapshot().version();
        Guard { inner, has_changed }
    }

    /// Borrows the stored value and marks it as seen.
    #[must_use]
    pub fn borrow_and_update(&mut self) -> Guard<'_, V> {
        let inner = self.channel.lock_value();
        let current = self.channel.snapshot().version();
        let has_changed = self.version != current;
        self.version = current;
        Guard { inner, has_changed }
    }

    /// Checks whether a change was published since the value was last seen.
    ///
    /// # Errors
    /// Returns [`RecvError::Disposed`] if the channel has been disposed.
    pub fn has_changed(&self) -> Result<bool, RecvError> {
        self.load_change().ok_or(RecvError::Disposed)
    }

    /// Forces the next check to report a change.
    pub fn mark_changed(&mut self) {
        self.version.decrement();
    }

    /// Marks the current value as seen.
    pub fn mark_unchanged(&mut self) {
        self.version = self.channel.snapshot().version();
    }

    /// `None` if disposed, otherwise whether the version moved.
    #[inline]
    fn load_change(&self) -> Option<bool> {
        let snapshot = self.channel.snapshot();
        if snapshot.is_disposed() {
            return None;
        }
        Some(snapshot.version() != self.version)
    }

    /// Waits until a change is published that this watcher has not seen.
    ///
    /// Completes immediately if such a change already happened.
    ///
    /// # Errors
    /// Returns [`RecvError::Disposed`] if the channel is disposed before a
    /// change arrives.
    pub async fn changed(&self) -> Result<(), RecvError> {
        loop {
            // Register before checking so a change landing in between is
            // not missed.
            let listener = self.channel.changed_event().listen();
            match self.load_change() {
                Some(true) => return Ok(()),
                None => return Err(RecvError::Disposed),
                Some(false) => listener.await,
            }
        }
    }

    /// Waits until the stored value satisfies `cond` and returns a guard to
    /// it, marking it as seen.
    ///
    /// An unset channel is passed to `cond` as `None`.
    ///
    /// `cond` runs with the channel lock held; it must not read, publish to
    /// or subscribe on this channel (directly or through its store), or it
    /// deadlocks.
    ///
    /// # Errors
    /// Returns [`RecvError::Disposed`] if the channel is disposed before the
    /// condition holds.
    pub async fn wait_for<F>(&mut self, mut cond: F) -> Result<Guard<'_, V>, RecvError>
    where
        F: FnMut(Option<&V>) -> bool,
    {
        loop {
            {
                let guard = self.channel.lock_value();
                let current = self.channel.snapshot().version();
                let has_changed = self.version != current;
                self.version = current;
                if cond((*guard).as_ref()) {
                    return Ok(Guard {
                        inner: guard,
                        has_changed,
                    });
                }
            }
            if self.channel.is_disposed() {
                return Err(RecvError::Disposed);
            }
            self.changed().await?;
        }
    }
}

impl<V: Clone> Watcher<V> {
    /// Clones the stored value and marks it as seen.
    #[must_use]
    pub fn current_and_update(&mut self) -> Option<V> {
        (*self.borrow_and_update()).clone()
    }
}

#[cfg(feature = "stream")]
impl<V: Clone + PartialEq + Send + Sync + 'static> Watcher<V> {
    /// Converts the watcher into a stream of values.
    pub fn into_stream(self) -> crate::stream::WatchStream<V> {
        crate::stream::WatchStream::new(self)
    }
}

impl<V> Clone for Watcher<V> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            version: self.version,
        }
    }
}

impl<V> fmt::Debug for Watcher<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("channel", &self.channel.name())
            .field("version", &self.version)
            .finish()
    }
}
