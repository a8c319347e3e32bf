//! The type-keyed store.
//!
//! Channels are identified by a marker type implementing [`Topic`]. The
//! marker fixes the value type at compile time, so a type conflict on a
//! typed channel cannot be expressed, and "no value" can never be
//! dispatched.
//!
//! ```
//! use statecast::{Handler, Topic, TypedStore};
//!
//! struct MoviesLoaded;
//! impl Topic for MoviesLoaded {
//!     type Value = bool;
//! }
//!
//! let store = TypedStore::new();
//! store.subscribe::<MoviesLoaded>(Handler::new(|loaded: &bool| assert!(*loaded)));
//! store.dispatch::<MoviesLoaded>(true).unwrap();
//! assert_eq!(store.current_state::<MoviesLoaded>(), Some(true));
//! ```

use std::{
    any::{TypeId, type_name},
    fmt,
    sync::Arc,
};

use tracing::{debug, trace};

use crate::{
    channel::{Channel, ErasedChannel, Published},
    config::StoreConfig,
    error::StateError,
    handler::{Handler, SubscriptionId},
    registry::Registry,
    watch::Watcher,
};

/// A channel marker. Implement it on a (usually zero-sized) type to declare
/// a channel and the type of value it carries.
pub trait Topic: 'static {
    type Value: Clone + PartialEq + Send + Sync + 'static;
}

/// A store of channels keyed by [`Topic`] marker types.
pub struct TypedStore {
    config: StoreConfig,
    channels: Registry<TypeId, dyn ErasedChannel>,
}

impl TypedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            channels: Registry::with_capacity(config.capacity),
        }
    }

    /// Returns the channel for `T`, creating it on first access.
    pub fn channel<T: Topic>(&self) -> Arc<Channel<T::Value>> {
        let erased = self.channels.resolve_with(TypeId::of::<T>(), |_| {
            debug!(topic = type_name::<T>(), "creating typed channel");
            let channel: Arc<dyn ErasedChannel> = Arc::new(Channel::<T::Value>::new(
                type_name::<T>(),
                self.config.fault_policy,
            ));
            channel
        });
        match erased.into_any().downcast::<Channel<T::Value>>() {
            Ok(channel) => channel,
            // The TypeId key pins the value type: `T::Value` is fixed by `T`.
            Err(_) => unreachable!("typed channel for {} holds a foreign value type", type_name::<T>()),
        }
    }

    /// Publishes `value` on the channel for `T`.
    ///
    /// The value becomes the current state even if it equals the previous
    /// one; subscribers are only invoked on a genuine change. Returns
    /// whether subscribers were notified.
    ///
    /// # Errors
    /// Returns [`StateError::HandlerFault`] if the store isolates handler
    /// panics and one occurred.
    pub fn dispatch<T: Topic>(&self, mut value: T::Value) -> Result<bool, StateError> {
        loop {
            match self.channel::<T>().try_publish(value, |_, _| Ok(()))? {
                // Lost a race with `dispose`; the next lookup creates a
                // fresh channel.
                Published::Closed(returned) => {
                    trace!(topic = type_name::<T>(), "channel disposed during dispatch, retrying");
                    value = returned;
                }
                published => return Ok(published.notified()),
            }
        }
    }

    /// Registers `handler` on the channel for `T`.
    pub fn subscribe<T: Topic>(&self, handler: Handler<T::Value>) -> SubscriptionId {
        loop {
            match self.channel::<T>().subscribe(handler.clone()) {
                Ok(id) => return id,
                Err(_) => trace!(topic = type_name::<T>(), "channel disposed during subscribe, retrying"),
            }
        }
    }

    /// Removes a registration made with [`subscribe`](Self::subscribe).
    ///
    /// Returns `false` if the channel or the registration does not exist.
    pub fn unsubscribe<T: Topic>(&self, id: SubscriptionId) -> bool {
        self.existing::<T>()
            .is_some_and(|channel| channel.unsubscribe(id))
    }

    /// Last dispatched value for `T`, or `None` if nothing was dispatched.
    #[must_use]
    pub fn current_state<T: Topic>(&self) -> Option<T::Value> {
        self.existing::<T>().and_then(|channel| channel.current())
    }

    /// Last dispatched value for `T`, or the value type's default.
    #[must_use]
    pub fn current_state_or_default<T>(&self) -> T::Value
    where
        T: Topic,
        T::Value: Default,
    {
        self.current_state::<T>().unwrap_or_default()
    }

    /// Creates a [`Watcher`] for the channel of `T`.
    #[must_use]
    pub fn watch<T: Topic>(&self) -> Watcher<T::Value> {
        self.channel::<T>().watch()
    }

    /// Number of channels created so far.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Closes and forgets every channel. Handlers registered so far never
    /// fire again; the store starts over with fresh channels on next use.
    pub fn dispose(&self) {
        let closed = self.channels.drain_with(|channel| channel.close());
        debug!(channels = closed, "disposed typed store");
    }

    fn existing<T: Topic>(&self) -> Option<Arc<Channel<T::Value>>> {
        self.channels
            .get(&TypeId::of::<T>())
            .and_then(|erased| erased.into_any().downcast::<Channel<T::Value>>().ok())
    }
}

impl Default for TypedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TypedStore {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TypedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedStore")
            .field("config", &self.config)
            .field("channels", &self.channels.len())
            .finish()
    }
}
