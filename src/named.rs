//! The string-keyed store.
//!
//! Keys are case-insensitive: they are lower-cased before any lookup, so
//! `"UserName"` and `"username"` address the same channel. Values are
//! type-erased [`Payload`]s, or `None` for an explicit "no value". Once a
//! channel holds a payload of some type, publishing a payload of another
//! type fails with [`StateError::TypeMismatch`].
//!
//! ```
//! use statecast::{NamedStore, Payload, StateHandler};
//!
//! let store = NamedStore::new();
//! let handler = StateHandler::new(|state| {
//!     let status = state.as_ref().and_then(|p| p.downcast_ref::<&str>());
//!     assert_eq!(status, Some(&"online"));
//! });
//! store.subscribe("Status", handler).unwrap();
//! store.update_state("status", Payload::new("online")).unwrap();
//! ```

use std::{
    any::{Any, TypeId, type_name},
    fmt,
    sync::Arc,
};

use tracing::{debug, trace, warn};

use crate::{
    channel::{Channel, Published},
    config::StoreConfig,
    error::StateError,
    handler::{Handler, SubscriptionId},
    registry::Registry,
    watch::Watcher,
};

/// Object-safe view of a payload value.
trait ErasedValue: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;

    fn dyn_eq(&self, other: &dyn ErasedValue) -> bool;

    fn dyn_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T> ErasedValue for T
where
    T: Any + PartialEq + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn dyn_eq(&self, other: &dyn ErasedValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn dyn_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A type-erased, cheaply cloneable state value.
///
/// Two payloads are equal if they share an allocation, or if they hold
/// values of the same type that compare equal.
#[derive(Clone)]
pub struct Payload(Arc<dyn ErasedValue>);

impl Payload {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + PartialEq + fmt::Debug + Send + Sync,
    {
        Payload(Arc::new(value))
    }

    /// Returns the value if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.value_type_id() == TypeId::of::<T>()
    }

    /// `TypeId` of the stored value.
    #[must_use]
    pub fn value_type_id(&self) -> TypeId {
        Any::type_id(self.0.as_any())
    }

    /// Name of the stored value's type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Returns `true` if both payloads share one allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.dyn_eq(&*other.0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dyn_fmt(f)
    }
}

/// Value stored by a named channel; `None` is an explicit "no value".
pub type NamedValue = Option<Payload>;

/// Subscriber callback for a named channel.
pub type StateHandler = Handler<NamedValue>;

/// A store of channels keyed by case-insensitive strings.
pub struct NamedStore {
    config: StoreConfig,
    channels: Registry<String, Channel<NamedValue>>,
}

impl NamedStore {
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

    /// Publishes `value` under `key`, creating the channel if needed.
    ///
    /// Returns whether subscribers were notified.
    ///
    /// # Errors
    /// - [`StateError::InvalidKey`] if `key` is blank.
    /// - [`StateError::TypeMismatch`] if the channel holds a payload of a
    ///   different type. The stored value is left unchanged.
    /// - [`StateError::HandlerFault`] if the store isolates handler panics
    ///   and one occurred.
    pub fn update_state(
        &self,
        key: &str,
        value: impl Into<NamedValue>,
    ) -> Result<bool, StateError> {
        let key = normalize(key)?;
        let mut value = value.into();
        loop {
            let channel = self.resolve(key.clone());
            let published = channel.try_publish(value, |previous, next| {
                check_same_type(channel.name(), previous, next)
            })?;
            match published {
                // Lost a race with `dispose`; the next lookup creates a
                // fresh channel.
                Published::Closed(returned) => {
                    trace!(key = %key, "channel disposed during update, retrying");
                    value = returned;
                }
                published => return Ok(published.notified()),
            }
        }
    }

    /// Registers `handler` under `key`. A channel that does not exist yet is
    /// created unset, so subscribers may register before any producer.
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn subscribe(&self, key: &str, handler: StateHandler) -> Result<SubscriptionId, StateError> {
        let key = normalize(key)?;
        loop {
            match self.resolve(key.clone()).subscribe(handler.clone()) {
                Err(StateError::Disposed { .. }) => {
                    trace!(key = %key, "channel disposed during subscribe, retrying");
                }
                registered => return registered,
            }
        }
    }

    /// Removes `handler` (by identity) from `key`.
    ///
    /// Returns `Ok(false)` if the channel or the handler is unknown.
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn unsubscribe(&self, key: &str, handler: &StateHandler) -> Result<bool, StateError> {
        let key = normalize(key)?;
        Ok(self
            .channels
            .get(&key)
            .is_some_and(|channel| channel.unsubscribe_handler(handler)))
    }

    /// Removes the registration identified by `id` from `key`.
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn unsubscribe_id(&self, key: &str, id: SubscriptionId) -> Result<bool, StateError> {
        let key = normalize(key)?;
        Ok(self
            .channels
            .get(&key)
            .is_some_and(|channel| channel.unsubscribe(id)))
    }

    /// Returns the value stored under `key`.
    ///
    /// `Ok(None)` if the key is unknown, was never published to, or holds an
    /// explicit "no value".
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn get_current_state(&self, key: &str) -> Result<Option<Payload>, StateError> {
        let key = normalize(key)?;
        Ok(self
            .channels
            .get(&key)
            .and_then(|channel| channel.current())
            .flatten())
    }

    /// Returns a clone of the value under `key` if it is a `T`.
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn get_current_as<T: Any + Clone>(&self, key: &str) -> Result<Option<T>, StateError> {
        Ok(self
            .get_current_state(key)?
            .and_then(|payload| payload.downcast_ref::<T>().cloned()))
    }

    /// Returns `true` if a channel exists for `key`.
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn contains(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.channels.contains(&normalize(key)?))
    }

    /// Creates a [`Watcher`] for `key`, creating the channel if needed.
    ///
    /// # Errors
    /// [`StateError::InvalidKey`] if `key` is blank.
    pub fn watch(&self, key: &str) -> Result<Watcher<NamedValue>, StateError> {
        Ok(self.resolve(normalize(key)?).watch())
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
        debug!(channels = closed, "disposed named store");
    }

    fn resolve(&self, key: String) -> Arc<Channel<NamedValue>> {
        self.channels.resolve_with(key, |key| {
            debug!(key = %key, "creating named channel");
            Arc::new(Channel::new(key.clone(), self.config.fault_policy))
        })
    }
}

impl Default for NamedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NamedStore {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for NamedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedStore")
            .field("config", &self.config)
            .field("channels", &self.channels)
            .finish()
    }
}

fn normalize(key: &str) -> Result<String, StateError> {
    if key.trim().is_empty() {
        return Err(StateError::InvalidKey);
    }
    Ok(key.to_lowercase())
}

fn check_same_type(channel: &str, previous: &NamedValue, next: &NamedValue) -> Result<(), StateError> {
    match (previous, next) {
        (Some(previous), Some(next)) if previous.value_type_id() != next.value_type_id() => {
            warn!(
                channel,
                expected = previous.type_name(),
                found = next.type_name(),
                "state type conflict"
            );
            Err(StateError::TypeMismatch {
                channel: channel.to_owned(),
                expected: previous.type_name(),
                found: next.type_name(),
            })
        }
        _ => Ok(()),
    }
}
