//! # `statecast`
//!
//! In-process state channels with change-detecting publish/subscribe.
//!
//! A channel stores the last value published to it and an ordered list of
//! subscribers. Publishing a value that differs from the stored one invokes
//! every subscriber, synchronously and in registration order, on the
//! publisher's thread. Publishing an equal value only overwrites the stored
//! value. Late subscribers catch up by reading the current state.
//!
//! Two stores share the same channel core:
//!
//! - [`TypedStore`]: channels identified by a [`Topic`] marker type, values
//!   checked at compile time.
//! - [`NamedStore`]: channels identified by case-insensitive strings,
//!   values carried as type-erased [`Payload`]s with a runtime type check.
//!
//! Both are `Send + Sync` and may be shared between threads behind an `Arc`.
//!
//! # Usage
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use statecast::{NamedStore, Payload, StateHandler};
//!
//! let store = NamedStore::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let log = seen.clone();
//! store
//!     .subscribe("status", StateHandler::new(move |state| {
//!         log.lock().unwrap().push(state.clone());
//!     }))
//!     .unwrap();
//!
//! store.update_state("status", Payload::new("online")).unwrap();
//! // Same value again: stored, but nobody is notified.
//! store.update_state("Status", Payload::new("online")).unwrap();
//!
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! assert_eq!(store.get_current_as::<&str>("STATUS").unwrap(), Some("online"));
//! ```
//!
//! # Features
//!
//! - `stream`: [`stream::WatchStream`], a `futures` stream over a
//!   [`Watcher`].

mod channel;
mod config;
mod handler;
mod named;
mod registry;
mod state;
#[cfg(feature = "stream")]
pub mod stream;
mod typed;
mod watch;

pub use channel::Channel;
pub use config::{FaultPolicy, StoreConfig};
pub use handler::{Handler, SubscriptionId};
pub use named::{NamedStore, NamedValue, Payload, StateHandler};
pub use registry::Registry;
pub use state::Version;
pub use typed::{Topic, TypedStore};
pub use watch::{Guard, Watcher};

/// Error types for store and channel operations.
pub mod error {
    use thiserror::Error;

    /// Error returned by publish, subscribe and read operations.
    #[derive(Debug, Clone, Error, PartialEq, Eq)]
    pub enum StateError {
        /// The channel key is empty or whitespace.
        #[error("state key must not be empty or whitespace")]
        InvalidKey,
        /// The channel already holds a value of another type. This is a
        /// programming error at the call site; retrying will not help.
        #[error("the state type must be {expected} (channel `{channel}` received {found})")]
        TypeMismatch {
            channel: String,
            expected: &'static str,
            found: &'static str,
        },
        /// One or more subscribers panicked while a change was delivered.
        /// Only reported when handler faults are isolated.
        #[error("{failed} subscriber(s) of channel `{channel}` panicked during delivery")]
        HandlerFault { channel: String, failed: usize },
        /// The channel was disposed. Store operations never return this;
        /// they move on to the replacement channel.
        #[error("channel `{channel}` has been disposed")]
        Disposed { channel: String },
    }

    /// Error returned when watching a disposed channel.
    #[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
    pub enum RecvError {
        /// The owning store disposed the channel.
        #[error("channel has been disposed")]
        Disposed,
    }
}

pub use error::{RecvError, StateError};
