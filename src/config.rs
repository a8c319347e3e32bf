//! Store configuration.

/// What a channel does when a subscriber panics during delivery.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FaultPolicy {
    /// The panic unwinds into the publisher. Handlers ordered after the
    /// failing one are not invoked.
    #[default]
    Propagate,
    /// Every handler is attempted. Panics are caught, logged, and reported
    /// to the publisher as [`StateError::HandlerFault`](crate::error::StateError::HandlerFault)
    /// once delivery is complete.
    Isolate,
}

/// Configuration shared by every channel a store creates.
///
/// ```
/// use statecast::{FaultPolicy, NamedStore, StoreConfig};
///
/// let config = StoreConfig::default().with_fault_policy(FaultPolicy::Isolate);
/// let store = NamedStore::with_config(config);
/// # let _ = store;
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreConfig {
    pub fault_policy: FaultPolicy,
    /// Number of channels the registry reserves room for up front.
    pub capacity: usize,
}

impl StoreConfig {
    #[must_use]
    pub fn with_fault_policy(mut self, fault_policy: FaultPolicy) -> Self {
        self.fault_policy = fault_policy;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_propagates() {
        let config = StoreConfig::default();
        assert_eq!(config.fault_policy, FaultPolicy::Propagate);
        assert_eq!(config.capacity, 0);
    }

    #[test]
    fn builder_overrides() {
        let config = StoreConfig::default()
            .with_fault_policy(FaultPolicy::Isolate)
            .with_capacity(16);
        assert_eq!(config.fault_policy, FaultPolicy::Isolate);
        assert_eq!(config.capacity, 16);
    }
}
