//! Identifier to channel map shared by both stores.

use std::{borrow::Borrow, collections::HashMap, fmt, hash::Hash, sync::Arc};

use parking_lot::RwLock;

/// Maps identifiers to lazily created, shared entries.
///
/// At most one entry exists per key for the registry's lifetime (or until
/// [`drain`](Self::drain)). `C` may be unsized so a single registry can
/// hold channels of different value types behind a trait object.
pub struct Registry<K, C: ?Sized> {
    entries: RwLock<HashMap<K, Arc<C>>>,
}

impl<K, C> Registry<K, C>
where
    K: Eq + Hash,
    C: ?Sized,
{
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Returns the entry for `key`, creating it with `make` on first access.
    ///
    /// Creation is atomic: when several callers race on an unseen key, only
    /// the first to take the write lock runs `make`; every caller receives
    /// that same instance.
    pub fn resolve_with<F>(&self, key: K, make: F) -> Arc<C>
    where
        F: FnOnce(&K) -> Arc<C>,
    {
        if let Some(entry) = self.entries.read().get(&key) {
            return entry.clone();
        }
        let mut entries = self.entries.write();
        entries
            .entry(key)
            .or_insert_with_key(|key| make(key))
            .clone()
    }

    /// Returns the entry for `key` if it exists.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<C>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().get(key).cloned()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every entry, passing each to `retire` while the registry is
    /// still write-locked, and returns how many there were.
    ///
    /// No caller can resolve a replacement for a key until every old entry
    /// has been retired. `retire` must not touch this registry.
    pub fn drain_with(&self, mut retire: impl FnMut(Arc<C>)) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        for (_, entry) in entries.drain() {
            retire(entry);
        }
        count
    }
}

impl<K, C> Default for Registry<K, C>
where
    K: Eq + Hash,
    C: ?Sized,
{
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<K, C: ?Sized> fmt::Debug for Registry<K, C>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
