use std::collections::HashMap;
use std::hash::Hash;

use polymap_datastore::DatastoreSession;

use crate::error::RuntimeResult;
use crate::instance::Instance;

/// Identity map from record identity to the live instance bound to it.
///
/// Holds at most one instance per identity. Closed entries are treated as
/// absent. Not thread-safe; each session owns its caches.
pub struct InstanceCache<K, S: DatastoreSession> {
    entries: HashMap<K, Instance<S>>,
}

impl<K: Eq + Hash, S: DatastoreSession> InstanceCache<K, S> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The live instance for `id`, if any.
    pub fn get(&self, id: &K) -> Option<Instance<S>> {
        self.entries.get(id).filter(|i| !i.is_closed()).cloned()
    }

    /// Return the cached instance, or build and cache a new one.
    ///
    /// The flag is `true` when the instance was built by this call. A failing
    /// `build` leaves the cache unchanged.
    pub fn get_or_create(
        &mut self,
        id: K,
        build: impl FnOnce() -> RuntimeResult<Instance<S>>,
    ) -> RuntimeResult<(Instance<S>, bool)> {
        if let Some(instance) = self.get(&id) {
            return Ok((instance, false));
        }
        let instance = build()?;
        self.entries.insert(id, instance.clone());
        Ok((instance, true))
    }

    /// Cache `instance`, returning whatever was cached for `id` before.
    pub fn insert(&mut self, id: K, instance: Instance<S>) -> Option<Instance<S>> {
        self.entries.insert(id, instance)
    }

    /// Evict without closing.
    pub fn remove(&mut self, id: &K) -> Option<Instance<S>> {
        self.entries.remove(id)
    }

    /// Evict and close. Returns `false` when nothing live was cached.
    pub fn close(&mut self, id: &K) -> bool {
        match self.entries.remove(id) {
            Some(instance) => instance.mark_closed(),
            None => false,
        }
    }

    /// Close every cached instance and empty the cache. Returns the number
    /// of entries removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for (_, instance) in self.entries.drain() {
            instance.mark_closed();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance<S>> {
        self.entries.values()
    }
}

impl<K: Eq + Hash, S: DatastoreSession> Default for InstanceCache<K, S> {
    fn default() -> Self {
        Self::new()
    }
}
