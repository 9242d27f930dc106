//! Keyed per-resource state store.
//!
//! Every key owns its own mutex, so callers on unrelated keys never contend
//! beyond the brief map lookup. The map shard lock is released before the
//! per-key lock is taken.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::key::ResourceKey;

/// Concurrent map from [`ResourceKey`] to strategy-specific state.
///
/// Entries are created lazily on first use and live as long as the store.
pub struct KeyedStore<S> {
    entries: DashMap<ResourceKey, Arc<Mutex<S>>>,
}

impl<S> KeyedStore<S> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Run `f` against the state for `service.operation` under its lock,
    /// creating the state with `init` if the key is new.
    pub fn with_entry<R>(
        &self,
        service: &str,
        operation: &str,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let slot = self.slot(ResourceKey::new(service, operation), init);
        let mut state = slot.lock();
        f(&mut state)
    }

    /// Read the state for `service.operation`, if it exists.
    pub fn inspect<R>(&self, service: &str, operation: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        let key = ResourceKey::new(service, operation);
        let slot = self.entries.get(&key).map(|entry| Arc::clone(entry.value()))?;
        let state = slot.lock();
        Some(f(&state))
    }

    /// Visit every key, locking each one independently for the duration of `f`.
    ///
    /// Keys inserted while the pass is running may or may not be visited.
    pub fn for_each_mut(&self, mut f: impl FnMut(&ResourceKey, &mut S)) {
        let snapshot: Vec<(ResourceKey, Arc<Mutex<S>>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (key, slot) in snapshot {
            let mut state = slot.lock();
            f(&key, &mut state);
        }
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn slot(&self, key: ResourceKey, init: impl FnOnce() -> S) -> Arc<Mutex<S>> {
        if let Some(entry) = self.entries.get(&key) {
            return Arc::clone(entry.value());
        }

        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating new rate limit state");
            Arc::new(Mutex::new(init()))
        });
        Arc::clone(entry.value())
    }
}

impl<S> Default for KeyedStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_entries_created_lazily() {
        let store: KeyedStore<u64> = KeyedStore::new();
        assert!(store.is_empty());
        assert_eq!(store.inspect("s3", "GetObject", |v| *v), None);

        store.with_entry("s3", "GetObject", || 7, |v| *v += 1);

        assert_eq!(store.len(), 1);
        assert_eq!(store.inspect("s3", "GetObject", |v| *v), Some(8));
    }

    #[test]
    fn test_init_runs_once_per_key() {
        let store: KeyedStore<u64> = KeyedStore::new();

        store.with_entry("s3", "GetObject", || 1, |_| ());
        store.with_entry("s3", "GetObject", || 100, |v| *v += 1);

        assert_eq!(store.inspect("s3", "GetObject", |v| *v), Some(2));
    }

    #[test]
    fn test_keys_are_independent() {
        let store: KeyedStore<u64> = KeyedStore::new();

        store.with_entry("a", "op1", || 0, |v| *v += 5);
        store.with_entry("a", "op2", || 0, |v| *v += 3);
        store.with_entry("b", "op1", || 0, |v| *v += 1);

        assert_eq!(store.inspect("a", "op1", |v| *v), Some(5));
        assert_eq!(store.inspect("a", "op2", |v| *v), Some(3));
        assert_eq!(store.inspect("b", "op1", |v| *v), Some(1));
    }

    #[test]
    fn test_for_each_mut_visits_all_keys() {
        let store: KeyedStore<u64> = KeyedStore::new();
        store.with_entry("a", "op1", || 1, |_| ());
        store.with_entry("b", "op1", || 2, |_| ());

        let mut seen = Vec::new();
        store.for_each_mut(|key, v| {
            *v *= 10;
            seen.push(key.to_string());
        });
        seen.sort();

        assert_eq!(seen, vec!["a.op1", "b.op1"]);
        assert_eq!(store.inspect("a", "op1", |v| *v), Some(10));
        assert_eq!(store.inspect("b", "op1", |v| *v), Some(20));
    }

    #[test]
    fn test_concurrent_updates_are_serialized_per_key() {
        let store: Arc<KeyedStore<u64>> = Arc::new(KeyedStore::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.with_entry("s3", "GetObject", || 0, |v| *v += 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.inspect("s3", "GetObject", |v| *v), Some(8000));
    }

    #[test]
    fn test_clear() {
        let store: KeyedStore<u64> = KeyedStore::new();
        store.with_entry("s3", "GetObject", || 0, |_| ());
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }
}
