//! pdk-kv
//!
//! A thread-safe keyed store with atomic insert-if-absent, update-in-place,
//! and snapshot iteration. This is the only shared mutable in-memory state
//! primitive in the coordination core: the active-plan registry, the per-plan
//! queue map, the per-provider circuit table, and the stream ledger are all
//! instances of [`ConcurrentKv`].
//!
//! Values are `Clone`; registries that need shared mutation store `Arc<…>`
//! so a clone is a handle, not a copy.

use std::collections::HashMap;
use std::sync::RwLock;

/// Thread-safe `String → V` store.
///
/// All operations are safe under arbitrary parallel callers.
/// `set_if_absent` is serialisable with respect to `set` and `delete`:
/// of N racing `set_if_absent` callers for the same absent key, exactly one
/// observes `loaded == false`.
#[derive(Debug)]
pub struct ConcurrentKv<V> {
    inner: RwLock<HashMap<String, V>>,
}

impl<V> Default for ConcurrentKv<V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> ConcurrentKv<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot read of a single key.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().expect("kv lock poisoned").get(key).cloned()
    }

    /// Insert or overwrite.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.inner
            .write()
            .expect("kv lock poisoned")
            .insert(key.into(), value);
    }

    /// Remove a key. Idempotent; returns the removed value if present.
    pub fn delete(&self, key: &str) -> Option<V> {
        self.inner.write().expect("kv lock poisoned").remove(key)
    }

    /// Atomic insert-if-absent.
    ///
    /// Returns `(actual, loaded)`: the value now stored under `key`, and
    /// whether it was already present. `loaded == false` means this call
    /// installed `value`.
    pub fn set_if_absent(&self, key: impl Into<String>, value: V) -> (V, bool) {
        let mut map = self.inner.write().expect("kv lock poisoned");
        match map.entry(key.into()) {
            std::collections::hash_map::Entry::Occupied(e) => (e.get().clone(), true),
            std::collections::hash_map::Entry::Vacant(e) => (e.insert(value).clone(), false),
        }
    }

    /// Apply `f` to the stored value while holding exclusive access.
    ///
    /// No-op when the key is absent; returns whether `f` ran. For `Arc`-like
    /// values this is mutation of the handle slot, not of the pointee.
    pub fn update<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let mut map = self.inner.write().expect("kv lock poisoned");
        match map.get_mut(key) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Independent copy of all entries. Mutating the copy does not affect
    /// the store.
    pub fn snapshot_items(&self) -> Vec<(String, V)> {
        self.inner
            .read()
            .expect("kv lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("kv lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("kv lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Only for swapping in fresh registries between tests.
    #[cfg(any(test, feature = "testkit"))]
    pub fn reset_for_test(&self) {
        self.inner.write().expect("kv lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn get_set_delete() {
        let kv = ConcurrentKv::new();
        assert_eq!(kv.get("a"), None);
        kv.set("a", 1);
        assert_eq!(kv.get("a"), Some(1));
        kv.set("a", 2);
        assert_eq!(kv.get("a"), Some(2));
        assert_eq!(kv.delete("a"), Some(2));
        assert_eq!(kv.delete("a"), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn set_if_absent_returns_existing() {
        let kv = ConcurrentKv::new();
        let (v, loaded) = kv.set_if_absent("k", 10);
        assert_eq!((v, loaded), (10, false));
        let (v, loaded) = kv.set_if_absent("k", 99);
        assert_eq!((v, loaded), (10, true));
        assert_eq!(kv.get("k"), Some(10));
    }

    #[test]
    fn update_is_noop_when_absent() {
        let kv: ConcurrentKv<i32> = ConcurrentKv::new();
        assert!(!kv.update("missing", |v| *v += 1));
        kv.set("n", 1);
        assert!(kv.update("n", |v| *v += 1));
        assert_eq!(kv.get("n"), Some(2));
    }

    #[test]
    fn snapshot_is_independent() {
        let kv = ConcurrentKv::new();
        kv.set("a", 1);
        let mut snap = kv.snapshot_items();
        snap[0].1 = 42;
        assert_eq!(kv.get("a"), Some(1));
        kv.set("b", 2);
        assert_eq!(snap.len(), 1);
    }

    /// Of N racing set_if_absent callers for the same absent key, exactly one
    /// must report loaded == false.
    #[test]
    fn racing_set_if_absent_installs_exactly_once() {
        const CALLERS: usize = 32;
        let kv = Arc::new(ConcurrentKv::new());
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let kv = Arc::clone(&kv);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let (_, loaded) = kv.set_if_absent("contended", i);
                    loaded
                })
            })
            .collect();

        let installed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|loaded| !loaded)
            .count();
        assert_eq!(installed, 1, "exactly one caller must install the value");
        assert_eq!(kv.len(), 1);
    }
}
