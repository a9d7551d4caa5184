//! Count- and cost-bounded LRU used as the memory tier of the store.
//!
//! The interior map is an unbounded [`lru::LruCache`]; admission and
//! eviction are driven by our own budgets so an entry's cost (its body
//! size) counts against the cache alongside the entry count.

use std::hash::Hash;
use std::sync::RwLock;

use lru::LruCache;

use super::lock::{rw_read, rw_write};

/// A concurrent LRU bounded by entry count and total entry cost.
///
/// Either budget set to `0` leaves that axis unbounded. Reads that promote
/// recency (`get`, `load_or_compute`) take the exclusive lock, as the
/// recency list is mutated on access; `peek`, `range`, `len` and `cost`
/// stay on the shared lock.
pub struct Lru<K: Hash + Eq, V: Clone> {
    max_entries: usize,
    max_cost: u64,
    inner: RwLock<Inner<K, V>>,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Costed<V>>,
    current_cost: u64,
}

struct Costed<V> {
    value: V,
    cost: u64,
}

impl<K: Hash + Eq, V> Inner<K, V> {
    /// Pop from the cold end until both budgets hold again.
    fn evict_to_budget(&mut self, max_entries: usize, max_cost: u64) {
        while (max_entries > 0 && self.entries.len() > max_entries)
            || (max_cost > 0 && self.current_cost > max_cost)
        {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.current_cost -= evicted.cost,
                None => break,
            }
        }
    }
}

impl<K: Hash + Eq, V: Clone> Lru<K, V> {
    pub fn new(max_entries: usize, max_cost: u64) -> Self {
        Self {
            max_entries,
            max_cost,
            inner: RwLock::new(Inner {
                entries: LruCache::unbounded(),
                current_cost: 0,
            }),
        }
    }

    /// Look up a key, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = rw_write(&self.inner, "lru.get");
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Look up a key without touching recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        let inner = rw_read(&self.inner, "lru.peek");
        inner.entries.peek(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace an entry, then evict until the budgets hold.
    ///
    /// Returns `true` when an existing entry was replaced. Replacement
    /// re-charges the cost delta before eviction runs.
    pub fn put(&self, key: K, value: V, cost: u64) -> bool {
        let mut inner = rw_write(&self.inner, "lru.put");
        let replaced = match inner.entries.put(key, Costed { value, cost }) {
            Some(old) => {
                inner.current_cost = inner.current_cost - old.cost + cost;
                true
            }
            None => {
                inner.current_cost += cost;
                false
            }
        };
        inner.evict_to_budget(self.max_entries, self.max_cost);
        replaced
    }

    pub fn delete(&self, key: &K) {
        let mut inner = rw_write(&self.inner, "lru.delete");
        if let Some(removed) = inner.entries.pop(key) {
            inner.current_cost -= removed.cost;
        }
    }

    /// Return the existing value for `key`, or run `produce` to fill it.
    ///
    /// Presence is checked again under the exclusive lock before the
    /// producer runs, so at most one producer executes per missing key.
    /// A producer returning `None` declines admission: nothing is stored
    /// and `None` is handed back. The second tuple field is `true` when a
    /// previously stored value was returned.
    pub fn load_or_compute(
        &self,
        key: K,
        produce: impl FnOnce() -> Option<(V, u64)>,
    ) -> (Option<V>, bool) {
        let mut inner = rw_write(&self.inner, "lru.load_or_compute");
        if let Some(existing) = inner.entries.get(&key) {
            return (Some(existing.value.clone()), true);
        }
        match produce() {
            Some((value, cost)) => {
                inner.entries.put(key, Costed { value: value.clone(), cost });
                inner.current_cost += cost;
                inner.evict_to_budget(self.max_entries, self.max_cost);
                (Some(value), false)
            }
            None => (None, false),
        }
    }

    /// Visit every entry, most-recent first, without promoting recency.
    ///
    /// Iteration stops early when `visit` returns `false`. The callback
    /// must not call back into this LRU; the shared lock is held for the
    /// duration of the sweep.
    pub fn range(&self, mut visit: impl FnMut(&K, &V) -> bool) {
        let inner = rw_read(&self.inner, "lru.range");
        for (key, entry) in inner.entries.iter() {
            if !visit(key, &entry.value) {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, "lru.len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the costs of all live entries.
    pub fn cost(&self) -> u64 {
        rw_read(&self.inner, "lru.cost").current_cost
    }
}
