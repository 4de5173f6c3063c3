// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

const DEFAULT_CAPACITY: usize = 100;

/// Bounded least-recently-used map for task-row lookups.
///
/// Entries live in stable slots; the recency list holds slot indices, so
/// updating an existing key overwrites its slot in place and re-files the
/// index. No handle into the cache is ever invalidated by a `put`.
/// Owned by a single thread, never shared.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<(K, V)>>,
    free: Vec<usize>,
    /// Front = most recently used.
    recency: VecDeque<usize>,
}

impl<K: Eq + Hash + Clone, V> Default for LruCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.touch(slot);
        self.slots[slot].as_ref().map(|(_, v)| v)
    }

    pub fn put(&mut self, key: K, value: V) {
        if let Some(&slot) = self.map.get(&key) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.1 = value;
            }
            self.touch(slot);
            return;
        }

        if self.map.len() >= self.capacity {
            self.evict_oldest();
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some((key.clone(), value));
                slot
            }
            None => {
                self.slots.push(Some((key.clone(), value)));
                self.slots.len() - 1
            }
        };

        self.map.insert(key, slot);
        self.recency.push_front(slot);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.map.remove(key)?;
        self.recency.retain(|&s| s != slot);
        self.free.push(slot);
        self.slots[slot].take().map(|(_, v)| v)
    }

    fn touch(&mut self, slot: usize) {
        if self.recency.front() == Some(&slot) {
            return;
        }
        self.recency.retain(|&s| s != slot);
        self.recency.push_front(slot);
    }

    fn evict_oldest(&mut self) {
        let Some(slot) = self.recency.pop_back() else {
            return;
        };
        if let Some((key, _)) = self.slots[slot].take() {
            self.map.remove(&key);
        }
        self.free.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::LruCache;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);

        // Touch "a" so "b" is the eviction candidate.
        assert_eq!(cache.get(&"a"), Some(&1));

        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"c"), Some(&3));
    }

    #[test]
    fn put_on_existing_key_updates_in_place() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);

        cache.put("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(&10));

        // The update also refreshed "a", so "b" goes first.
        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());

        cache.put("b", 2);
        cache.put("c", 3);
        assert_eq!(cache.len(), 2);
    }
}
