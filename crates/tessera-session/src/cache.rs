//! Strong-reference caches of recently used objects.
//!
//! A store keeps objects the application released alive while they sit in
//! its cache, so reloading a recently used row costs no query. Caches are
//! never a source of truth: removing an entry only makes the object
//! collectable again.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Bounded set of recently used keys.
///
/// Methods that can evict return the evicted keys so the owner can
/// collect them.
pub trait ObjectCache<K>: Send {
    /// Make `key` the most recent entry.
    fn add(&mut self, key: K) -> Vec<K>;

    /// Returns true if `key` was cached.
    fn remove(&mut self, key: &K) -> bool;

    fn contains(&self, key: &K) -> bool;

    fn clear(&mut self);

    /// Change the bound. Entries above it are evicted immediately.
    fn set_size(&mut self, size: usize) -> Vec<K>;

    fn size(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached keys, most recent first.
    fn get_cached(&self) -> Vec<K>;
}

// ============================================================================
// LRU
// ============================================================================

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: usize,
    next: usize,
}

/// Exact least-recently-used cache.
///
/// Entries form a doubly linked list stored in a slab, so `add` and
/// `remove` are O(1).
pub struct Cache<K> {
    size: usize,
    index: HashMap<K, usize>,
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Clone + Eq + Hash> Cache<K> {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            index: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn pop_back(&mut self) -> Option<K> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        self.free.push(slot);
        let key = self.nodes[slot].key.clone();
        self.index.remove(&key);
        Some(key)
    }

    fn evict_above(&mut self, size: usize) -> Vec<K> {
        let mut evicted = Vec::new();
        while self.index.len() > size {
            match self.pop_back() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }
}

impl<K: Clone + Eq + Hash + Send> ObjectCache<K> for Cache<K> {
    fn add(&mut self, key: K) -> Vec<K> {
        if self.size == 0 {
            return Vec::new();
        }
        if let Some(&slot) = self.index.get(&key) {
            self.unlink(slot);
            self.push_front(slot);
            return Vec::new();
        }
        let node = Node {
            key: key.clone(),
            prev: NIL,
            next: NIL,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        self.index.insert(key, slot);
        self.push_front(slot);
        self.evict_above(self.size)
    }

    fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.unlink(slot);
        self.free.push(slot);
        true
    }

    fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn set_size(&mut self, size: usize) -> Vec<K> {
        let evicted = if size == 0 {
            let all = self.get_cached();
            self.clear();
            all
        } else {
            self.evict_above(size)
        };
        self.size = size;
        evicted
    }

    fn size(&self) -> usize {
        self.size
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn get_cached(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut slot = self.head;
        while slot != NIL {
            keys.push(self.nodes[slot].key.clone());
            slot = self.nodes[slot].next;
        }
        keys
    }
}

impl<K> fmt::Debug for Cache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.size)
            .field("len", &self.index.len())
            .finish()
    }
}

// ============================================================================
// Generational
// ============================================================================

/// Approximate LRU with two generations.
///
/// New entries go into the current generation. Once it holds `size`
/// entries, the next add drops the previous generation entirely and
/// demotes the current one. The cache therefore holds between `size` and
/// `2 * size` entries.
pub struct GenerationalCache<K> {
    size: usize,
    stamp: u64,
    current: HashMap<K, u64>,
    previous: HashMap<K, u64>,
}

impl<K: Clone + Eq + Hash> GenerationalCache<K> {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            stamp: 0,
            current: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    fn bump_generation(&mut self) -> Vec<K> {
        let dropped = std::mem::replace(&mut self.previous, std::mem::take(&mut self.current));
        Self::ordered(&dropped)
            .into_iter()
            .filter(|key| !self.previous.contains_key(key))
            .collect()
    }

    fn ordered(generation: &HashMap<K, u64>) -> Vec<K> {
        let mut entries: Vec<(&K, u64)> = generation.iter().map(|(k, s)| (k, *s)).collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(k, _)| k.clone()).collect()
    }
}

impl<K: Clone + Eq + Hash + Send> ObjectCache<K> for GenerationalCache<K> {
    fn add(&mut self, key: K) -> Vec<K> {
        if self.size == 0 || self.current.contains_key(&key) {
            return Vec::new();
        }
        let evicted = if self.current.len() >= self.size {
            self.bump_generation()
        } else {
            Vec::new()
        };
        self.stamp += 1;
        self.current.insert(key.clone(), self.stamp);
        evicted.into_iter().filter(|k| *k != key).collect()
    }

    fn remove(&mut self, key: &K) -> bool {
        let in_current = self.current.remove(key).is_some();
        let in_previous = self.previous.remove(key).is_some();
        in_current || in_previous
    }

    fn contains(&self, key: &K) -> bool {
        self.current.contains_key(key) || self.previous.contains_key(key)
    }

    fn clear(&mut self) {
        self.current.clear();
        self.previous.clear();
    }

    fn set_size(&mut self, size: usize) -> Vec<K> {
        let cached = self.get_cached();
        self.size = size;
        self.clear();
        let split = size.min(cached.len());
        let (kept, evicted) = cached.split_at(split);
        // Restamp oldest first so the kept order survives.
        for key in kept.iter().rev() {
            self.stamp += 1;
            self.current.insert(key.clone(), self.stamp);
        }
        evicted.to_vec()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn len(&self) -> usize {
        self.current.len()
            + self
                .previous
                .keys()
                .filter(|key| !self.current.contains_key(key))
                .count()
    }

    fn get_cached(&self) -> Vec<K> {
        let mut keys = Self::ordered(&self.current);
        keys.extend(
            Self::ordered(&self.previous)
                .into_iter()
                .filter(|key| !self.current.contains_key(key)),
        );
        keys
    }
}

impl<K> fmt::Debug for GenerationalCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationalCache")
            .field("size", &self.size)
            .field("current", &self.current.len())
            .field("previous", &self.previous.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recent() {
        let mut cache = Cache::new(3);
        assert!(cache.add(1).is_empty());
        assert!(cache.add(2).is_empty());
        assert!(cache.add(3).is_empty());
        assert!(cache.add(1).is_empty());
        assert_eq!(cache.add(4), vec![2]);
        assert_eq!(cache.get_cached(), vec![4, 1, 3]);
        assert!(!cache.contains(&2));
    }

    #[test]
    fn lru_remove_and_reuse_slots() {
        let mut cache = Cache::new(2);
        cache.add("a");
        cache.add("b");
        assert!(cache.remove(&"a"));
        assert!(!cache.remove(&"a"));
        cache.add("c");
        assert_eq!(cache.get_cached(), vec!["c", "b"]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lru_zero_size_disables() {
        let mut cache = Cache::new(0);
        assert!(cache.add(1).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_set_size_trims_oldest() {
        let mut cache = Cache::new(5);
        for i in 0..5 {
            cache.add(i);
        }
        assert_eq!(cache.set_size(2), vec![0, 1, 2]);
        assert_eq!(cache.get_cached(), vec![4, 3]);
        assert_eq!(cache.set_size(0), vec![4, 3]);
        assert!(cache.is_empty());
        assert!(cache.add(9).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn generational_rotates_when_full() {
        let mut cache = GenerationalCache::new(2);
        cache.add(1);
        cache.add(2);
        assert!(cache.add(3).is_empty());
        assert_eq!(cache.get_cached(), vec![3, 2, 1]);
        cache.add(4);
        assert_eq!(cache.add(5), vec![2, 1]);
        assert_eq!(cache.get_cached(), vec![5, 4, 3]);
    }

    #[test]
    fn generational_remove_checks_both_generations() {
        let mut cache = GenerationalCache::new(1);
        cache.add("old");
        cache.add("new");
        assert!(cache.contains(&"old"));
        assert!(cache.remove(&"old"));
        assert!(cache.remove(&"new"));
        assert!(cache.is_empty());
    }

    #[test]
    fn generational_set_size_keeps_newest() {
        let mut cache = GenerationalCache::new(2);
        for i in 1..=4 {
            cache.add(i);
        }
        assert_eq!(cache.get_cached(), vec![4, 3, 2, 1]);
        assert_eq!(cache.set_size(3), vec![1]);
        assert_eq!(cache.get_cached(), vec![4, 3, 2]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn generational_readd_of_previous_entry_is_counted_once() {
        let mut cache = GenerationalCache::new(2);
        cache.add(1);
        cache.add(2);
        cache.add(3);
        cache.add(2);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_cached(), vec![2, 3, 1]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn lru_stays_bounded(size in 0usize..6, keys in prop::collection::vec(0u8..12, 0..40)) {
                let mut cache = Cache::new(size);
                for key in keys {
                    let evicted = cache.add(key);
                    prop_assert!(cache.len() <= size);
                    prop_assert!(evicted.iter().all(|k| !cache.contains(k)));
                    prop_assert_eq!(cache.contains(&key), size > 0);
                }
            }

            #[test]
            fn generational_holds_at_most_two_generations(
                size in 1usize..6,
                keys in prop::collection::vec(0u8..12, 0..40),
            ) {
                let mut cache = GenerationalCache::new(size);
                for key in keys {
                    let evicted = cache.add(key);
                    prop_assert!(cache.len() <= 2 * size);
                    prop_assert!(cache.contains(&key));
                    prop_assert!(!evicted.contains(&key));
                }
            }
        }
    }
}
