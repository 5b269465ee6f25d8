//! LRU (Least Recently Used) cache implementation
//!
//! Entries live in a slot arena. The recency list is threaded through the
//! slots as integer `prev`/`next` indices between two sentinel slots, so
//! reordering and eviction never traverse the list.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use ahash::RandomState;

use crate::error::{Error, Result};

/// Sentinel slot before the most recently used entry
const HEAD: usize = 0;
/// Sentinel slot after the least recently used entry
const TAIL: usize = 1;

/// Upper bound on slots reserved up front; the arena grows past it on demand
const MAX_PREALLOC: usize = 4096;

/// Callback fired when an entry is pushed out by capacity pressure
pub type EvictionHook<K, V> = Box<dyn FnMut(&K, &V) + Send>;

/// Arena slot: a cache entry plus its recency links
struct Slot<K, V> {
    entry: Option<(K, V)>,
    prev: usize,
    next: usize,
}

impl<K, V> Slot<K, V> {
    fn vacant() -> Self {
        Self {
            entry: None,
            prev: HEAD,
            next: TAIL,
        }
    }
}

/// LRU cache with fixed capacity
pub struct LruCache<K, V> {
    map: HashMap<K, usize, RandomState>,
    slots: Vec<Slot<K, V>>,
    free_list: Vec<usize>,
    capacity: usize,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new LRU cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "cache capacity must be greater than 0".to_string(),
            ));
        }

        // Sentinels: HEAD.next and TAIL.prev point at each other while empty
        let reserve = capacity.min(MAX_PREALLOC);
        let mut slots = Vec::with_capacity(reserve + 2);
        slots.push(Slot::vacant());
        slots.push(Slot::vacant());

        Ok(Self {
            map: HashMap::with_capacity_and_hasher(reserve, RandomState::new()),
            slots,
            free_list: Vec::new(),
            capacity,
            on_evict: None,
        })
    }

    /// Install a hook observing capacity-driven evictions.
    ///
    /// Explicit [`remove`](Self::remove) and [`clear`](Self::clear) do not
    /// fire it.
    pub fn set_eviction_hook(&mut self, hook: EvictionHook<K, V>) {
        self.on_evict = Some(hook);
    }

    /// Get a value and mark it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        self.slots[idx].entry.as_ref().map(|(_, v)| v)
    }

    /// Get a value without touching recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.map.get(key)?;
        self.slots[idx].entry.as_ref().map(|(_, v)| v)
    }

    /// Whether `key` is cached. Does not touch recency.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Insert a key-value pair, making it most recently used.
    ///
    /// Returns the least recently used entry if it had to be evicted to make
    /// room. Replacing the value of a cached key never evicts.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some((_, v)) = self.slots[idx].entry.as_mut() {
                *v = value;
            }
            self.move_to_front(idx);
            return None;
        }

        let evicted = if self.map.len() >= self.capacity {
            self.evict()
        } else {
            None
        };

        let idx = self.alloc_slot();
        self.slots[idx].entry = Some((key.clone(), value));
        self.link_front(idx);
        self.map.insert(key, idx);

        evicted
    }

    /// Remove a key from the cache
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let entry = self.slots[idx].entry.take();
        self.free_list.push(idx);
        entry.map(|(_, v)| v)
    }

    /// Get the current size of the cache
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.truncate(2);
        self.slots[HEAD].next = TAIL;
        self.slots[TAIL].prev = HEAD;
        self.free_list.clear();
    }

    /// Iterate entries from most to least recently used
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: &self.slots,
            cursor: self.slots[HEAD].next,
            remaining: self.map.len(),
        }
    }

    /// Iterate keys from most to least recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Least recently used entry, the next eviction victim
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        let idx = self.slots[TAIL].prev;
        self.slots[idx].entry.as_ref().map(|(k, v)| (k, v))
    }

    fn evict(&mut self) -> Option<(K, V)> {
        let idx = self.slots[TAIL].prev;
        if idx == HEAD {
            return None;
        }

        self.unlink(idx);
        let (key, value) = self.slots[idx].entry.take()?;
        self.map.remove(&key);
        self.free_list.push(idx);

        if let Some(hook) = self.on_evict.as_mut() {
            hook(&key, &value);
        }
        Some((key, value))
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.slots[HEAD].next == idx {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    fn link_front(&mut self, idx: usize) {
        let first = self.slots[HEAD].next;
        self.slots[idx].prev = HEAD;
        self.slots[idx].next = first;
        self.slots[first].prev = idx;
        self.slots[HEAD].next = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            self.slots.push(Slot::vacant());
            self.slots.len() - 1
        }
    }

    /// Walk the list both ways and compare it against the key index
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert!(self.map.len() <= self.capacity);

        let mut forward = 0;
        let mut idx = self.slots[HEAD].next;
        let mut prev = HEAD;
        while idx != TAIL {
            assert_eq!(self.slots[idx].prev, prev, "broken back-link at {idx}");
            let (key, _) = self.slots[idx].entry.as_ref().expect("linked slot is vacant");
            assert_eq!(self.map.get(key), Some(&idx));
            forward += 1;
            prev = idx;
            idx = self.slots[idx].next;
        }
        assert_eq!(self.slots[TAIL].prev, prev);
        assert_eq!(forward, self.map.len());
        assert!(self.slots.len() <= self.capacity.saturating_add(2));
    }
}

impl<K, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.map.len())
            .field("capacity", &self.capacity)
            .field("has_eviction_hook", &self.on_evict.is_some())
            .finish()
    }
}

/// Iterator over cache entries in recency order
pub struct Iter<'a, K, V> {
    slots: &'a [Slot<K, V>],
    cursor: usize,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == TAIL {
            return None;
        }
        let slot = &self.slots[self.cursor];
        self.cursor = slot.next;
        self.remaining = self.remaining.saturating_sub(1);
        slot.entry.as_ref().map(|(k, v)| (k, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn order<K: Hash + Eq + Clone, V>(cache: &LruCache<K, V>) -> Vec<K> {
        cache.keys().cloned().collect()
    }

    #[test]
    fn test_lru_zero_capacity_rejected() {
        let err = LruCache::<u32, u32>::new(0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_lru_huge_capacity_allocates_lazily() {
        let mut cache = LruCache::<u8, u8>::new(usize::MAX).unwrap();
        assert_eq!(cache.capacity(), usize::MAX);

        for i in 0..=u8::MAX {
            assert_eq!(cache.put(i, i), None);
        }
        assert_eq!(cache.len(), 256);
        cache.check_invariants();

        let large = LruCache::<u64, u64>::new(1 << 40).unwrap();
        assert!(large.is_empty());
    }

    #[test]
    fn test_lru_basic() {
        let mut cache = LruCache::new(2).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.len(), 2);
        cache.check_invariants();
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = LruCache::new(2).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");
        assert_eq!(cache.put(3, "c"), Some((1, "a")));

        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.get(&3), Some(&"c"));
        cache.check_invariants();
    }

    #[test]
    fn test_lru_update() {
        let mut cache = LruCache::new(2).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");
        cache.get(&1); // Move 1 to front
        cache.put(3, "c"); // Should evict 2

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn test_lru_recency_scenario() {
        let mut cache = LruCache::new(3).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c");
        assert_eq!(order(&cache), vec![3, 2, 1]);

        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(order(&cache), vec![2, 3, 1]);

        assert_eq!(cache.put(4, "d"), Some((1, "a")));
        assert_eq!(order(&cache), vec![4, 2, 3]);
        cache.check_invariants();
    }

    #[test]
    fn test_lru_miss_has_no_side_effects() {
        let mut cache = LruCache::new(3).unwrap();
        cache.put(1, 10);
        cache.put(2, 20);

        assert_eq!(cache.get(&9), None);
        assert_eq!(order(&cache), vec![2, 1]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_peek_keeps_order() {
        let mut cache = LruCache::new(3).unwrap();
        cache.put(1, 10);
        cache.put(2, 20);

        assert_eq!(cache.peek(&1), Some(&10));
        assert!(cache.contains(&1));
        assert_eq!(order(&cache), vec![2, 1]);
        assert_eq!(cache.peek_lru(), Some((&1, &10)));
    }

    #[test]
    fn test_lru_remove() {
        let mut cache = LruCache::new(3).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c");

        assert_eq!(cache.remove(&2), Some("b"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), None);
        assert_eq!(order(&cache), vec![3, 1]);

        // Freed slot is reused without growing the arena
        cache.put(4, "d");
        cache.put(5, "e");
        assert_eq!(order(&cache), vec![5, 4, 3]);
        cache.check_invariants();
    }

    #[test]
    fn test_lru_clear() {
        let mut cache = LruCache::new(3).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");
        cache.clear();

        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.iter().count(), 0);

        cache.put(3, "c");
        assert_eq!(order(&cache), vec![3]);
        cache.check_invariants();
    }

    #[test]
    fn test_lru_overwrite() {
        let mut cache = LruCache::new(2).unwrap();

        cache.put(1, "a");
        cache.put(2, "b");
        assert_eq!(cache.put(1, "z"), None); // Overwrite moves 1 to head

        assert_eq!(order(&cache), vec![1, 2]);
        assert_eq!(cache.get(&1), Some(&"z"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_borrowed_lookup() {
        let mut cache: LruCache<String, u32> = LruCache::new(2).unwrap();
        cache.put("alpha".to_string(), 1);

        assert_eq!(cache.get("alpha"), Some(&1));
        assert_eq!(cache.remove("alpha"), Some(1));
    }

    #[test]
    fn test_lru_eviction_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut cache = LruCache::new(2).unwrap();
        cache.set_eviction_hook(Box::new(move |k: &u32, v: &&str| {
            sink.lock().unwrap().push((*k, *v));
        }));

        cache.put(1, "a");
        cache.put(2, "b");
        cache.remove(&2); // explicit removal: no hook
        cache.put(3, "c");
        cache.put(4, "d"); // evicts 1
        cache.clear(); // no hook

        assert_eq!(*seen.lock().unwrap(), vec![(1, "a")]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get(u8),
        Put(u8, u32),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Get),
            (0u8..16, any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Compare against a Vec kept in recency order, head first
        #[test]
        fn prop_matches_recency_model(
            capacity in 1usize..8,
            ops in prop::collection::vec(op_strategy(), 0..200),
        ) {
            let mut cache = LruCache::new(capacity).unwrap();
            let mut model: Vec<(u8, u32)> = Vec::new();

            for op in ops {
                match op {
                    Op::Get(k) => {
                        let expected = model.iter().position(|(mk, _)| *mk == k).map(|pos| {
                            let entry = model.remove(pos);
                            model.insert(0, entry);
                            entry.1
                        });
                        prop_assert_eq!(cache.get(&k).copied(), expected);
                    }
                    Op::Put(k, v) => {
                        let mut expected_evicted = None;
                        if let Some(pos) = model.iter().position(|(mk, _)| *mk == k) {
                            model.remove(pos);
                        } else if model.len() == capacity {
                            expected_evicted = model.pop();
                        }
                        model.insert(0, (k, v));
                        prop_assert_eq!(cache.put(k, v), expected_evicted);
                    }
                    Op::Remove(k) => {
                        let expected = model
                            .iter()
                            .position(|(mk, _)| *mk == k)
                            .map(|pos| model.remove(pos).1);
                        prop_assert_eq!(cache.remove(&k), expected);
                    }
                }

                prop_assert!(cache.len() <= capacity);
                let actual: Vec<(u8, u32)> = cache.iter().map(|(k, v)| (*k, *v)).collect();
                prop_assert_eq!(&actual, &model);
            }
            cache.check_invariants();
        }
    }
}
