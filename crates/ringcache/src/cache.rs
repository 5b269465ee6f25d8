//! EvictionCache: thread-safe handle over the LRU core

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::lru::LruCache;
use crate::stats::CacheStats;

/// Fixed-capacity LRU cache shared between threads.
///
/// Every operation runs under one exclusive lock. Operations are O(1), so the
/// critical sections are short and never block on I/O. Values are cloned out
/// of the lock; wrap large values in `Arc`.
pub struct EvictionCache<K, V> {
    /// LRU core, serialized by the mutex
    inner: Mutex<LruCache<K, V>>,

    /// Cache statistics
    stats: CacheStats,
}

impl<K, V> EvictionCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new cache holding at most `capacity` entries
    ///
    /// # Errors
    /// * `Error::InvalidConfiguration` if `capacity` is 0
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)?),
            stats: CacheStats::new(),
        })
    }

    /// Create a cache that reports capacity-driven evictions to `hook`.
    ///
    /// The hook runs while the cache lock is held and must not call back into
    /// this cache.
    pub fn with_eviction_hook<F>(capacity: usize, hook: F) -> Result<Self>
    where
        F: FnMut(&K, &V) + Send + 'static,
    {
        let mut lru = LruCache::new(capacity)?;
        lru.set_eviction_hook(Box::new(hook));
        Ok(Self {
            inner: Mutex::new(lru),
            stats: CacheStats::new(),
        })
    }

    /// Get a value and mark it most recently used
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let found = self.inner.lock().get(key).cloned();
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        found
    }

    /// Get a value without changing recency or statistics
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().peek(key).cloned()
    }

    /// Whether `key` is cached
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().contains(key)
    }

    /// Insert or replace a value, returning the entry evicted to make room
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        let evicted = self.inner.lock().put(key, value);
        self.stats.record_insert();
        if evicted.is_some() {
            self.stats.record_eviction();
            trace!("evicted least recently used entry");
        }
        evicted
    }

    /// Remove a key. Does not fire the eviction hook.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.inner.lock().remove(key);
        if removed.is_some() {
            self.stats.record_removal();
        }
        removed
    }

    /// Keep only entries for which `keep` returns true.
    ///
    /// Returns the number of entries dropped. Dropped entries count as
    /// removals, not evictions.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<K> = inner
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
            self.stats.record_removal();
        }
        doomed.len()
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Get current number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Get cache capacity
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Clear the cache and its statistics
    pub fn clear(&self) {
        self.inner.lock().clear();
        self.stats.reset();
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl<K, V> fmt::Debug for EvictionCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionCache")
            .field("inner", &*self.inner.lock())
            .field("stats", &self.stats)
            .finish()
    }
}
