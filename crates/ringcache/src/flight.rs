//! Single-flight loading for blocking callers
//!
//! Concurrent misses for the same key collapse into one loader call. The first
//! caller to register a pending load becomes the leader and runs the loader on
//! its own thread; later callers block on the pending load's condition
//! variable and receive the leader's outcome.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::cache::EvictionCache;
use crate::error::FlightError;
use crate::stats::FlightStats;

enum LoadState<V, E> {
    Loading,
    Done(Result<V, Arc<E>>),
    Abandoned,
}

/// Result holder shared by the leader and every waiter of one load
struct PendingLoad<V, E> {
    state: Mutex<LoadState<V, E>>,
    done: Condvar,
}

impl<V, E> PendingLoad<V, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(LoadState::Loading),
            done: Condvar::new(),
        }
    }

    /// Store the outcome and wake every waiter
    fn publish(&self, outcome: LoadState<V, E>) {
        *self.state.lock() = outcome;
        self.done.notify_all();
    }
}

impl<V: Clone, E> PendingLoad<V, E> {
    fn wait(&self, timeout: Option<Duration>) -> Result<V, FlightError<E>> {
        let deadline = timeout.map(|t| (t, Instant::now() + t));
        let mut state = self.state.lock();
        loop {
            match &*state {
                LoadState::Done(Ok(value)) => return Ok(value.clone()),
                LoadState::Done(Err(err)) => return Err(FlightError::Load(Arc::clone(err))),
                LoadState::Abandoned => return Err(FlightError::LeaderAbandoned),
                LoadState::Loading => {}
            }

            match deadline {
                Some((timeout, deadline)) => {
                    let waited = self.done.wait_until(&mut state, deadline);
                    if waited.timed_out() && matches!(*state, LoadState::Loading) {
                        return Err(FlightError::Timeout(timeout));
                    }
                }
                None => self.done.wait(&mut state),
            }
        }
    }
}

type PendingMap<K, V, E> = Mutex<HashMap<K, Arc<PendingLoad<V, E>>, RandomState>>;

enum Role<V, E> {
    Hit(V),
    Leader(Arc<PendingLoad<V, E>>),
    Waiter(Arc<PendingLoad<V, E>>),
}

/// Releases the pending entry when the leader finishes or unwinds
struct LeaderGuard<'a, K, V, E>
where
    K: Hash + Eq,
{
    pending: &'a PendingMap<K, V, E>,
    key: &'a K,
    slot: &'a Arc<PendingLoad<V, E>>,
    finished: bool,
}

impl<K, V, E> LeaderGuard<'_, K, V, E>
where
    K: Hash + Eq,
{
    /// Publish, then deregister. Callers arriving after this see the cache.
    fn finish(mut self, outcome: LoadState<V, E>) {
        self.slot.publish(outcome);
        self.release();
        self.finished = true;
    }

    fn release(&self) {
        let mut pending = self.pending.lock();
        if pending
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, self.slot))
        {
            pending.remove(self.key);
        }
    }
}

impl<K, V, E> Drop for LeaderGuard<'_, K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Leader unwound before publishing: wake waiters so they can retry
        self.slot.publish(LoadState::Abandoned);
        self.release();
    }
}

/// Cache front end that runs at most one loader call per key at a time.
///
/// Lock order is pending registry, then cache. The loader itself runs with no
/// lock held.
pub struct SingleFlightLoader<K, V, E> {
    /// Cache populated by successful loads
    cache: Arc<EvictionCache<K, V>>,

    /// Loads currently in flight, keyed by cache key
    pending: PendingMap<K, V, E>,

    /// Default bound on how long a waiter blocks
    wait_timeout: Option<Duration>,

    /// Loader statistics
    stats: FlightStats,
}

impl<K, V, E> SingleFlightLoader<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a loader in front of `cache`
    pub fn new(cache: Arc<EvictionCache<K, V>>) -> Self {
        Self {
            cache,
            pending: Mutex::new(HashMap::default()),
            wait_timeout: None,
            stats: FlightStats::new(),
        }
    }

    /// Bound how long [`get`](Self::get) waits on another caller's load
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Get `key`, loading it with `loader` on a miss.
    ///
    /// If a load for `key` is already in flight the caller waits for it
    /// instead, up to the configured wait timeout, and `loader` is dropped
    /// uncalled.
    ///
    /// # Errors
    /// * `FlightError::Load` with the loader's error, shared with all waiters
    /// * `FlightError::Timeout` if this caller stopped waiting
    /// * `FlightError::LeaderAbandoned` if the leading caller panicked
    pub fn get<F>(&self, key: K, loader: F) -> Result<V, FlightError<E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        self.load(key, loader, self.wait_timeout)
    }

    /// Like [`get`](Self::get) with an explicit wait timeout.
    ///
    /// The timeout only applies while waiting on another caller's load. A
    /// caller that leads the load runs `loader` to completion.
    pub fn get_timeout<F>(&self, key: K, loader: F, timeout: Duration) -> Result<V, FlightError<E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        self.load(key, loader, Some(timeout))
    }

    /// Write a value straight into the cache
    pub fn put(&self, key: K, value: V) {
        self.cache.put(key, value);
    }

    /// Drop a cached value so the next `get` reloads it
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.cache.remove(key)
    }

    /// Number of loads currently in flight
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Cache this loader populates
    pub fn cache(&self) -> &Arc<EvictionCache<K, V>> {
        &self.cache
    }

    /// Get loader statistics
    pub fn stats(&self) -> &FlightStats {
        &self.stats
    }

    fn load<F>(&self, key: K, loader: F, timeout: Option<Duration>) -> Result<V, FlightError<E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        if let Some(value) = self.cache.get(&key) {
            return Ok(value);
        }
        self.load_missed(key, loader, timeout)
    }

    /// Claim-or-join path for a key the cache just missed
    fn load_missed<F>(&self, key: K, loader: F, timeout: Option<Duration>) -> Result<V, FlightError<E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        match self.claim(&key) {
            Role::Hit(value) => Ok(value),
            Role::Waiter(slot) => {
                self.stats.record_collapsed();
                debug!("joined in-flight load");
                let outcome = slot.wait(timeout);
                if let Err(FlightError::Timeout(waited)) = &outcome {
                    self.stats.record_timeout();
                    warn!(?waited, "stopped waiting for in-flight load");
                }
                outcome
            }
            Role::Leader(slot) => self.lead(key, &slot, loader),
        }
    }

    /// Load `key` only if nobody has it cached or in flight
    fn load_if_idle<F>(&self, key: K, loader: F) -> Option<Result<V, FlightError<E>>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        if self.cache.contains(&key) {
            return None;
        }
        match self.claim(&key) {
            Role::Leader(slot) => Some(self.lead(key, &slot, loader)),
            Role::Hit(_) | Role::Waiter(_) => None,
        }
    }

    /// Register a pending load for `key`, or find the one already running
    fn claim(&self, key: &K) -> Role<V, E> {
        let mut pending = self.pending.lock();
        if let Some(slot) = pending.get(key) {
            return Role::Waiter(Arc::clone(slot));
        }

        // A load that completed after our cache miss has already filled the
        // cache, since leaders publish before deregistering.
        if let Some(value) = self.cache.peek(key) {
            return Role::Hit(value);
        }

        let slot = Arc::new(PendingLoad::new());
        pending.insert(key.clone(), Arc::clone(&slot));
        Role::Leader(slot)
    }

    fn lead<F>(&self, key: K, slot: &Arc<PendingLoad<V, E>>, loader: F) -> Result<V, FlightError<E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        self.stats.record_load();
        debug!("leading load");

        let guard = LeaderGuard {
            pending: &self.pending,
            key: &key,
            slot,
            finished: false,
        };

        match loader(&key) {
            Ok(value) => {
                self.cache.put(key.clone(), value.clone());
                guard.finish(LoadState::Done(Ok(value.clone())));
                Ok(value)
            }
            Err(err) => {
                self.stats.record_failure();
                warn!("load failed, releasing waiters with the error");
                let err = Arc::new(err);
                guard.finish(LoadState::Done(Err(Arc::clone(&err))));
                Err(FlightError::Load(err))
            }
        }
    }
}

impl<K, V, E> SingleFlightLoader<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: fmt::Display,
{
    /// Warm the cache with `keys`, skipping ones already cached.
    ///
    /// Each missing key goes through the single-flight path. Failures are
    /// logged and skipped. Returns how many keys were loaded.
    pub fn prefetch<I, F>(&self, keys: I, mut loader: F) -> usize
    where
        I: IntoIterator<Item = K>,
        F: FnMut(&K) -> Result<V, E>,
    {
        let mut loaded = 0;
        for key in keys {
            if self.cache.contains(&key) {
                continue;
            }
            match self.get(key, &mut loader) {
                Ok(_) => loaded += 1,
                Err(err) => warn!(%err, "prefetch skipped a key"),
            }
        }
        loaded
    }

    /// Get `key` and, when it missed, warm the keys `neighbours` derives
    /// from it.
    ///
    /// Spatial locality prefetch: a miss on `key5` can pull in `key4` and
    /// `key6`. A hit runs neither `neighbours` nor any extra load. Neighbours
    /// that are cached or being loaded by another caller are skipped rather
    /// than waited on. Neighbour failures are logged and do not affect the
    /// result for `key`.
    pub fn get_with_prefetch<F, N>(
        &self,
        key: K,
        mut loader: F,
        neighbours: N,
    ) -> Result<V, FlightError<E>>
    where
        F: FnMut(&K) -> Result<V, E>,
        N: FnOnce(&K) -> Vec<K>,
    {
        if let Some(value) = self.cache.get(&key) {
            return Ok(value);
        }
        let value = self.load_missed(key.clone(), &mut loader, self.wait_timeout)?;

        let mut warmed = 0;
        for neighbour in neighbours(&key) {
            match self.load_if_idle(neighbour, &mut loader) {
                Some(Ok(_)) => warmed += 1,
                Some(Err(err)) => warn!(%err, "prefetch skipped a neighbour"),
                None => {}
            }
        }
        debug!(warmed, "prefetched neighbours");

        Ok(value)
    }
}

impl<K, V, E> fmt::Debug for SingleFlightLoader<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightLoader")
            .field("cache", &self.cache)
            .field("in_flight", &self.pending.lock().len())
            .field("wait_timeout", &self.wait_timeout)
            .field("stats", &self.stats)
            .finish()
    }
}
