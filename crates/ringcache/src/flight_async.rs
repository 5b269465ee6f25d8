//! Single-flight loading for tokio tasks
//!
//! The winning caller spawns the load onto the runtime and then waits on it
//! like everyone else. Dropping any caller's future, including the one that
//! started the load, only detaches that caller.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::EvictionCache;
use crate::error::FlightError;
use crate::stats::FlightStats;

enum FlightState<V, E> {
    Loading,
    Done(Result<V, Arc<E>>),
    Abandoned,
}

/// Registry entry for one in-flight load
struct Flight<V, E> {
    id: u64,
    rx: watch::Receiver<FlightState<V, E>>,
}

type FlightMap<K, V, E> = Arc<Mutex<HashMap<K, Flight<V, E>, RandomState>>>;

enum Role<V, E> {
    Hit(V),
    Leader(u64, watch::Sender<FlightState<V, E>>, watch::Receiver<FlightState<V, E>>),
    Waiter(watch::Receiver<FlightState<V, E>>),
}

/// Owned by the spawned load task; publishes `Abandoned` if the task dies
struct FlightGuard<K, V, E>
where
    K: Hash + Eq,
{
    pending: FlightMap<K, V, E>,
    key: K,
    id: u64,
    tx: watch::Sender<FlightState<V, E>>,
    finished: bool,
}

impl<K, V, E> FlightGuard<K, V, E>
where
    K: Hash + Eq,
{
    fn finish(mut self, outcome: FlightState<V, E>) {
        self.tx.send_replace(outcome);
        self.release();
        self.finished = true;
    }

    fn release(&self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.key).is_some_and(|f| f.id == self.id) {
            pending.remove(&self.key);
        }
    }
}

impl<K, V, E> Drop for FlightGuard<K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.tx.send_replace(FlightState::Abandoned);
        self.release();
    }
}

/// Async counterpart of [`SingleFlightLoader`](crate::SingleFlightLoader).
///
/// Must be used from inside a tokio runtime.
pub struct AsyncSingleFlightLoader<K, V, E> {
    /// Cache populated by successful loads
    cache: Arc<EvictionCache<K, V>>,

    /// Loads currently in flight
    pending: FlightMap<K, V, E>,

    /// Identifies registry entries across reuse of the same key
    next_id: AtomicU64,

    /// Default bound on how long a caller waits
    wait_timeout: Option<Duration>,

    /// Loader statistics
    stats: Arc<FlightStats>,
}

impl<K, V, E> AsyncSingleFlightLoader<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a loader in front of `cache`
    pub fn new(cache: Arc<EvictionCache<K, V>>) -> Self {
        Self {
            cache,
            pending: Arc::new(Mutex::new(HashMap::default())),
            next_id: AtomicU64::new(0),
            wait_timeout: None,
            stats: Arc::new(FlightStats::new()),
        }
    }

    /// Bound how long [`get`](Self::get) waits for a result
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Get `key`, loading it with `loader` on a miss.
    ///
    /// # Errors
    /// Same outcomes as the blocking loader. A timeout detaches this caller;
    /// the load still completes and fills the cache.
    pub async fn get<F, Fut>(&self, key: K, loader: F) -> Result<V, FlightError<E>>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.load(key, loader, self.wait_timeout).await
    }

    /// Like [`get`](Self::get) with an explicit timeout
    pub async fn get_timeout<F, Fut>(
        &self,
        key: K,
        loader: F,
        timeout: Duration,
    ) -> Result<V, FlightError<E>>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.load(key, loader, Some(timeout)).await
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

    async fn load<F, Fut>(
        &self,
        key: K,
        loader: F,
        timeout: Option<Duration>,
    ) -> Result<V, FlightError<E>>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.cache.get(&key) {
            return Ok(value);
        }

        let rx = match self.claim(&key) {
            Role::Hit(value) => return Ok(value),
            Role::Waiter(rx) => {
                self.stats.record_collapsed();
                debug!("joined in-flight load");
                rx
            }
            Role::Leader(id, tx, rx) => {
                self.spawn_load(key, id, tx, loader);
                rx
            }
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, Self::wait(rx))
                .await
                .unwrap_or(Err(FlightError::Timeout(limit))),
            None => Self::wait(rx).await,
        };
        if let Err(FlightError::Timeout(waited)) = &outcome {
            self.stats.record_timeout();
            warn!(?waited, "stopped waiting for in-flight load");
        }
        outcome
    }

    fn claim(&self, key: &K) -> Role<V, E> {
        let mut pending = self.pending.lock();
        if let Some(flight) = pending.get(key) {
            return Role::Waiter(flight.rx.clone());
        }
        if let Some(value) = self.cache.peek(key) {
            return Role::Hit(value);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(FlightState::Loading);
        pending.insert(
            key.clone(),
            Flight {
                id,
                rx: rx.clone(),
            },
        );
        Role::Leader(id, tx, rx)
    }

    fn spawn_load<F, Fut>(&self, key: K, id: u64, tx: watch::Sender<FlightState<V, E>>, loader: F)
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.stats.record_load();
        debug!(id, "spawning load");

        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let guard = FlightGuard {
            pending: Arc::clone(&self.pending),
            key: key.clone(),
            id,
            tx,
            finished: false,
        };

        tokio::spawn(async move {
            match loader(key.clone()).await {
                Ok(value) => {
                    cache.put(key, value.clone());
                    guard.finish(FlightState::Done(Ok(value)));
                }
                Err(err) => {
                    stats.record_failure();
                    warn!(id, "load failed, releasing waiters with the error");
                    guard.finish(FlightState::Done(Err(Arc::new(err))));
                }
            }
        });
    }

    async fn wait(mut rx: watch::Receiver<FlightState<V, E>>) -> Result<V, FlightError<E>> {
        let state = rx
            .wait_for(|state| !matches!(state, FlightState::Loading))
            .await;
        match state {
            Ok(state) => match &*state {
                FlightState::Done(Ok(value)) => Ok(value.clone()),
                FlightState::Done(Err(err)) => Err(FlightError::Load(Arc::clone(err))),
                FlightState::Loading | FlightState::Abandoned => Err(FlightError::LeaderAbandoned),
            },
            // Sender dropped without publishing
            Err(_) => Err(FlightError::LeaderAbandoned),
        }
    }
}

impl<K, V, E> fmt::Debug for AsyncSingleFlightLoader<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSingleFlightLoader")
            .field("cache", &self.cache)
            .field("in_flight", &self.pending.lock().len())
            .field("wait_timeout", &self.wait_timeout)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Instant};

    type Loader = AsyncSingleFlightLoader<String, String, String>;

    fn loader_with_capacity(capacity: usize) -> Arc<Loader> {
        let cache = Arc::new(EvictionCache::new(capacity).unwrap());
        Arc::new(AsyncSingleFlightLoader::new(cache))
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition never held");
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_collapse() {
        let loader = loader_with_capacity(16);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let loader = Arc::clone(&loader);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    loader
                        .get("hot".to_string(), move |k| async move {
                            sleep(Duration::from_millis(100)).await;
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(format!("value-for-{k}"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "value-for-hot");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.stats().loads(), 1);
        // Deregistration follows delivery on the load task
        wait_until(|| loader.in_flight() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelling_first_caller_keeps_load_running() {
        let loader = loader_with_capacity(4);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let loader = Arc::clone(&loader);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                loader
                    .get("k".to_string(), move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(100)).await;
                        Ok("loaded".to_string())
                    })
                    .await
            })
        };

        wait_until(|| loader.in_flight() == 1).await;
        first.abort();

        let second = loader
            .get("k".to_string(), |_| async { Ok("second".to_string()) })
            .await;

        assert_eq!(second.unwrap(), "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.cache().peek("k").as_deref(), Some("loaded"));
    }

    #[tokio::test]
    async fn test_failure_shared_then_retried() {
        let loader = loader_with_capacity(4);

        let first = {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loader
                    .get("k".to_string(), |_| async {
                        sleep(Duration::from_millis(50)).await;
                        Err("origin down".to_string())
                    })
                    .await
            })
        };

        wait_until(|| loader.in_flight() == 1).await;
        let second = loader
            .get("k".to_string(), |_| async { Ok("never".to_string()) })
            .await;
        let first = first.await.unwrap();

        let (Err(FlightError::Load(a)), Err(FlightError::Load(b))) = (&first, &second) else {
            panic!("both callers should see the failure: {first:?} {second:?}");
        };
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(loader.in_flight(), 0);

        let retried = loader
            .get("k".to_string(), |_| async { Ok("recovered".to_string()) })
            .await;
        assert_eq!(retried.unwrap(), "recovered");
        assert_eq!(loader.stats().loads(), 2);
        assert_eq!(loader.stats().failures(), 1);
    }

    #[tokio::test]
    async fn test_timeout_detaches_caller_only() {
        let loader = loader_with_capacity(4);

        let waited = loader
            .get_timeout(
                "slow".to_string(),
                |_| async {
                    sleep(Duration::from_millis(100)).await;
                    Ok("done".to_string())
                },
                Duration::from_millis(10),
            )
            .await;
        assert!(waited.unwrap_err().is_timeout());

        // The spawned load still finishes and fills the cache
        wait_until(|| loader.in_flight() == 0).await;
        assert_eq!(loader.cache().peek("slow").as_deref(), Some("done"));
        assert_eq!(loader.stats().timeouts(), 1);
    }

    #[tokio::test]
    async fn test_panicking_load_releases_waiters() {
        let loader = loader_with_capacity(4);

        let outcome = loader
            .get("k".to_string(), |_| async {
                sleep(Duration::from_millis(10)).await;
                if true {
                    panic!("origin client crashed");
                }
                Ok("unreachable".to_string())
            })
            .await;

        assert!(matches!(outcome, Err(FlightError::LeaderAbandoned)));
        assert_eq!(loader.in_flight(), 0);

        let retried = loader
            .get("k".to_string(), |_| async { Ok("fresh".to_string()) })
            .await;
        assert_eq!(retried.unwrap(), "fresh");
    }
}
