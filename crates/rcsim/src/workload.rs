//! Simulated workloads and their reports

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringcache::{
    AsyncSingleFlightLoader, CacheConfig, CacheStatsSnapshot, EvictionCache, FlightStatsSnapshot,
    HashRing, SingleFlightLoader,
};
use serde::Serialize;
use tracing::{debug, info};

const HOT_KEY: &str = "hot";

#[derive(Debug, Serialize)]
pub struct LruReport {
    pub capacity: usize,
    pub requests: usize,
    pub key_space: u64,
    pub stats: CacheStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct RingReport {
    pub replicas: u32,
    pub keys: usize,
    pub distribution: BTreeMap<String, usize>,
    pub removed: Option<String>,
    pub moved: usize,
    /// Every moved key was owned by the removed node
    pub minimal: bool,
}

#[derive(Debug, Serialize)]
pub struct CollapseReport {
    pub mode: &'static str,
    pub callers: usize,
    pub delay_ms: u128,
    pub origin_calls: usize,
    pub distinct_values: usize,
    pub elapsed_ms: u128,
    pub flight: FlightStatsSnapshot,
}

/// Read-through workload skewed towards low key numbers
pub fn run_lru(
    config: &CacheConfig,
    requests: usize,
    key_space: u64,
    seed: u64,
) -> Result<LruReport> {
    let cache = EvictionCache::new(config.capacity)?;
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..requests {
        // Squaring a uniform sample favours small keys
        let x: f64 = rng.gen();
        let key = (x * x * key_space as f64) as u64;
        if cache.get(&key).is_none() {
            cache.put(key, key);
        }
    }

    let stats = cache.stats().snapshot();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        evictions = stats.evictions,
        "lru workload finished, hit ratio {:.2}%",
        stats.hit_ratio * 100.0
    );

    Ok(LruReport {
        capacity: config.capacity,
        requests,
        key_space,
        stats,
    })
}

/// Place keys on a ring, optionally remove a node, and count remapped keys
pub fn run_ring(
    config: &CacheConfig,
    nodes: &[String],
    keys: usize,
    remove: Option<&str>,
) -> Result<RingReport> {
    let ring = HashRing::new(config.replicas)?;
    for node in nodes {
        ring.add_node(node)
            .with_context(|| format!("failed to add node {node}"))?;
    }
    info!(
        nodes = ring.node_count(),
        vnodes = ring.vnode_count(),
        "ring built"
    );

    let keys: Vec<String> = (0..keys).map(|i| format!("key{i}")).collect();
    let distribution = ring
        .distribution(&keys)
        .into_iter()
        .map(|(node, count)| (node.to_string(), count))
        .collect();

    let mut moved = 0;
    let mut minimal = true;
    if let Some(node) = remove {
        let before: Vec<_> = keys.iter().map(|k| ring.lookup_owner(k)).collect();
        if !ring.remove_node(node) {
            return Err(anyhow!("node {node} is not on the ring"));
        }
        for (key, old) in keys.iter().zip(before) {
            let new = ring.lookup_owner(key);
            if new != old {
                moved += 1;
                minimal &= old.as_deref() == Some(node);
                debug!(key = %key, ?old, ?new, "key moved");
            }
        }
        info!(removed = node, moved, "node removed");
    }

    Ok(RingReport {
        replicas: config.replicas,
        keys: keys.len(),
        distribution,
        removed: remove.map(str::to_string),
        moved,
        minimal,
    })
}

/// Concurrent threads requesting one missing key
pub fn run_collapse(config: &CacheConfig, callers: usize, delay: Duration) -> Result<CollapseReport> {
    let cache = Arc::new(EvictionCache::new(config.capacity)?);
    let loader: Arc<SingleFlightLoader<String, String, String>> =
        Arc::new(SingleFlightLoader::new(cache).with_wait_timeout(config.wait_timeout()));
    let origin_calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(callers.max(1)));
    let start = Instant::now();

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let loader = Arc::clone(&loader);
            let origin_calls = Arc::clone(&origin_calls);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                loader.get(HOT_KEY.to_string(), |key| {
                    thread::sleep(delay);
                    let n = origin_calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(format!("{key}-v{n}"))
                })
            })
        })
        .collect();

    let mut values = BTreeSet::new();
    for handle in handles {
        let value = handle
            .join()
            .map_err(|_| anyhow!("caller thread panicked"))?
            .context("collapsed load failed")?;
        values.insert(value);
    }

    Ok(collapse_report(
        "threads",
        callers,
        delay,
        origin_calls.load(Ordering::SeqCst),
        values.len(),
        start.elapsed(),
        loader.stats().snapshot(),
    ))
}

/// Concurrent tokio tasks requesting one missing key
pub async fn run_collapse_async(
    config: &CacheConfig,
    callers: usize,
    delay: Duration,
) -> Result<CollapseReport> {
    let cache = Arc::new(EvictionCache::new(config.capacity)?);
    let loader: Arc<AsyncSingleFlightLoader<String, String, String>> =
        Arc::new(AsyncSingleFlightLoader::new(cache).with_wait_timeout(config.wait_timeout()));
    let origin_calls = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let tasks: Vec<_> = (0..callers)
        .map(|_| {
            let loader = Arc::clone(&loader);
            let origin_calls = Arc::clone(&origin_calls);
            tokio::spawn(async move {
                loader
                    .get(HOT_KEY.to_string(), move |key| async move {
                        tokio::time::sleep(delay).await;
                        let n = origin_calls.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(format!("{key}-v{n}"))
                    })
                    .await
            })
        })
        .collect();

    let mut values = BTreeSet::new();
    for task in tasks {
        let value = task
            .await
            .context("caller task panicked")?
            .context("collapsed load failed")?;
        values.insert(value);
    }

    Ok(collapse_report(
        "tasks",
        callers,
        delay,
        origin_calls.load(Ordering::SeqCst),
        values.len(),
        start.elapsed(),
        loader.stats().snapshot(),
    ))
}

fn collapse_report(
    mode: &'static str,
    callers: usize,
    delay: Duration,
    origin_calls: usize,
    distinct_values: usize,
    elapsed: Duration,
    flight: FlightStatsSnapshot,
) -> CollapseReport {
    info!(
        mode,
        callers,
        origin_calls,
        collapsed = flight.collapsed,
        "collapse workload finished in {:?}",
        elapsed
    );
    CollapseReport {
        mode,
        callers,
        delay_ms: delay.as_millis(),
        origin_calls,
        distinct_values,
        elapsed_ms: elapsed.as_millis(),
        flight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize, replicas: u32) -> CacheConfig {
        CacheConfig {
            capacity,
            replicas,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_lru_workload_is_reproducible() {
        let a = run_lru(&config(50, 3), 5_000, 500, 7).unwrap();
        let b = run_lru(&config(50, 3), 5_000, 500, 7).unwrap();

        assert_eq!(a.stats, b.stats);
        assert_eq!(a.stats.hits + a.stats.misses, 5_000);
        assert!(a.stats.evictions > 0);
    }

    #[test]
    fn test_ring_removal_is_minimal() {
        let nodes: Vec<String> = ["server1", "server2", "server3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = run_ring(&config(10, 50), &nodes, 2_000, Some("server2")).unwrap();

        assert_eq!(report.distribution.values().sum::<usize>(), 2_000);
        assert_eq!(report.moved, report.distribution["server2"]);
        assert!(report.minimal);
    }

    #[test]
    fn test_ring_unknown_removal_fails() {
        let nodes = vec!["server1".to_string()];
        assert!(run_ring(&config(10, 3), &nodes, 10, Some("server9")).is_err());
    }

    #[test]
    fn test_threads_collapse_to_one_call() {
        let report = run_collapse(&config(10, 3), 16, Duration::from_millis(50)).unwrap();

        assert_eq!(report.origin_calls, 1);
        assert_eq!(report.distinct_values, 1);
        assert_eq!(report.flight.loads, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_collapse_to_one_call() {
        let report = run_collapse_async(&config(10, 3), 16, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(report.origin_calls, 1);
        assert_eq!(report.distinct_values, 1);
    }
}
