//! # ringcache
//!
//! Building blocks for a distributed in-memory cache.
//!
//! ## Architecture
//! - **LRU**: AHash map over an arena-linked recency list, O(1) get/put/evict
//! - **Hash ring**: BLAKE3 virtual-node positions in a sorted map, O(log n) lookup
//! - **Single-flight**: one load per missing key, shared with every concurrent caller
//! - **DistributedCache**: ties the three together for one node of a cluster
//!
//! ## Example
//! ```
//! use std::sync::Arc;
//! use ringcache::{EvictionCache, SingleFlightLoader};
//!
//! let cache = Arc::new(EvictionCache::new(100).unwrap());
//! let loader: SingleFlightLoader<String, String, String> = SingleFlightLoader::new(cache);
//!
//! let value = loader.get("user:1".to_string(), |k| Ok(format!("loaded {k}"))).unwrap();
//! assert_eq!(value, "loaded user:1");
//! ```

#![warn(missing_docs)]

mod cache;
mod cluster;
mod config;
mod error;
mod flight;
mod flight_async;
mod lru;
mod ring;
mod stats;

pub use cache::EvictionCache;
pub use cluster::{DistributedCache, Route};
pub use config::{CacheConfig, DEFAULT_CAPACITY, DEFAULT_REPLICAS};
pub use error::{Error, FlightError, Result};
pub use flight::SingleFlightLoader;
pub use flight_async::AsyncSingleFlightLoader;
pub use lru::{EvictionHook, Iter, LruCache};
pub use ring::{Blake3Hasher, HashRing, NodeId, RingEntry, RingHasher};
pub use stats::{CacheStats, CacheStatsSnapshot, FlightStats, FlightStatsSnapshot};
