//! DistributedCache: ring-aware front end combining the cache, the ring and
//! single-flight loading for one node

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::EvictionCache;
use crate::config::CacheConfig;
use crate::error::{FlightError, Result};
use crate::flight::SingleFlightLoader;
use crate::ring::{HashRing, NodeId};

/// Where a key's authoritative copy lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// This node owns the key, or the ring is empty
    Local,
    /// Another node owns the key
    Remote(NodeId),
}

/// Cache for one node of a consistent-hashed cluster.
///
/// Misses are collapsed per key and handed to the caller's fetch function
/// together with the key's [`Route`], so the caller decides whether to read
/// the origin or ask the owning peer. Values fetched from peers are cached
/// locally as well.
pub struct DistributedCache<K, V, E> {
    local: NodeId,
    ring: Arc<HashRing>,
    loader: SingleFlightLoader<K, V, E>,
}

impl<K, V, E> DistributedCache<K, V, E>
where
    K: Hash + Eq + Clone + AsRef<[u8]>,
    V: Clone,
{
    /// Assemble from existing parts. `local` need not be on the ring yet.
    pub fn new(local: &str, ring: Arc<HashRing>, loader: SingleFlightLoader<K, V, E>) -> Self {
        Self {
            local: Arc::from(local),
            ring,
            loader,
        }
    }

    /// Build a cache, a ring holding only this node, and a loader
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(EvictionCache::new(config.capacity)?);
        let ring = Arc::new(HashRing::new(config.replicas)?);
        ring.add_node(&config.node_id)?;
        let loader = SingleFlightLoader::new(cache).with_wait_timeout(config.wait_timeout());

        info!(
            node = %config.node_id,
            capacity = config.capacity,
            replicas = config.replicas,
            "distributed cache ready"
        );
        Ok(Self::new(&config.node_id, ring, loader))
    }

    /// This node's identity
    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Decide whether `key` is served locally or by a peer
    pub fn route(&self, key: &K) -> Route {
        match self.ring.lookup_owner(key) {
            Some(owner) if owner != self.local => Route::Remote(owner),
            _ => Route::Local,
        }
    }

    /// Get `key`, fetching it on a miss.
    ///
    /// `fetch` runs at most once per collapsed window and receives the key's
    /// route at the time of the miss.
    pub fn get<F>(&self, key: K, fetch: F) -> std::result::Result<V, FlightError<E>>
    where
        F: FnOnce(&K, &Route) -> std::result::Result<V, E>,
    {
        self.loader.get(key, |k| {
            let route = self.route(k);
            debug!(?route, "cache miss, fetching");
            fetch(k, &route)
        })
    }

    /// Store a value locally
    pub fn put(&self, key: K, value: V) {
        self.loader.put(key, value);
    }

    /// Add a peer (or this node) to the ring
    pub fn add_node(&self, id: &str) -> Result<()> {
        self.ring.add_node(id)?;
        info!(node = id, nodes = self.ring.node_count(), "node joined");
        Ok(())
    }

    /// Remove a node from the ring
    pub fn remove_node(&self, id: &str) -> bool {
        let removed = self.ring.remove_node(id);
        if removed {
            info!(node = id, nodes = self.ring.node_count(), "node left");
        }
        removed
    }

    /// Drop cached entries this node no longer owns.
    ///
    /// Returns the number of entries dropped. Run after membership changes
    /// to hand ownership over to the new owners.
    pub fn retain_owned(&self) -> usize {
        let dropped = self.loader.cache().retain(|key, _| {
            self.ring
                .lookup_owner(key)
                .map_or(true, |owner| owner == self.local)
        });
        if dropped > 0 {
            info!(dropped, "dropped entries owned by other nodes");
        }
        dropped
    }

    /// Ring shared with membership
    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    /// Local cache
    pub fn cache(&self) -> &Arc<EvictionCache<K, V>> {
        self.loader.cache()
    }

    /// Single-flight loader in front of the cache
    pub fn loader(&self) -> &SingleFlightLoader<K, V, E> {
        &self.loader
    }
}

impl<K, V, E> fmt::Debug for DistributedCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedCache")
            .field("local", &self.local)
            .field("ring", &self.ring)
            .field("loader", &self.loader)
            .finish()
    }
}
