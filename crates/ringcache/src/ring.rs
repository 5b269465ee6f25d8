//! Consistent hashing ring implementation.
//!
//! Each node is placed on a `u64` ring at `replicas` virtual positions. A key
//! belongs to the node owning the first position at or after the key's hash,
//! wrapping around past the largest position.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Opaque node identifier handed out by cluster membership
pub type NodeId = Arc<str>;

/// Stable digest used to place nodes and keys on the ring.
///
/// Must return the same value for the same bytes across processes, so that
/// every participant computes the same ring.
pub trait RingHasher: Send + Sync {
    /// Hash `bytes` to a ring position
    fn hash(&self, bytes: &[u8]) -> u64;
}

/// Default ring digest: first 8 bytes of blake3, little-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl RingHasher for Blake3Hasher {
    fn hash(&self, bytes: &[u8]) -> u64 {
        let digest = blake3::hash(bytes);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(prefix)
    }
}

/// A virtual replica on the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    /// Ring position
    pub hash: u64,
    /// Physical node owning this position
    pub owner: NodeId,
    /// Which of the owner's replicas this is
    pub replica: u32,
}

#[derive(Default)]
struct RingState {
    /// Ring position -> virtual replica, ascending by position
    entries: BTreeMap<u64, RingEntry>,
    /// Physical nodes currently on the ring
    nodes: HashSet<NodeId, RandomState>,
}

/// Consistent hashing ring mapping keys to owning nodes.
///
/// Lookups share a read lock; adding or removing a node takes the write lock
/// for the whole ring. A node whose replicas would land on an occupied
/// position is rejected as a whole.
pub struct HashRing {
    state: RwLock<RingState>,
    replicas: u32,
    hasher: Box<dyn RingHasher>,
}

impl HashRing {
    /// Create an empty ring placing `replicas` virtual positions per node
    pub fn new(replicas: u32) -> Result<Self> {
        Self::with_hasher(replicas, Blake3Hasher)
    }

    /// Create an empty ring using a custom digest
    pub fn with_hasher<H>(replicas: u32, hasher: H) -> Result<Self>
    where
        H: RingHasher + 'static,
    {
        if replicas == 0 {
            return Err(Error::InvalidConfiguration(
                "ring replica count must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            state: RwLock::new(RingState::default()),
            replicas,
            hasher: Box::new(hasher),
        })
    }

    /// Add a node at its `replicas` deterministic positions.
    ///
    /// # Errors
    /// * `Error::DuplicateNode` if the node is already present
    /// * `Error::Collision` if any replica hashes onto an occupied position,
    ///   or two of the node's own replicas coincide; nothing is inserted
    pub fn add_node(&self, id: &str) -> Result<()> {
        let node: NodeId = Arc::from(id);
        let positions: Vec<u64> = (0..self.replicas)
            .map(|replica| self.vnode_position(id, replica))
            .collect();

        let mut state = self.state.write();
        if state.nodes.contains(id) {
            return Err(Error::DuplicateNode(node));
        }

        // Validate every position before touching the map
        let mut own: HashSet<u64, RandomState> = HashSet::default();
        for (replica, &position) in (0u32..).zip(positions.iter()) {
            let existing = if let Some(entry) = state.entries.get(&position) {
                Some(Arc::clone(&entry.owner))
            } else if !own.insert(position) {
                Some(Arc::clone(&node))
            } else {
                None
            };
            if let Some(existing) = existing {
                warn!(node = id, replica, position, %existing, "ring position collision, node rejected");
                return Err(Error::Collision {
                    node,
                    replica,
                    position,
                    existing,
                });
            }
        }

        for (replica, position) in (0u32..).zip(positions) {
            state.entries.insert(
                position,
                RingEntry {
                    hash: position,
                    owner: Arc::clone(&node),
                    replica,
                },
            );
        }
        state.nodes.insert(node);

        debug!(node = id, replicas = self.replicas, vnodes = state.entries.len(), "added node to ring");
        Ok(())
    }

    /// Remove a node and exactly the positions it was added at.
    ///
    /// Returns false if the node was not on the ring.
    pub fn remove_node(&self, id: &str) -> bool {
        let mut state = self.state.write();
        if !state.nodes.remove(id) {
            return false;
        }

        for replica in 0..self.replicas {
            let position = self.vnode_position(id, replica);
            let owned = state
                .entries
                .get(&position)
                .is_some_and(|entry| &*entry.owner == id);
            if owned {
                state.entries.remove(&position);
            }
        }

        debug!(node = id, vnodes = state.entries.len(), "removed node from ring");
        true
    }

    /// Node owning `key`, or `None` when the ring is empty
    pub fn lookup_owner<Q>(&self, key: &Q) -> Option<NodeId>
    where
        Q: AsRef<[u8]> + ?Sized,
    {
        let position = self.hasher.hash(key.as_ref());
        let state = self.state.read();
        Self::owner_at(&state, position)
    }

    /// Up to `count` distinct nodes for `key`, walking clockwise from its
    /// position. The first is the [`lookup_owner`](Self::lookup_owner) result.
    pub fn owners<Q>(&self, key: &Q, count: usize) -> Vec<NodeId>
    where
        Q: AsRef<[u8]> + ?Sized,
    {
        let position = self.hasher.hash(key.as_ref());
        let state = self.state.read();
        let wanted = count.min(state.nodes.len());
        let mut owners: Vec<NodeId> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }

        let after = state.entries.range(position..);
        let before = state.entries.range(..position);
        for (_, entry) in after.chain(before) {
            if !owners.contains(&entry.owner) {
                owners.push(Arc::clone(&entry.owner));
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }

    /// Count how many of `keys` each node owns
    pub fn distribution<I, Q>(&self, keys: I) -> BTreeMap<NodeId, usize>
    where
        I: IntoIterator<Item = Q>,
        Q: AsRef<[u8]>,
    {
        let state = self.state.read();
        let mut counts = BTreeMap::new();
        for key in keys {
            let position = self.hasher.hash(key.as_ref());
            if let Some(owner) = Self::owner_at(&state, position) {
                *counts.entry(owner).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Whether `id` is on the ring
    pub fn contains_node(&self, id: &str) -> bool {
        self.state.read().nodes.contains(id)
    }

    /// Node identifiers, sorted
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.state.read().nodes.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Snapshot of all virtual replicas in ascending position order
    pub fn entries(&self) -> Vec<RingEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Number of physical nodes
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Number of virtual replicas on the ring
    pub fn vnode_count(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Virtual replicas placed per node
    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    /// Whether the ring has no nodes
    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    fn owner_at(state: &RingState, position: u64) -> Option<NodeId> {
        state
            .entries
            .range(position..)
            .next()
            .or_else(|| state.entries.iter().next())
            .map(|(_, entry)| Arc::clone(&entry.owner))
    }

    /// Position of a virtual replica: hash(node_id ++ replica_index)
    fn vnode_position(&self, id: &str, replica: u32) -> u64 {
        let mut input = Vec::with_capacity(id.len() + 4);
        input.extend_from_slice(id.as_bytes());
        input.extend_from_slice(&replica.to_le_bytes());
        self.hasher.hash(&input)
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("nodes", &state.nodes.len())
            .field("vnodes", &state.entries.len())
            .finish()
    }
}
