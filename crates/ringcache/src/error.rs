//! Error types for ringcache

use std::sync::Arc;
use std::time::Duration;

use crate::ring::NodeId;

/// Result type alias for ringcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or mutating cache structures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A size or count parameter is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A virtual replica hashed onto an occupied ring position
    #[error(
        "ring collision: replica {replica} of node '{node}' hashes to {position:#018x}, \
         already owned by '{existing}'"
    )]
    Collision {
        /// Node being added
        node: NodeId,
        /// Replica index that collided
        replica: u32,
        /// Ring position
        position: u64,
        /// Node that already holds the position
        existing: NodeId,
    },

    /// The node is already on the ring
    #[error("node '{0}' is already on the ring")]
    DuplicateNode(NodeId),

    /// Configuration file could not be read or parsed
    #[error("config error: {0}")]
    Config(String),
}

/// Outcome of a collapsed load that did not produce a value.
///
/// Every caller of the same collapsed window sees the same variant, and for
/// [`FlightError::Load`] the same `Arc` around the loader's error.
#[derive(Debug, thiserror::Error)]
pub enum FlightError<E> {
    /// The loader returned an error
    #[error("load failed: {0}")]
    Load(Arc<E>),

    /// This caller stopped waiting; the in-flight load keeps running
    #[error("gave up waiting for in-flight load after {0:?}")]
    Timeout(Duration),

    /// The leader panicked or was torn down before publishing a result
    #[error("in-flight load was abandoned by its leader")]
    LeaderAbandoned,
}

impl<E> Clone for FlightError<E> {
    fn clone(&self) -> Self {
        match self {
            FlightError::Load(err) => FlightError::Load(Arc::clone(err)),
            FlightError::Timeout(d) => FlightError::Timeout(*d),
            FlightError::LeaderAbandoned => FlightError::LeaderAbandoned,
        }
    }
}

impl<E> FlightError<E> {
    /// The loader error, if this outcome came from the loader
    pub fn load_error(&self) -> Option<&Arc<E>> {
        match self {
            FlightError::Load(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this caller timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, FlightError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collision_message() {
        let err = Error::Collision {
            node: "b".into(),
            replica: 2,
            position: 0xff,
            existing: "a".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("replica 2"));
        assert!(msg.contains("'a'"));
        assert!(msg.contains("0x00000000000000ff"));
    }

    #[test]
    fn test_flight_error_clone_shares_arc() {
        let err: FlightError<String> = FlightError::Load(Arc::new("boom".to_string()));
        let copy = err.clone();
        assert!(Arc::ptr_eq(
            err.load_error().unwrap(),
            copy.load_error().unwrap()
        ));
        assert!(!copy.is_timeout());
    }
}
