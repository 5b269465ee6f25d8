//! Cache configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of cached entries
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default virtual replicas per node
pub const DEFAULT_REPLICAS: u32 = 3;

/// Settings for a [`DistributedCache`](crate::DistributedCache)
///
/// Missing fields take their defaults, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Identity of this process on the ring
    pub node_id: String,

    /// Maximum number of cached entries
    pub capacity: usize,

    /// Virtual replicas per node
    pub replicas: u32,

    /// How long callers wait on another caller's load, in milliseconds.
    /// `None` waits indefinitely.
    pub wait_timeout_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            capacity: DEFAULT_CAPACITY,
            replicas: DEFAULT_REPLICAS,
            wait_timeout_ms: None,
        }
    }
}

impl CacheConfig {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "capacity must be greater than 0".to_string(),
            ));
        }
        if self.replicas == 0 {
            return Err(Error::InvalidConfiguration(
                "replicas must be greater than 0".to_string(),
            ));
        }
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfiguration(
                "node_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Waiter timeout as a `Duration`
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}
