//! Persisted description of one network.
//!
//! This is the serialized form of [`crate::cluster::NetworkCluster`]: it is
//! what the daemon reads at start-up and writes back after each committed
//! membership change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Network configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    /// Membership token (UUID string)
    #[serde(default)]
    pub token: String,
    /// Token not valid before this UNIX time (0 = unbounded)
    #[serde(default)]
    pub token_expire_before: u64,
    /// Token not valid after this UNIX time (0 = unbounded)
    #[serde(default)]
    pub token_expire_after: u64,
    /// Current term
    #[serde(default)]
    pub term: u64,
    /// Current index within the term
    #[serde(default)]
    pub index: u64,
    /// Heartbeat period in milliseconds (0 = daemon default)
    #[serde(default)]
    pub heartbeat_period_ms: u32,
    /// Heartbeat timeout in milliseconds (0 = daemon default)
    #[serde(default)]
    pub heartbeat_timeout_ms: u32,
    /// Members keyed by node id
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeConfig>,
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether the node is considered up
    #[serde(default)]
    pub active: bool,
    /// Published IPv4 addresses
    #[serde(default)]
    pub publish: Vec<String>,
}

impl NodeConfig {
    /// Create a node entry
    pub fn new(name: impl Into<String>, active: bool, publish: Vec<String>) -> Self {
        Self {
            name: name.into(),
            active,
            publish,
        }
    }
}

impl NetworkConfig {
    /// Apply daemon-wide heartbeat defaults where the network leaves them unset
    pub fn with_heartbeat_defaults(mut self, period_ms: u32, timeout_ms: u32) -> Self {
        if self.heartbeat_period_ms == 0 {
            self.heartbeat_period_ms = period_ms;
        }
        if self.heartbeat_timeout_ms == 0 {
            self.heartbeat_timeout_ms = timeout_ms;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_defaults_only_fill_zero() {
        let config = NetworkConfig {
            heartbeat_period_ms: 50,
            ..Default::default()
        }
        .with_heartbeat_defaults(200, 1000);

        assert_eq!(config.heartbeat_period_ms, 50);
        assert_eq!(config.heartbeat_timeout_ms, 1000);
    }
}
