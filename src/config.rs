//! Store configuration schema and loading.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{AreaId, NodeId};

/// How to reach one peer's mesh endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// `host:port` of the peer's mesh server.
    pub addr: String,
}

impl PeerSpec {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's name. Required; must be unique in the network.
    pub node_name: String,
    /// Areas hosted by this node; each gets its own event loop.
    pub area_ids: BTreeSet<String>,
    /// Bind address for the mesh server. Port 0 picks an ephemeral port.
    pub listen_addr: String,
    /// Peers known at startup, per area. These gate the synced signal;
    /// peers added later do not.
    pub initial_peers: BTreeMap<String, BTreeMap<String, PeerSpec>>,
    /// Default record TTL in milliseconds; absent means never expire.
    pub ttl_default_ms: Option<u64>,
    pub sync_initial_timeout_ms: u64,
    pub sync_rpc_timeout_ms: u64,
    pub flood_rpc_timeout_ms: u64,
    /// Timeout for local admin calls into an area loop.
    pub read_timeout_ms: u64,
    pub publication_queue_capacity: usize,
    /// When false, flood to every initialized peer regardless of who sent
    /// the update (path-based loop suppression still applies).
    pub enable_flood_optimization: bool,
    pub backoff: BackoffConfig,
    pub counter_submit_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            area_ids: BTreeSet::new(),
            listen_addr: "127.0.0.1:0".to_string(),
            initial_peers: BTreeMap::new(),
            ttl_default_ms: Some(300_000),
            sync_initial_timeout_ms: 10_000,
            sync_rpc_timeout_ms: 30_000,
            flood_rpc_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            publication_queue_capacity: 1_024,
            enable_flood_optimization: true,
            backoff: BackoffConfig::default(),
            counter_submit_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl Config {
    pub fn new(node_name: impl Into<String>, area_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            node_name: node_name.into(),
            area_ids: area_ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        NodeId::parse(self.node_name.clone()).map_err(|e| ConfigError::Invalid {
            reason: format!("node_name: {e}"),
        })?;
        if self.area_ids.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "area_ids must not be empty".into(),
            });
        }
        for area in &self.area_ids {
            AreaId::parse(area.clone()).map_err(|e| ConfigError::Invalid {
                reason: format!("area_ids: {e}"),
            })?;
        }
        for area in self.initial_peers.keys() {
            if !self.area_ids.contains(area) {
                return Err(ConfigError::Invalid {
                    reason: format!("initial_peers references unknown area {area:?}"),
                });
            }
        }
        if self.publication_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "publication_queue_capacity must be > 0".into(),
            });
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(ConfigError::Invalid {
                reason: "backoff must satisfy 0 < initial_ms <= max_ms".into(),
            });
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::parse(self.node_name.clone()).expect("config validated")
    }

    /// TTL applied to records authored through `persist_key`.
    pub fn default_ttl(&self) -> crate::core::Ttl {
        match self.ttl_default_ms {
            Some(ms) => crate::core::Ttl::Finite(ms),
            None => crate::core::Ttl::Infinite,
        }
    }

    pub fn sync_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_rpc_timeout_ms)
    }

    pub fn flood_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.flood_rpc_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sync_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_initial_timeout_ms)
    }

    pub fn counter_submit_interval(&self) -> Duration {
        Duration::from_millis(self.counter_submit_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_identity_is_set() {
        let config = Config::new("node-1", ["area-1".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_missing_node_name() {
        let config = Config::new("", ["area-1".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_initial_peers_for_unknown_area() {
        let mut config = Config::new("node-1", ["area-1".to_string()]);
        config.initial_peers.insert(
            "area-2".to_string(),
            BTreeMap::from([("node-2".to_string(), PeerSpec::new("127.0.0.1:9"))]),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_document() {
        let doc = r#"
            node_name = "node-1"
            area_ids = ["area-1", "area-2"]
            sync_rpc_timeout_ms = 5000
            enable_flood_optimization = false

            [initial_peers.area-1.node-2]
            addr = "127.0.0.1:7007"
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync_rpc_timeout_ms, 5_000);
        assert!(!config.enable_flood_optimization);
        assert_eq!(
            config.initial_peers["area-1"]["node-2"],
            PeerSpec::new("127.0.0.1:7007")
        );
    }
}
