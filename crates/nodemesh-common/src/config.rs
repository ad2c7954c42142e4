//! Node configuration
//!
//! A [`ClusterConfig`] groups every tunable of a node. Each section has
//! working defaults, so a config file only needs the values it changes:
//!
//! ```
//! use nodemesh_common::config::ClusterConfig;
//!
//! let config: ClusterConfig = serde_json::from_str(
//!     r#"{ "server": { "port": 7000 }, "load_balancer": { "strategy": "random" } }"#,
//! ).unwrap();
//!
//! assert_eq!(config.server.port, 7000);
//! assert_eq!(config.server.worker_threads, 4);
//! assert_eq!(config.load_balancer.strategy, "random");
//! assert!(config.node.id.starts_with("node-"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::protocol::error::{ClusterError, Result};
use crate::transport::codec::{DEFAULT_MAX_FRAME_LENGTH, MAX_ENCODABLE_FRAME_LENGTH};

/// Complete configuration of a cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub load_balancer: LoadBalancerConfig,
    pub serialization: SerializationConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Number of concurrent accept loops sharing the listener
    pub boss_threads: usize,
    /// Runtime worker threads for connection processing
    pub worker_threads: usize,
    /// Connections beyond this cap are closed on accept
    pub max_connections: usize,
    /// Largest accepted frame payload, in bytes
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            boss_threads: 1,
            worker_threads: 4,
            max_connections: 1000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Identity of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    /// Display name; the id is used when empty
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: generate_node_id(),
            name: None,
            host: "localhost".to_string(),
            port: 9090,
            metadata: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Failure detection and seed peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Peers given as `host:port`
    pub seed_nodes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            seed_nodes: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "round-robin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationConfig {
    pub format: String,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Reads a configuration from a JSON file and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ClusterConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can run a node.
    ///
    /// A heartbeat timeout shorter than the interval is accepted with a
    /// warning: every node would flap between ONLINE and OFFLINE.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.server.boss_threads, "server.boss_threads"),
            (self.server.worker_threads, "server.worker_threads"),
            (self.server.max_connections, "server.max_connections"),
            (self.server.max_frame_length, "server.max_frame_length"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(ClusterError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.server.max_connections > Semaphore::MAX_PERMITS {
            return Err(ClusterError::InvalidConfig(format!(
                "server.max_connections must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.server.max_frame_length > MAX_ENCODABLE_FRAME_LENGTH {
            return Err(ClusterError::InvalidConfig(format!(
                "server.max_frame_length must be at most {}",
                MAX_ENCODABLE_FRAME_LENGTH
            )));
        }

        if self.discovery.heartbeat_interval_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "discovery.heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.discovery.heartbeat_timeout_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "discovery.heartbeat_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.node.id.trim().is_empty() {
            return Err(ClusterError::InvalidConfig("node.id must not be empty".to_string()));
        }

        if self.discovery.heartbeat_timeout_ms < self.discovery.heartbeat_interval_ms {
            warn!(
                "Heartbeat timeout ({}ms) is shorter than the heartbeat interval ({}ms)",
                self.discovery.heartbeat_timeout_ms, self.discovery.heartbeat_interval_ms
            );
        }

        Ok(())
    }
}

fn generate_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}
