//! Service discovery collaborators
//!
//! The node asks discovery for its initial peers at start, and announces or
//! withdraws itself at start/stop. Which backend answers is not the core's
//! concern.

use nodemesh_common::config::{DiscoveryConfig, NodeConfig};
use nodemesh_common::protocol::error::Result;
use tracing::{debug, info, warn};

use crate::node::NodeEntry;

/// Source of cluster peers.
pub trait ServiceDiscovery: Send + Sync {
    /// Peers known to the backend.
    fn discover_cluster_nodes(&self) -> Vec<NodeEntry>;

    fn register_local_node(&self, local: &NodeConfig) -> Result<()>;

    fn deregister_local_node(&self, local: &NodeConfig) -> Result<()>;
}

/// Discovery that knows no peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiscovery;

impl ServiceDiscovery for NoopDiscovery {
    fn discover_cluster_nodes(&self) -> Vec<NodeEntry> {
        Vec::new()
    }

    fn register_local_node(&self, local: &NodeConfig) -> Result<()> {
        debug!("Discovery disabled, not announcing {}", local.id);
        Ok(())
    }

    fn deregister_local_node(&self, _local: &NodeConfig) -> Result<()> {
        Ok(())
    }
}

/// Discovery backed by a fixed list of `host:port` seeds.
///
/// Every seed is reported `Online` with a fresh heartbeat and uses its
/// address as node id. Malformed seeds are skipped with a warning.
///
/// ```
/// use nodemesh_cluster::discovery::{ServiceDiscovery, StaticDiscovery};
///
/// let discovery = StaticDiscovery::new(vec!["10.0.0.2:9090".to_string(), "bogus".to_string()]);
/// let nodes = discovery.discover_cluster_nodes();
///
/// assert_eq!(nodes.len(), 1);
/// assert_eq!(nodes[0].node_id(), "10.0.0.2:9090");
/// assert!(nodes[0].is_online());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    seeds: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(seeds: Vec<String>) -> Self {
        Self { seeds }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.seed_nodes.clone())
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }
}

fn parse_seed(seed: &str) -> Option<(String, u16)> {
    let (host, port) = seed.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

impl ServiceDiscovery for StaticDiscovery {
    fn discover_cluster_nodes(&self) -> Vec<NodeEntry> {
        self.seeds
            .iter()
            .filter_map(|seed| match parse_seed(seed) {
                Some((host, port)) => Some(NodeEntry::online(seed.trim(), host, port)),
                None => {
                    warn!("Ignoring malformed seed node '{}', expected host:port", seed);
                    None
                }
            })
            .collect()
    }

    fn register_local_node(&self, local: &NodeConfig) -> Result<()> {
        info!(
            "Local node {} at {}:{} known to {} seed(s)",
            local.id,
            local.host,
            local.port,
            self.seeds.len()
        );
        Ok(())
    }

    fn deregister_local_node(&self, local: &NodeConfig) -> Result<()> {
        debug!("Local node {} leaving static discovery", local.id);
        Ok(())
    }
}
