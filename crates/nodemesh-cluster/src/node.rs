use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Default connection capacity of a node
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1000;

/// Health state of a registry entry.
///
/// The heartbeat scanner only moves nodes between `Online` and `Offline`.
/// `Suspect` and `Failed` are reserved for a graduated failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
    Suspect,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "ONLINE",
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Suspect => "SUSPECT",
            NodeStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster member as seen by the local registry.
///
/// New entries start `Offline` with a fresh heartbeat timestamp; they become
/// `Online` on registration or on their first heartbeat.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    node_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_heartbeat: Instant,
    pub started_at: Instant,
    pub version: String,
    /// Load-balancing hint, always positive
    pub weight: u32,
    pub current_connections: u32,
    pub max_connections: u32,
    pub tags: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, Value>,
}

impl NodeEntry {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let node_id = node_id.into();
        let now = Instant::now();
        Self {
            name: node_id.clone(),
            node_id,
            host: host.into(),
            port,
            status: NodeStatus::Offline,
            last_heartbeat: now,
            started_at: now,
            version: "1.0.0".to_string(),
            weight: 1,
            current_connections: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Creates an entry that is already `Online` with a fresh heartbeat.
    pub fn online(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let mut entry = Self::new(node_id, host, port);
        entry.status = NodeStatus::Online;
        entry
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// Online and below its connection capacity.
    pub fn is_available(&self) -> bool {
        self.is_online() && self.current_connections < self.max_connections
    }

    /// True when the last heartbeat is older than `timeout` at `now`.
    pub fn is_heartbeat_timeout(&self, timeout: Duration, now: Instant) -> bool {
        self.silence(now) > timeout
    }

    /// Time since the last heartbeat, zero if `now` is earlier.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Records a heartbeat at `now` and marks the node online.
    pub fn refresh_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.status = NodeStatus::Online;
    }

    pub fn increment_connections(&mut self) {
        self.current_connections = self.current_connections.saturating_add(1);
    }

    /// Decrements the connection count, never below zero.
    pub fn decrement_connections(&mut self) {
        self.current_connections = self.current_connections.saturating_sub(1);
    }

    /// Fraction of the connection capacity in use, between 0.0 and 1.0+.
    pub fn connection_usage(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        self.current_connections as f64 / self.max_connections as f64
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node{{id={}, address={}, status={}, connections={}/{}}}",
            self.node_id,
            self.address(),
            self.status,
            self.current_connections,
            self.max_connections
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let node = NodeEntry::new("node-1", "10.0.0.1", 9090);

        assert_eq!(node.node_id(), "node-1");
        assert_eq!(node.name, "node-1");
        assert_eq!(node.address(), "10.0.0.1:9090");
        assert_eq!(node.status, NodeStatus::Offline);
        assert_eq!(node.weight, 1);
        assert_eq!(node.current_connections, 0);
        assert_eq!(node.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(!node.is_online());
        assert!(!node.is_available());
    }

    #[test]
    fn test_online_node_is_available() {
        let node = NodeEntry::online("node-1", "localhost", 9090);

        assert!(node.is_online());
        assert!(node.is_available());
    }

    #[test]
    fn test_full_node_is_not_available() {
        let mut node = NodeEntry::online("node-1", "localhost", 9090).with_max_connections(2);
        node.increment_connections();
        assert!(node.is_available());

        node.increment_connections();
        assert!(node.is_online());
        assert!(!node.is_available());
        assert_eq!(node.connection_usage(), 1.0);
    }

    #[test]
    fn test_decrement_connections_saturates() {
        let mut node = NodeEntry::new("node-1", "localhost", 9090);
        node.decrement_connections();
        node.decrement_connections();

        assert_eq!(node.current_connections, 0);
    }

    #[test]
    fn test_heartbeat_timeout_is_strict() {
        let mut node = NodeEntry::new("node-1", "localhost", 9090);
        let t0 = Instant::now();
        node.refresh_heartbeat(t0);
        let timeout = Duration::from_secs(10);

        assert!(!node.is_heartbeat_timeout(timeout, t0 + timeout));
        assert!(node.is_heartbeat_timeout(timeout, t0 + timeout + Duration::from_millis(1)));
        // A clock reading before the heartbeat is never a timeout
        assert!(!node.is_heartbeat_timeout(timeout, t0 - Duration::from_millis(1)));
    }

    #[test]
    fn test_refresh_heartbeat_brings_node_online() {
        let mut node = NodeEntry::new("node-1", "localhost", 9090);
        node.status = NodeStatus::Offline;
        node.refresh_heartbeat(Instant::now());

        assert_eq!(node.status, NodeStatus::Online);
    }

    #[test]
    fn test_tags_and_metadata() {
        let mut node = NodeEntry::new("node-1", "localhost", 9090);
        node.add_tag("zone", "eu-1");
        node.add_metadata("cores", 8);

        assert_eq!(node.tag("zone"), Some("eu-1"));
        assert_eq!(node.tag("rack"), None);
        assert_eq!(node.metadata("cores"), Some(&Value::from(8)));
    }

    #[test]
    fn test_weight_is_positive() {
        let node = NodeEntry::new("node-1", "localhost", 9090).with_weight(0);
        assert_eq!(node.weight, 1);
    }

    #[test]
    fn test_status_serializes_screaming() {
        assert_eq!(serde_json::to_string(&NodeStatus::Online).unwrap(), "\"ONLINE\"");
        assert_eq!(NodeStatus::Suspect.to_string(), "SUSPECT");
    }
}
