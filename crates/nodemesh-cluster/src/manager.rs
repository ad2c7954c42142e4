use nodemesh_common::config::ClusterConfig;
use nodemesh_common::protocol::error::{ClusterError, Result};
use nodemesh_common::{attr, Envelope, MessageType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::heartbeat::{HeartbeatTasks, EVICTION_FACTOR};
use crate::load_balancer::{LoadBalancer, LoadBalancerRegistry};
use crate::node::{NodeEntry, NodeStatus};
use crate::router::{MessageRouter, NoopRouter};

/// How long `stop()` waits for the background tasks before aborting them
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Registry entries are individually locked so heartbeat refreshes only need
/// the registry's read lock.
type NodeMap = HashMap<String, Mutex<NodeEntry>>;

/// Point-in-time view of the cluster, for external reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub local_node_id: String,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub load_balancer: String,
    pub running: bool,
    pub nodes: Vec<NodeStatusSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusSummary {
    pub node_id: String,
    pub status: NodeStatus,
    /// Milliseconds since the last heartbeat
    pub last_heartbeat_ms_ago: u64,
    pub connections: u32,
}

struct ManagerInner {
    local_node_id: String,
    config: ClusterConfig,
    nodes: RwLock<NodeMap>,
    load_balancer: Arc<dyn LoadBalancer>,
    router: RwLock<Arc<dyn MessageRouter>>,
    running: AtomicBool,
    tasks: Mutex<Option<HeartbeatTasks>>,
}

/// Owner of the node registry.
///
/// The manager tracks every known peer, detects silent ones through the
/// heartbeat tasks, and picks or addresses peers on behalf of callers.
/// Looking up, sending to, or selecting a node that is missing or offline is
/// never an error: the result is simply empty.
///
/// Cloning is cheap; clones share the same registry.
///
/// # Example
///
/// ```
/// use nodemesh_cluster::{ClusterManager, NodeEntry};
/// use nodemesh_common::config::ClusterConfig;
///
/// let manager = ClusterManager::new(ClusterConfig::default());
/// manager.register_node(NodeEntry::online("node-a", "10.0.0.1", 9090));
/// manager.register_node(NodeEntry::new("node-b", "10.0.0.2", 9090));
///
/// assert_eq!(manager.node_count(), 2);
/// assert_eq!(manager.list_online().len(), 1);
/// assert_eq!(manager.select_node().unwrap().node_id(), "node-a");
/// ```
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning handle used by the background tasks.
#[derive(Clone)]
pub(crate) struct WeakClusterManager(Weak<ManagerInner>);

impl WeakClusterManager {
    pub(crate) fn upgrade(&self) -> Option<ClusterManager> {
        self.0.upgrade().map(|inner| ClusterManager { inner })
    }
}

fn lock_entry(entry: &Mutex<NodeEntry>) -> MutexGuard<'_, NodeEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterManager {
    /// Creates a manager using the strategy named in `config`.
    pub fn new(config: ClusterConfig) -> Self {
        Self::with_registry(config, &LoadBalancerRegistry::new())
    }

    /// Creates a manager resolving the configured strategy through `strategies`.
    pub fn with_registry(config: ClusterConfig, strategies: &LoadBalancerRegistry) -> Self {
        let load_balancer = strategies.create(&config.load_balancer.strategy);
        Self::with_load_balancer(config, load_balancer)
    }

    pub fn with_load_balancer(config: ClusterConfig, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                local_node_id: config.node.id.clone(),
                config,
                nodes: RwLock::new(HashMap::new()),
                load_balancer,
                router: RwLock::new(Arc::new(NoopRouter)),
                running: AtomicBool::new(false),
                tasks: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakClusterManager {
        WeakClusterManager(Arc::downgrade(&self.inner))
    }

    fn read_nodes(&self) -> RwLockReadGuard<'_, NodeMap> {
        self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_nodes(&self) -> RwLockWriteGuard<'_, NodeMap> {
        self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the heartbeat scanner and dead node reaper.
    ///
    /// Must be called from within a tokio runtime. Starting a running
    /// manager logs a warning and does nothing.
    pub fn start(&self) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClusterError::Shutdown(
                "cluster manager must be started inside a tokio runtime".to_string(),
            ));
        }

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.running.load(Ordering::SeqCst) {
            warn!("Cluster manager is already running");
            return Ok(());
        }

        info!("Starting cluster manager with node ID: {}", self.inner.local_node_id);

        let discovery = &self.inner.config.discovery;
        *tasks = Some(HeartbeatTasks::spawn(
            self,
            discovery.heartbeat_interval(),
            discovery.heartbeat_timeout(),
        ));
        self.inner.running.store(true, Ordering::SeqCst);

        info!("Cluster manager started successfully");
        Ok(())
    }

    /// Stops the background tasks, waiting up to [`SHUTDOWN_GRACE`].
    ///
    /// Stopping a stopped manager logs a warning and does nothing.
    pub async fn stop(&self) -> Result<()> {
        let tasks = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.inner.running.swap(false, Ordering::SeqCst) {
                warn!("Cluster manager is not running");
                return Ok(());
            }
            tasks.take()
        };

        info!("Stopping cluster manager");
        if let Some(tasks) = tasks {
            tasks.shutdown(SHUTDOWN_GRACE).await;
        }
        info!("Cluster manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Inserts `node`, replacing any entry with the same id.
    pub fn register_node(&self, node: NodeEntry) {
        let mut nodes = self.write_nodes();
        if nodes.contains_key(node.node_id()) {
            warn!("Node {} already exists, updating", node.node_id());
        }
        info!("Registered node: {}", node);
        nodes.insert(node.node_id().to_string(), Mutex::new(node));
    }

    /// Removes a node. Returns the removed entry, if there was one.
    pub fn unregister_node(&self, node_id: &str) -> Option<NodeEntry> {
        let removed = self
            .write_nodes()
            .remove(node_id)
            .map(|entry| entry.into_inner().unwrap_or_else(PoisonError::into_inner));
        if let Some(node) = &removed {
            info!("Unregistered node: {}", node);
        }
        removed
    }

    /// Refreshes a node's heartbeat and marks it online.
    ///
    /// Unknown ids are ignored. Returns whether the node exists.
    pub fn update_heartbeat(&self, node_id: &str) -> bool {
        self.update_heartbeat_at(node_id, Instant::now())
    }

    pub fn update_heartbeat_at(&self, node_id: &str, now: Instant) -> bool {
        self.update_node(node_id, |node| {
            node.refresh_heartbeat(now);
            debug!("Updated heartbeat for node: {}", node.node_id());
        })
    }

    /// Applies `update` to a node in place. Returns whether the node exists.
    ///
    /// The node id cannot be changed through this call.
    pub fn update_node<F>(&self, node_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut NodeEntry),
    {
        let nodes = self.read_nodes();
        match nodes.get(node_id) {
            Some(entry) => {
                update(&mut lock_entry(entry));
                true
            }
            None => false,
        }
    }

    pub fn increment_connections(&self, node_id: &str) -> bool {
        self.update_node(node_id, NodeEntry::increment_connections)
    }

    pub fn decrement_connections(&self, node_id: &str) -> bool {
        self.update_node(node_id, NodeEntry::decrement_connections)
    }

    fn collect_nodes<P>(&self, predicate: P) -> Vec<NodeEntry>
    where
        P: Fn(&NodeEntry) -> bool,
    {
        self.read_nodes()
            .values()
            .map(|entry| lock_entry(entry).clone())
            .filter(|node| predicate(node))
            .collect()
    }

    pub fn list_all(&self) -> Vec<NodeEntry> {
        self.collect_nodes(|_| true)
    }

    pub fn list_online(&self) -> Vec<NodeEntry> {
        self.collect_nodes(NodeEntry::is_online)
    }

    pub fn list_available(&self) -> Vec<NodeEntry> {
        self.collect_nodes(NodeEntry::is_available)
    }

    /// Every node that is not online.
    pub fn list_offline(&self) -> Vec<NodeEntry> {
        self.collect_nodes(|node| !node.is_online())
    }

    pub fn node_count(&self) -> usize {
        self.read_nodes().len()
    }

    pub fn online_node_count(&self) -> usize {
        self.read_nodes()
            .values()
            .filter(|entry| lock_entry(entry).is_online())
            .count()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.read_nodes().contains_key(node_id)
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeEntry> {
        self.read_nodes()
            .get(node_id)
            .map(|entry| lock_entry(entry).clone())
    }

    /// Picks an available node with the configured strategy.
    pub fn select_node(&self) -> Option<NodeEntry> {
        let candidates = self.list_available();
        self.inner.load_balancer.select_node(&candidates)
    }

    // ------------------------------------------------------------------
    // Failure detection
    // ------------------------------------------------------------------

    /// Marks nodes silent for longer than the heartbeat timeout as offline.
    ///
    /// Returns the ids of nodes that went offline during this scan.
    pub fn scan_heartbeats(&self) -> Vec<String> {
        self.scan_heartbeats_at(Instant::now())
    }

    pub fn scan_heartbeats_at(&self, now: Instant) -> Vec<String> {
        let timeout = self.inner.config.discovery.heartbeat_timeout();
        let nodes = self.read_nodes();

        let mut transitioned = Vec::new();
        for entry in nodes.values() {
            let mut node = lock_entry(entry);
            if !node.is_heartbeat_timeout(timeout, now) {
                continue;
            }
            if node.status != NodeStatus::Offline {
                warn!(
                    "Node {} heartbeat timeout, marking as offline",
                    node.node_id()
                );
                transitioned.push(node.node_id().to_string());
            }
            node.status = NodeStatus::Offline;
        }
        transitioned
    }

    /// Evicts nodes silent for longer than three heartbeat timeouts.
    ///
    /// Returns the ids of evicted nodes.
    pub fn reap_dead_nodes(&self) -> Vec<String> {
        self.reap_dead_nodes_at(Instant::now())
    }

    pub fn reap_dead_nodes_at(&self, now: Instant) -> Vec<String> {
        let eviction = self.inner.config.discovery.heartbeat_timeout() * EVICTION_FACTOR;
        let mut nodes = self.write_nodes();

        let dead: Vec<String> = nodes
            .iter()
            .filter(|(_, entry)| lock_entry(entry).is_heartbeat_timeout(eviction, now))
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in &dead {
            nodes.remove(node_id);
            info!("Cleaned up dead node: {}", node_id);
        }
        dead
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Installs the router used to deliver outgoing envelopes.
    pub fn attach_router(&self, router: Arc<dyn MessageRouter>) {
        *self.inner.router.write().unwrap_or_else(PoisonError::into_inner) = router;
    }

    /// Reverts to dropping outgoing envelopes.
    pub fn detach_router(&self) {
        self.attach_router(Arc::new(NoopRouter));
    }

    fn router(&self) -> Arc<dyn MessageRouter> {
        self.inner
            .router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sends `envelope` to one node.
    ///
    /// Unknown or offline targets are skipped with a warning. Returns whether
    /// the envelope was handed to a route.
    pub fn send_message(&self, target_node_id: &str, mut envelope: Envelope) -> bool {
        envelope.target_node_id = Some(target_node_id.to_string());
        envelope.source_node_id = Some(self.inner.local_node_id.clone());

        match self.get_node(target_node_id) {
            None => {
                warn!("Target node {} not found", target_node_id);
                return false;
            }
            Some(node) if !node.is_online() => {
                warn!("Target node {} is offline", target_node_id);
                return false;
            }
            Some(_) => {}
        }

        debug!("Sending {} to node: {}", envelope.message_type, target_node_id);
        self.router().route(target_node_id, envelope)
    }

    /// Sends `envelope` as a BROADCAST to every online node except this one.
    ///
    /// The original sender is kept in the `originNodeId` attribute before the
    /// source is rewritten. Returns the number of nodes it was routed to.
    pub fn broadcast_message(&self, mut envelope: Envelope) -> usize {
        if let Some(origin) = envelope.source_node_id.take() {
            if envelope.attribute(attr::ORIGIN_NODE_ID).is_none() {
                envelope.add_attribute(attr::ORIGIN_NODE_ID, origin);
            }
        }
        envelope.message_type = MessageType::Broadcast;
        envelope.source_node_id = Some(self.inner.local_node_id.clone());
        envelope.target_node_id = None;

        let targets: Vec<String> = self
            .list_online()
            .into_iter()
            .map(|node| node.node_id().to_string())
            .filter(|id| *id != self.inner.local_node_id)
            .collect();

        info!("Broadcasting message to {} online nodes", targets.len());

        let router = self.router();
        targets
            .iter()
            .filter(|node_id| {
                debug!("Broadcasting to node: {}", node_id);
                router.route(node_id, envelope.clone())
            })
            .count()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn cluster_status(&self) -> ClusterStatus {
        let now = Instant::now();
        let mut nodes: Vec<NodeStatusSummary> = self
            .list_all()
            .into_iter()
            .map(|node| NodeStatusSummary {
                node_id: node.node_id().to_string(),
                status: node.status,
                last_heartbeat_ms_ago: node.silence(now).as_millis() as u64,
                connections: node.current_connections,
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        ClusterStatus {
            local_node_id: self.inner.local_node_id.clone(),
            total_nodes: nodes.len(),
            online_nodes: nodes.iter().filter(|n| n.status == NodeStatus::Online).count(),
            load_balancer: self.load_balancer_name().to_string(),
            running: self.is_running(),
            nodes,
        }
    }

    pub fn load_balancer_name(&self) -> &'static str {
        self.inner.load_balancer.name()
    }

    pub fn load_balancer(&self) -> Arc<dyn LoadBalancer> {
        self.inner.load_balancer.clone()
    }

    pub fn local_node_id(&self) -> &str {
        &self.inner.local_node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }
}
