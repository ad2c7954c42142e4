//! Load-balancing strategies
//!
//! A strategy picks one node out of a candidate list. Every strategy first
//! drops candidates that are not available (offline, or at connection
//! capacity) and returns `None` when nothing is left.
//!
//! Strategies are created by name through a [`LoadBalancerRegistry`]:
//!
//! ```
//! use nodemesh_cluster::load_balancer::LoadBalancerRegistry;
//!
//! let registry = LoadBalancerRegistry::new();
//! assert_eq!(registry.create("least-connections").name(), "least-connections");
//!
//! // Unknown names fall back to round-robin
//! assert_eq!(registry.create("weighted").name(), "round-robin");
//! ```

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::node::NodeEntry;

/// Strategy used when none (or an unknown one) is requested.
pub const DEFAULT_STRATEGY: &str = "round-robin";

/// Selection policy over cluster nodes.
pub trait LoadBalancer: Send + Sync {
    /// Picks one available node from `candidates`.
    fn select_node(&self, candidates: &[NodeEntry]) -> Option<NodeEntry>;

    fn name(&self) -> &'static str;

    /// Clears internal state. Stateless strategies do nothing.
    fn reset(&self) {}
}

fn available(candidates: &[NodeEntry]) -> Vec<&NodeEntry> {
    candidates.iter().filter(|node| node.is_available()).collect()
}

/// Cycles through available nodes using a shared counter.
///
/// The counter is not tied to node identity, so membership changes between
/// calls may skip or repeat a position.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_node(&self, candidates: &[NodeEntry]) -> Option<NodeEntry> {
        let nodes = available(candidates);
        if nodes.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[index].clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}

/// Picks a uniformly random available node.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn select_node(&self, candidates: &[NodeEntry]) -> Option<NodeEntry> {
        let nodes = available(candidates);
        if nodes.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..nodes.len());
        Some(nodes[index].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Picks the available node with the fewest connections.
///
/// Ties go to the first such node in candidate order.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select_node(&self, candidates: &[NodeEntry]) -> Option<NodeEntry> {
        // min_by_key keeps the first minimum
        available(candidates)
            .into_iter()
            .min_by_key(|node| node.current_connections)
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least-connections"
    }
}

/// Constructor for a strategy instance.
pub type LoadBalancerFactory = Arc<dyn Fn() -> Arc<dyn LoadBalancer> + Send + Sync>;

/// Name → strategy factory table.
///
/// Built once at startup and handed to whoever needs a strategy; each
/// [`create`](Self::create) call returns a fresh instance with its own state.
#[derive(Clone)]
pub struct LoadBalancerRegistry {
    factories: HashMap<String, LoadBalancerFactory>,
}

impl LoadBalancerRegistry {
    /// Creates a registry with the built-in strategies.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("round-robin", || Arc::new(RoundRobinBalancer::new()));
        registry.register("random", || Arc::new(RandomBalancer::new()));
        registry.register("least-connections", || Arc::new(LeastConnectionsBalancer::new()));
        registry
    }

    /// Adds or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn LoadBalancer> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered load balancer strategy: {}", name);
        self.factories.insert(name, Arc::new(factory));
    }

    /// Instantiates the strategy called `name`, falling back to round-robin.
    pub fn create(&self, name: &str) -> Arc<dyn LoadBalancer> {
        if let Some(factory) = self.factories.get(name) {
            return factory();
        }

        warn!(
            "Load balancer strategy '{}' not found, using {} as default",
            name, DEFAULT_STRATEGY
        );
        match self.factories.get(DEFAULT_STRATEGY) {
            Some(factory) => factory(),
            None => Arc::new(RoundRobinBalancer::new()),
        }
    }

    pub fn has_strategy(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered strategy names, sorted.
    pub fn available_strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for LoadBalancerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStatus;
    use std::collections::HashSet;

    fn online_nodes(count: usize) -> Vec<NodeEntry> {
        (1..=count)
            .map(|i| NodeEntry::online(format!("node{}", i), "localhost", 9000 + i as u16))
            .collect()
    }

    fn ids(selected: &[Option<NodeEntry>]) -> Vec<String> {
        selected
            .iter()
            .map(|node| node.as_ref().map(|n| n.node_id().to_string()).unwrap_or_default())
            .collect()
    }

    // ------------------------------------------------------------------
    // Round-robin
    // ------------------------------------------------------------------

    #[test]
    fn test_round_robin() {
        let lb = RoundRobinBalancer::new();
        let nodes = online_nodes(3);

        let picks: Vec<_> = (0..4).map(|_| lb.select_node(&nodes)).collect();
        assert_eq!(ids(&picks), vec!["node1", "node2", "node3", "node1"]);
    }

    #[test]
    fn test_round_robin_each_node_once_per_cycle() {
        let lb = RoundRobinBalancer::new();
        let nodes = online_nodes(5);

        // Start mid-cycle
        lb.select_node(&nodes);
        lb.select_node(&nodes);

        let first: Vec<_> = (0..5).map(|_| lb.select_node(&nodes)).collect();
        let second: Vec<_> = (0..5).map(|_| lb.select_node(&nodes)).collect();

        let distinct: HashSet<_> = ids(&first).into_iter().collect();
        assert_eq!(distinct.len(), 5);
        // kth and (k+N)th selections match
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_round_robin_reset() {
        let lb = RoundRobinBalancer::new();
        let nodes = online_nodes(3);

        lb.select_node(&nodes);
        lb.select_node(&nodes);
        lb.reset();

        assert_eq!(lb.select_node(&nodes).unwrap().node_id(), "node1");
    }

    #[test]
    fn test_round_robin_skips_unavailable() {
        let lb = RoundRobinBalancer::new();
        let mut nodes = online_nodes(3);
        nodes[1].status = NodeStatus::Offline;

        let picks: Vec<_> = (0..4).map(|_| lb.select_node(&nodes)).collect();
        assert_eq!(ids(&picks), vec!["node1", "node3", "node1", "node3"]);
    }

    // ------------------------------------------------------------------
    // Random
    // ------------------------------------------------------------------

    #[test]
    fn test_random_only_returns_available() {
        let lb = RandomBalancer::new();
        let mut nodes = online_nodes(4);
        nodes[0].status = NodeStatus::Offline;
        nodes[2].status = NodeStatus::Failed;

        for _ in 0..100 {
            let picked = lb.select_node(&nodes).unwrap();
            assert!(picked.node_id() == "node2" || picked.node_id() == "node4");
        }
    }

    #[test]
    fn test_random_reaches_every_node() {
        let lb = RandomBalancer::new();
        let nodes = online_nodes(3);

        let seen: HashSet<String> = (0..500)
            .filter_map(|_| lb.select_node(&nodes))
            .map(|n| n.node_id().to_string())
            .collect();
        assert_eq!(seen.len(), 3);
    }

    // ------------------------------------------------------------------
    // Least-connections
    // ------------------------------------------------------------------

    #[test]
    fn test_least_connections() {
        let lb = LeastConnectionsBalancer::new();
        let mut nodes = online_nodes(3);
        nodes[0].current_connections = 5;
        nodes[1].current_connections = 2;
        nodes[2].current_connections = 8;

        for _ in 0..10 {
            assert_eq!(lb.select_node(&nodes).unwrap().node_id(), "node2");
        }
    }

    #[test]
    fn test_least_connections_tie_goes_to_first() {
        let lb = LeastConnectionsBalancer::new();
        let mut nodes = online_nodes(3);
        nodes[0].current_connections = 4;
        nodes[1].current_connections = 1;
        nodes[2].current_connections = 1;

        assert_eq!(lb.select_node(&nodes).unwrap().node_id(), "node2");
    }

    #[test]
    fn test_least_connections_ignores_full_nodes() {
        let lb = LeastConnectionsBalancer::new();
        let mut nodes = online_nodes(2);
        nodes[0].max_connections = 1;
        nodes[0].current_connections = 1;
        nodes[1].current_connections = 50;

        assert_eq!(lb.select_node(&nodes).unwrap().node_id(), "node2");
    }

    // ------------------------------------------------------------------
    // Shared behaviour
    // ------------------------------------------------------------------

    #[test]
    fn test_offline_only_node_is_never_selected() {
        let registry = LoadBalancerRegistry::new();
        let nodes = vec![NodeEntry::new("lonely", "localhost", 9090)];

        for name in registry.available_strategies() {
            let lb = registry.create(&name);
            assert!(lb.select_node(&nodes).is_none(), "strategy {}", name);
        }
    }

    #[test]
    fn test_empty_candidates_return_none() {
        let registry = LoadBalancerRegistry::new();

        for name in registry.available_strategies() {
            assert!(registry.create(&name).select_node(&[]).is_none());
        }
    }

    #[test]
    fn test_registry_fallback_to_round_robin() {
        let registry = LoadBalancerRegistry::new();

        assert!(!registry.has_strategy("weighted"));
        assert_eq!(registry.create("weighted").name(), "round-robin");
        assert_eq!(registry.create("").name(), "round-robin");
    }

    #[test]
    fn test_registry_lists_builtins() {
        let registry = LoadBalancerRegistry::new();

        assert_eq!(
            registry.available_strategies(),
            vec!["least-connections", "random", "round-robin"]
        );
    }

    #[test]
    fn test_registry_instances_are_independent() {
        let registry = LoadBalancerRegistry::new();
        let nodes = online_nodes(2);

        let a = registry.create("round-robin");
        let b = registry.create("round-robin");
        a.select_node(&nodes);

        assert_eq!(b.select_node(&nodes).unwrap().node_id(), "node1");
    }

    #[test]
    fn test_registry_custom_strategy() {
        struct FirstAvailable;

        impl LoadBalancer for FirstAvailable {
            fn select_node(&self, candidates: &[NodeEntry]) -> Option<NodeEntry> {
                candidates.iter().find(|n| n.is_available()).cloned()
            }

            fn name(&self) -> &'static str {
                "first-available"
            }
        }

        let mut registry = LoadBalancerRegistry::new();
        registry.register("first-available", || Arc::new(FirstAvailable));

        assert!(registry.has_strategy("first-available"));
        assert_eq!(registry.create("first-available").name(), "first-available");
    }
}
