//! NodeMesh cluster membership
//!
//! The node registry, failure detection and load-balancing layer:
//!
//! - [`node`] - registry entries and their health states
//! - [`load_balancer`] - selection strategies and the strategy registry
//! - [`manager`] - the [`ClusterManager`] owning the registry
//! - [`heartbeat`] - background scanner and reaper
//! - [`discovery`] - sources of initial peers
//! - [`router`] - delivery of outgoing envelopes

pub mod discovery;
pub mod heartbeat;
pub mod load_balancer;
pub mod manager;
pub mod node;
pub mod router;

pub use discovery::{NoopDiscovery, ServiceDiscovery, StaticDiscovery};
pub use load_balancer::{
    LeastConnectionsBalancer, LoadBalancer, LoadBalancerRegistry, RandomBalancer, RoundRobinBalancer,
};
pub use manager::{ClusterManager, ClusterStatus, NodeStatusSummary};
pub use node::{NodeEntry, NodeStatus};
pub use router::{MessageRouter, NoopRouter};
