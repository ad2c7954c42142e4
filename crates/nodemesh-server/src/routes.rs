use dashmap::DashMap;
use nodemesh_cluster::MessageRouter;
use nodemesh_common::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Frames that may wait for one connection's writer
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Outbound queue of one connection.
pub type ConnectionSender = mpsc::Sender<Envelope>;

/// Live connections keyed by the node id assigned to them.
///
/// Each value feeds the writer task of a connection, so envelopes routed here
/// are written in the order they were queued. A connection whose queue is
/// full is skipped rather than waited on. Installed as the cluster manager's
/// [`MessageRouter`] while the server runs.
#[derive(Clone, Default)]
pub struct ConnectionRoutes {
    routes: Arc<DashMap<String, ConnectionSender>>,
}

impl ConnectionRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node_id: impl Into<String>, sender: ConnectionSender) {
        self.routes.insert(node_id.into(), sender);
    }

    pub fn remove(&self, node_id: &str) -> bool {
        self.routes.remove(node_id).is_some()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.routes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.routes.iter().map(|route| route.key().clone()).collect()
    }
}

impl MessageRouter for ConnectionRoutes {
    fn route(&self, node_id: &str, envelope: Envelope) -> bool {
        let Some(sender) = self.routes.get(node_id) else {
            debug!("No live connection for node {}", node_id);
            return false;
        };
        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue for {} is full, dropping envelope", node_id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
