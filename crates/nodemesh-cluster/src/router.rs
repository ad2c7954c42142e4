use nodemesh_common::Envelope;
use tracing::debug;

/// Delivers envelopes to connected peers.
///
/// The cluster manager decides *who* receives a message; a router knows
/// *how* to reach them. The server installs its live connection table here.
pub trait MessageRouter: Send + Sync {
    /// Hands `envelope` to the connection of `node_id`.
    ///
    /// Returns `false` when there is no live route to that node.
    fn route(&self, node_id: &str, envelope: Envelope) -> bool;
}

/// Router that delivers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRouter;

impl MessageRouter for NoopRouter {
    fn route(&self, node_id: &str, envelope: Envelope) -> bool {
        debug!(
            "No router attached, dropping {} for node {}",
            envelope.message_type, node_id
        );
        false
    }
}
