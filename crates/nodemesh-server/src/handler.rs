use nodemesh_common::protocol::error::Result;
use nodemesh_common::Envelope;
use tracing::info;

/// Application hook for DATA envelopes.
///
/// The returned string becomes the content of the acknowledgement. An error
/// is reported back to the sender as an error-flagged RESPONSE; the
/// connection stays open.
pub trait DataHandler: Send + Sync {
    fn on_data(&self, node_id: &str, envelope: &Envelope) -> Result<String>;
}

/// Logs every DATA envelope and acknowledges it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDataHandler;

impl DataHandler for LoggingDataHandler {
    fn on_data(&self, node_id: &str, envelope: &Envelope) -> Result<String> {
        info!(
            "Received data message from {}: {}",
            node_id,
            envelope.content.as_deref().unwrap_or("")
        );
        Ok("Data received".to_string())
    }
}
