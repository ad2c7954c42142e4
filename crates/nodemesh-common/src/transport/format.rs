//! Envelope serialization formats
//!
//! The frame payload is produced by a named [`EnvelopeFormat`]. Formats are
//! looked up through a [`FormatRegistry`] built once at startup and handed to
//! the server and client; there is no process-wide format table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::protocol::error::Result;
use crate::protocol::{AttributeMap, Envelope, MessageType};

/// Name of the format used when none (or an unknown one) is requested.
pub const DEFAULT_FORMAT: &str = "json";

/// Serializes envelopes to and from frame payloads.
pub trait EnvelopeFormat: Send + Sync {
    /// Registry name, e.g. `"json"`.
    fn name(&self) -> &'static str;

    fn mime_type(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Envelope>;
}

/// Human-readable JSON format (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl EnvelopeFormat for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    fn mime_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Compact binary format backed by postcard.
///
/// Postcard is not self-describing, so attribute values (arbitrary JSON) are
/// carried as JSON text inside the binary layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardFormat;

#[derive(Serialize, Deserialize)]
struct CompactEnvelope {
    message_id: String,
    message_type: String,
    source_node_id: Option<String>,
    target_node_id: Option<String>,
    timestamp: u64,
    content: Option<String>,
    binary_payload: Option<Vec<u8>>,
    attributes: Vec<(String, String)>,
    sequence_number: u64,
}

impl EnvelopeFormat for PostcardFormat {
    fn name(&self) -> &'static str {
        "postcard"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-postcard"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let attributes = envelope
            .attributes
            .iter()
            .map(|(key, value)| Ok((key.clone(), serde_json::to_string(value)?)))
            .collect::<Result<Vec<_>>>()?;

        let compact = CompactEnvelope {
            message_id: envelope.message_id().to_string(),
            message_type: envelope.message_type.to_string(),
            source_node_id: envelope.source_node_id.clone(),
            target_node_id: envelope.target_node_id.clone(),
            timestamp: envelope.timestamp,
            content: envelope.content.clone(),
            binary_payload: envelope.binary_payload.clone(),
            attributes,
            sequence_number: envelope.sequence_number,
        };

        Ok(postcard::to_stdvec(&compact)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope> {
        let compact: CompactEnvelope = postcard::from_bytes(data)?;

        let mut attributes = AttributeMap::new();
        for (key, raw) in compact.attributes {
            attributes.insert(key, serde_json::from_str(&raw)?);
        }

        let mut envelope =
            Envelope::from_parts(compact.message_id, MessageType::from(compact.message_type));
        envelope.source_node_id = compact.source_node_id;
        envelope.target_node_id = compact.target_node_id;
        envelope.timestamp = compact.timestamp;
        envelope.content = compact.content;
        envelope.binary_payload = compact.binary_payload;
        envelope.attributes = attributes;
        envelope.sequence_number = compact.sequence_number;
        Ok(envelope)
    }
}

/// Name → format lookup table.
///
/// # Example
///
/// ```
/// use nodemesh_common::transport::FormatRegistry;
///
/// let formats = FormatRegistry::new();
/// assert_eq!(formats.get("postcard").name(), "postcard");
///
/// // Unknown names fall back to JSON instead of failing
/// assert_eq!(formats.get("xml").name(), "json");
/// ```
#[derive(Clone)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn EnvelopeFormat>>,
}

impl FormatRegistry {
    /// Creates a registry holding the built-in `json` and `postcard` formats.
    pub fn new() -> Self {
        let mut registry = Self {
            formats: HashMap::new(),
        };
        registry.register(Arc::new(JsonFormat));
        registry.register(Arc::new(PostcardFormat));
        registry
    }

    /// Adds `format` under its own name, replacing any previous entry.
    pub fn register(&mut self, format: Arc<dyn EnvelopeFormat>) {
        info!("Registered envelope format: {}", format.name());
        self.formats.insert(format.name().to_string(), format);
    }

    /// Looks up a format, falling back to JSON for unknown names.
    pub fn get(&self, name: &str) -> Arc<dyn EnvelopeFormat> {
        if let Some(format) = self.formats.get(name) {
            return format.clone();
        }

        warn!("Envelope format '{}' not found, using {} as default", name, DEFAULT_FORMAT);
        self.formats
            .get(DEFAULT_FORMAT)
            .cloned()
            .unwrap_or_else(|| Arc::new(JsonFormat))
    }

    pub fn has_format(&self, name: &str) -> bool {
        self.formats.contains_key(name)
    }

    /// Registered format names, sorted.
    pub fn available_formats(&self) -> Vec<String> {
        let mut names: Vec<String> = self.formats.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}
