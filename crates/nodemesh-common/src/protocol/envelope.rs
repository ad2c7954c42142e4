//! NodeMesh Message Envelope
//!
//! The envelope is the single unit exchanged over the wire. Every frame carries
//! exactly one serialized [`Envelope`].
//!
//! # Correlation
//!
//! Each envelope receives a unique `message_id` at construction. The id can be
//! read but never reassigned; request/response correlation depends on it.
//! Replies produced with [`Envelope::response_to`] reference the triggering
//! envelope through the `originalMessageId` attribute.
//!
//! # Example
//!
//! ```
//! use nodemesh_common::protocol::{attr, Envelope, MessageType};
//!
//! let request = Envelope::with_content(MessageType::Data, "ping")
//!     .with_source("client-1");
//! let response = Envelope::response_to(&request, "Data received");
//!
//! assert!(response.is_response());
//! assert_eq!(response.correlation_id(), Some(request.message_id()));
//! assert_eq!(response.target_node_id.as_deref(), Some("client-1"));
//! assert!(response.attribute(attr::ORIGINAL_MESSAGE_ID).is_some());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

pub type MessageId = String;
pub type NodeId = String;
pub type AttributeMap = BTreeMap<String, Value>;

/// Well-known attribute keys.
pub mod attr {
    /// Present on a RESPONSE that reports a failure.
    pub const ERROR: &str = "error";
    /// Id of the envelope a RESPONSE answers.
    pub const ORIGINAL_MESSAGE_ID: &str = "originalMessageId";
    pub const TIMESTAMP: &str = "timestamp";
    pub const RECEIVED_AT: &str = "receivedAt";
    /// Node id assigned to a connection by the server.
    pub const NODE_ID: &str = "nodeId";
    pub const VERSION: &str = "version";
    pub const START_TIME: &str = "startTime";
    /// Sender of a broadcast before the source was rewritten by the relaying node.
    pub const ORIGIN_NODE_ID: &str = "originNodeId";
}

/// Kind of an envelope.
///
/// Unrecognized wire names decode into [`MessageType::Unknown`] instead of
/// failing, so the receiver can answer them with an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Heartbeat,
    Register,
    Unregister,
    Data,
    Command,
    Response,
    Broadcast,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Register => "REGISTER",
            MessageType::Unregister => "UNREGISTER",
            MessageType::Data => "DATA",
            MessageType::Command => "COMMAND",
            MessageType::Response => "RESPONSE",
            MessageType::Broadcast => "BROADCAST",
            MessageType::Unknown(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "HEARTBEAT" => MessageType::Heartbeat,
            "REGISTER" => MessageType::Register,
            "UNREGISTER" => MessageType::Unregister,
            "DATA" => MessageType::Data,
            "COMMAND" => MessageType::Command,
            "RESPONSE" => MessageType::Response,
            "BROADCAST" => MessageType::Broadcast,
            _ => MessageType::Unknown(name),
        }
    }
}

impl From<MessageType> for String {
    fn from(message_type: MessageType) -> Self {
        message_type.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message exchanged between cluster nodes.
///
/// # Fields
///
/// - `message_id`: unique id assigned at construction (read-only)
/// - `message_type`: what the envelope is for
/// - `source_node_id` / `target_node_id`: addressing (`None` target means broadcast)
/// - `timestamp`: wall-clock milliseconds at construction
/// - `content`: string payload
/// - `binary_payload`: optional raw bytes
/// - `attributes`: out-of-band values such as `error`
/// - `sequence_number`: caller-assigned ordering hint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    message_id: MessageId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub source_node_id: Option<NodeId>,
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    pub timestamp: u64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub binary_payload: Option<Vec<u8>>,
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(default)]
    pub sequence_number: u64,
}

impl Envelope {
    /// Creates an envelope of the given type with no content.
    pub fn new(message_type: MessageType) -> Self {
        Envelope {
            message_id: generate_message_id(),
            message_type,
            source_node_id: None,
            target_node_id: None,
            timestamp: current_millis(),
            content: None,
            binary_payload: None,
            attributes: AttributeMap::new(),
            sequence_number: 0,
        }
    }

    /// Creates an envelope of the given type carrying `content`.
    pub fn with_content(message_type: MessageType, content: impl Into<String>) -> Self {
        let mut envelope = Self::new(message_type);
        envelope.content = Some(content.into());
        envelope
    }

    /// Creates a RESPONSE answering `request`.
    ///
    /// The reply is addressed to the request's source and references the
    /// request's id through `originalMessageId`.
    pub fn response_to(request: &Envelope, content: impl Into<String>) -> Self {
        let mut response = Self::with_content(MessageType::Response, content);
        response.target_node_id = request.source_node_id.clone();
        response.add_attribute(attr::ORIGINAL_MESSAGE_ID, request.message_id.clone());
        response
    }

    /// Creates an error-flagged RESPONSE answering `request`.
    pub fn error_response_to(request: &Envelope, error: impl fmt::Display) -> Self {
        let mut response = Self::response_to(request, format!("Error: {}", error));
        response.add_attribute(attr::ERROR, true);
        response
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn with_source(mut self, node_id: impl Into<NodeId>) -> Self {
        self.source_node_id = Some(node_id.into());
        self
    }

    pub fn with_target(mut self, node_id: impl Into<NodeId>) -> Self {
        self.target_node_id = Some(node_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_attribute(key, value);
        self
    }

    pub fn with_binary_payload(mut self, payload: Vec<u8>) -> Self {
        self.binary_payload = Some(payload);
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Returns the attribute for `key`, or `default` when it is absent.
    pub fn attribute_or(&self, key: &str, default: Value) -> Value {
        self.attributes.get(key).cloned().unwrap_or(default)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == MessageType::Heartbeat
    }

    pub fn is_broadcast(&self) -> bool {
        self.message_type == MessageType::Broadcast
    }

    pub fn is_response(&self) -> bool {
        self.message_type == MessageType::Response
    }

    /// True when the `error` attribute is present, whatever its value.
    pub fn is_error(&self) -> bool {
        self.attributes.contains_key(attr::ERROR)
    }

    /// Id of the request this envelope answers, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.attribute(attr::ORIGINAL_MESSAGE_ID)
            .and_then(Value::as_str)
    }

    pub(crate) fn from_parts(message_id: MessageId, message_type: MessageType) -> Self {
        let mut envelope = Self::new(message_type);
        envelope.message_id = message_id;
        envelope
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope{{id={}, type={}, source={}, target={}, content={:?}, payload={}B, attributes={}}}",
            self.message_id,
            self.message_type,
            self.source_node_id.as_deref().unwrap_or("-"),
            self.target_node_id.as_deref().unwrap_or("*"),
            self.content.as_deref().unwrap_or(""),
            self.binary_payload.as_ref().map(Vec::len).unwrap_or(0),
            self.attributes.len(),
        )
    }
}

fn generate_message_id() -> MessageId {
    format!("msg-{}", uuid::Uuid::new_v4())
}

/// Milliseconds since the Unix epoch.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
