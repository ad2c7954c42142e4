//! NodeMesh Common Types and Transport
//!
//! This crate provides the message envelope, wire codec and configuration
//! shared by every NodeMesh component.
//!
//! # Overview
//!
//! NodeMesh is a peer-membership and message-dispatch layer. Nodes keep
//! persistent TCP connections to each other, exchange heartbeats, and route
//! data, command and broadcast envelopes. This crate contains the pieces both
//! ends of a connection agree on:
//!
//! - **Protocol Layer**: the [`Envelope`], message kinds and error type
//! - **Transport Layer**: length-prefixed framing and envelope formats
//! - **Configuration**: [`config::ClusterConfig`] and its sections
//!
//! # Architecture
//!
//! - **Transport**: persistent TCP connections
//! - **Serialization**: JSON (default) or postcard
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [envelope]`
//! - **Max Frame Size**: 65535 bytes by default
//!
//! # Example
//!
//! ```
//! use nodemesh_common::{Envelope, MessageType};
//!
//! let heartbeat = Envelope::with_content(MessageType::Heartbeat, "Heartbeat")
//!     .with_source("client-1");
//! let ack = Envelope::response_to(&heartbeat, "Heartbeat received");
//!
//! assert_eq!(ack.correlation_id(), Some(heartbeat.message_id()));
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

pub use protocol::*;
