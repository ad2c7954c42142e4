//! NodeMesh Client
//!
//! Connects to a NodeMesh server, registers, keeps itself alive with
//! heartbeats and correlates responses to requests by message id.
//!
//! ```no_run
//! use nodemesh_client::{ClientConfig, ClusterClient};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClusterClient::new(ClientConfig::default());
//! client.connect("127.0.0.1:9090").await?;
//!
//! let reply = client.send_data("ping").await?.await?;
//! println!("{}", reply.content.unwrap_or_default());
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod pending;

pub use client::{ClientConfig, ClusterClient, CLIENT_VERSION};
pub use pending::{PendingRequests, PendingResponse};
