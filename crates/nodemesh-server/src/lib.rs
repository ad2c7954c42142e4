//! NodeMesh server
//!
//! Accepts peer connections over the length-prefixed TCP protocol. Each
//! connection is registered with the [`ClusterManager`](nodemesh_cluster::ClusterManager)
//! under a server-assigned node id and served by its own task:
//!
//! | Inbound     | Reply                                                     |
//! |-------------|-----------------------------------------------------------|
//! | `HEARTBEAT` | `Heartbeat received` + `timestamp`                        |
//! | `REGISTER`  | `Registration successful` + `nodeId`                      |
//! | `DATA`      | acknowledgement from the [`DataHandler`] + `receivedAt`   |
//! | `COMMAND`   | result of `status` / `nodes`, or `Unknown command: ...`   |
//! | `BROADCAST` | `Broadcast sent`, after forwarding to every online peer   |
//! | other       | error-flagged RESPONSE                                    |
//!
//! Every reply carries the id of the envelope it answers in the
//! `originalMessageId` attribute.

pub mod connection;
pub mod handler;
pub mod routes;
pub mod server;

pub use connection::WELCOME_MESSAGE;
pub use handler::{DataHandler, LoggingDataHandler};
pub use routes::ConnectionRoutes;
pub use server::{ClusterServer, ServerHandle};
