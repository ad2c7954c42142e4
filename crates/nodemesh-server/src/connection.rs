//! Per-connection actor
//!
//! Every accepted socket gets one task that:
//!
//! 1. registers the peer as an `Online` node under a server-assigned id
//! 2. sends a welcome RESPONSE
//! 3. reads frames and answers each one through the dispatch table
//! 4. unregisters the peer on every exit path
//!
//! Replies and routed envelopes go through a single writer task, so frames
//! leave in the order they were produced.

use nodemesh_cluster::{ClusterManager, NodeEntry};
use nodemesh_common::protocol::error::{ClusterError, Result};
use nodemesh_common::transport::EnvelopeCodec;
use nodemesh_common::{attr, current_millis, Envelope, MessageType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::handler::DataHandler;
use crate::routes::{ConnectionRoutes, OUTBOUND_QUEUE_CAPACITY};

/// Content of the first frame sent on every connection
pub const WELCOME_MESSAGE: &str = "Welcome to NodeMesh!";

/// How long queued frames may take to flush after the read side closes
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by all connections of one server.
pub(crate) struct ConnectionContext {
    pub manager: ClusterManager,
    pub routes: ConnectionRoutes,
    pub codec: EnvelopeCodec,
    pub data_handler: Arc<dyn DataHandler>,
    /// Source of the numeric suffix in assigned node ids
    pub connection_counter: AtomicU64,
}

impl ConnectionContext {
    fn next_node_id(&self, peer: &SocketAddr) -> String {
        let sequence = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("client-{}-{}-{}", peer.ip(), peer.port(), sequence)
    }

    fn reply(&self, request: &Envelope, content: impl Into<String>) -> Envelope {
        Envelope::response_to(request, content).with_source(self.manager.local_node_id())
    }

    fn error_reply(&self, request: &Envelope, error: impl std::fmt::Display) -> Envelope {
        Envelope::error_response_to(request, error).with_source(self.manager.local_node_id())
    }
}

/// Identity the server assigned to a connection.
pub(crate) struct Peer {
    pub node_id: String,
    pub addr: SocketAddr,
}

impl Peer {
    fn entry(&self) -> NodeEntry {
        NodeEntry::online(self.node_id.clone(), self.addr.ip().to_string(), self.addr.port())
    }
}

/// Removes the connection from the registry and routing table when dropped.
struct RegistrationGuard {
    node_id: String,
    manager: ClusterManager,
    routes: ConnectionRoutes,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.routes.remove(&self.node_id);
        self.manager.unregister_node(&self.node_id);
        info!("Client disconnected: {}", self.node_id);
    }
}

/// Serves one accepted connection until the peer leaves, the stream breaks,
/// or `shutdown` fires.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = Peer {
        node_id: ctx.next_node_id(&peer),
        addr: peer,
    };
    let node_id = peer.node_id.clone();
    ctx.manager.register_node(peer.entry());

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    ctx.routes.insert(node_id.clone(), tx.clone());
    let guard = RegistrationGuard {
        node_id: node_id.clone(),
        manager: ctx.manager.clone(),
        routes: ctx.routes.clone(),
    };

    info!("Client connected: {} from {}", node_id, peer.addr);

    let (mut reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(write_loop(writer, rx, ctx.codec.clone(), node_id.clone()));

    let welcome = Envelope::with_content(MessageType::Response, WELCOME_MESSAGE)
        .with_source(ctx.manager.local_node_id())
        .with_target(node_id.clone())
        .with_attribute(attr::NODE_ID, node_id.clone());
    let _ = tx.send(welcome).await;

    if *shutdown.borrow() {
        debug!("Server shutting down, closing {}", node_id);
    } else {
        loop {
            let frame = tokio::select! {
                frame = ctx.codec.read_envelope(&mut reader) => frame,
                _ = shutdown.changed() => {
                    debug!("Server shutting down, closing {}", node_id);
                    break;
                }
            };

            match frame {
                Ok(Some(envelope)) => {
                    let reply = dispatch(&ctx, &peer, envelope);
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Connection closed by peer: {}", node_id);
                    break;
                }
                Err(e) => {
                    warn!("Closing connection {}: {}", node_id, e);
                    break;
                }
            }
        }
    }

    // Route removal drops the last other sender so the writer can drain
    drop(guard);
    drop(tx);

    let abort = writer_task.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
        warn!("Writer for {} did not drain in time, aborting", node_id);
        abort.abort();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Envelope>,
    codec: EnvelopeCodec,
    node_id: String,
) {
    while let Some(envelope) = outbound.recv().await {
        let frame = match codec.encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message for {}: {}", node_id, e);
                continue;
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            warn!("Failed to send message to {}: {}", node_id, e);
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush message to {}: {}", node_id, e);
            break;
        }
        debug!("Sent {} to {}", envelope.message_type, node_id);
    }

    let _ = writer.shutdown().await;
}

/// Answers one inbound envelope. Never fails: errors become error replies.
pub(crate) fn dispatch(ctx: &ConnectionContext, peer: &Peer, mut envelope: Envelope) -> Envelope {
    let node_id = peer.node_id.as_str();
    // The connection decides who the sender is
    envelope.source_node_id = Some(node_id.to_string());
    debug!("Received message from {}: {}", node_id, envelope);

    let result = match &envelope.message_type {
        MessageType::Heartbeat => Ok(handle_heartbeat(ctx, peer, &envelope)),
        MessageType::Register => Ok(handle_register(ctx, peer, &envelope)),
        MessageType::Data => handle_data(ctx, node_id, &envelope),
        MessageType::Command => handle_command(ctx, node_id, &envelope),
        MessageType::Broadcast => Ok(handle_broadcast(ctx, node_id, &envelope)),
        MessageType::Unregister | MessageType::Response | MessageType::Unknown(_) => {
            warn!("Unknown message type from {}: {}", node_id, envelope.message_type);
            return ctx.error_reply(&envelope, "Unknown message type");
        }
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            error!("Error handling message {} from {}: {}", envelope.message_id(), node_id, e);
            ctx.error_reply(&envelope, format!("Internal error: {}", e))
        }
    }
}

/// Puts a connection's node back if it was evicted while still connected.
fn ensure_registered(ctx: &ConnectionContext, peer: &Peer) {
    if ctx.manager.has_node(&peer.node_id) {
        return;
    }
    debug!("Node {} was evicted while connected, registering again", peer.node_id);
    ctx.manager.register_node(peer.entry());
}

fn handle_heartbeat(ctx: &ConnectionContext, peer: &Peer, envelope: &Envelope) -> Envelope {
    ensure_registered(ctx, peer);
    ctx.manager.update_heartbeat(&peer.node_id);
    debug!("Heartbeat from {} processed", peer.node_id);

    ctx.reply(envelope, "Heartbeat received")
        .with_attribute(attr::TIMESTAMP, current_millis())
}

fn handle_register(ctx: &ConnectionContext, peer: &Peer, envelope: &Envelope) -> Envelope {
    let node_id = peer.node_id.as_str();
    ensure_registered(ctx, peer);
    ctx.manager.update_node(node_id, |node| {
        if let Some(name) = &envelope.content {
            node.name = name.clone();
        }
        for (key, value) in &envelope.attributes {
            node.add_metadata(key.clone(), value.clone());
        }
        node.refresh_heartbeat(tokio::time::Instant::now());
    });
    info!("Client {} registered successfully", node_id);

    ctx.reply(envelope, "Registration successful")
        .with_attribute(attr::NODE_ID, node_id)
}

fn handle_data(ctx: &ConnectionContext, node_id: &str, envelope: &Envelope) -> Result<Envelope> {
    let ack = ctx.data_handler.on_data(node_id, envelope)?;

    Ok(ctx
        .reply(envelope, ack)
        .with_attribute(attr::RECEIVED_AT, current_millis()))
}

fn handle_command(ctx: &ConnectionContext, node_id: &str, envelope: &Envelope) -> Result<Envelope> {
    let command = envelope.content.as_deref().unwrap_or("").trim();
    info!("Received command from {}: {}", node_id, command);

    let content = match command.to_lowercase().as_str() {
        "status" => {
            let status = serde_json::to_string(&ctx.manager.cluster_status())
                .map_err(ClusterError::from)?;
            format!("Cluster status: {}", status)
        }
        "nodes" => format!("Online nodes: {}", ctx.manager.online_node_count()),
        _ => format!("Unknown command: {}", command),
    };

    Ok(ctx.reply(envelope, content))
}

fn handle_broadcast(ctx: &ConnectionContext, node_id: &str, envelope: &Envelope) -> Envelope {
    info!(
        "Received broadcast from {}: {}",
        node_id,
        envelope.content.as_deref().unwrap_or("")
    );
    let delivered = ctx.manager.broadcast_message(envelope.clone());

    ctx.reply(envelope, "Broadcast sent")
        .with_attribute("recipients", delivered)
}
