use nodemesh_common::config::ClusterConfig;
use nodemesh_common::protocol::error::{ClusterError, Result};
use nodemesh_common::transport::{
    self, map_io_error, EnvelopeCodec, FormatRegistry, FrameCodec, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_FORMAT, DEFAULT_MAX_FRAME_LENGTH,
};
use nodemesh_common::{attr, current_millis, Envelope, MessageType, NodeId};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::pending::{PendingRequests, PendingResponse};

/// Version reported in the REGISTER envelope
pub const CLIENT_VERSION: &str = "1.0.0";

/// Buffered server-pushed envelopes per subscriber
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    /// Envelope format, must match the server's
    pub format: String,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            format: DEFAULT_FORMAT.to_string(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl From<&ClusterConfig> for ClientConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: config.discovery.heartbeat_interval(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            format: config.serialization.format.clone(),
            max_frame_length: config.server.max_frame_length,
        }
    }
}

/// NodeMesh client
///
/// Holds one long-lived connection to a server. Every request is answered by
/// a RESPONSE carrying the request's id, so any number of requests can be in
/// flight at once. The client heartbeats the server while connected, and
/// losing the connection fails everything still waiting.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: NodeId,
    started_at: u64,
    config: ClientConfig,
    codec: EnvelopeCodec,
    pending: PendingRequests,
    connected: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    assigned_node_id: RwLock<Option<NodeId>>,
    pushed: broadcast::Sender<Envelope>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_formats(config, &FormatRegistry::new())
    }

    /// Creates a client resolving its envelope format from `formats`.
    pub fn with_formats(config: ClientConfig, formats: &FormatRegistry) -> Self {
        let codec = EnvelopeCodec::new(
            formats.get(&config.format),
            FrameCodec::with_max_frame_length(config.max_frame_length),
        );
        let (pushed, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ClientInner {
                client_id: format!("client-{}", uuid::Uuid::new_v4()),
                started_at: current_millis(),
                config,
                codec,
                pending: PendingRequests::new(),
                connected: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(None),
                assigned_node_id: RwLock::new(None),
                pushed,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connects to `addr` and registers with the server.
    ///
    /// Does nothing if already connected.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        let stream = transport::connect(addr, self.inner.config.connect_timeout)
            .await
            .inspect_err(|e| error!("Failed to connect to {}: {}", addr, e))?;
        let (reader, writer) = stream.into_split();

        self.inner.abort_tasks();
        *self.inner.writer.lock().await = Some(writer);
        self.inner.set_assigned_node_id(None);
        self.inner.pending.reopen();
        self.inner.connected.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        let reader_task = tokio::spawn(read_loop(weak.clone(), reader, self.inner.codec.clone()));
        let heartbeat_task =
            tokio::spawn(heartbeat_loop(weak, self.inner.config.heartbeat_interval));
        self.inner.lock_tasks().extend([reader_task, heartbeat_task]);

        info!("Connected to server at {}", addr);

        let registration = Envelope::with_content(MessageType::Register, self.client_id())
            .with_source(self.client_id())
            .with_attribute(attr::VERSION, CLIENT_VERSION)
            .with_attribute(attr::START_TIME, self.inner.started_at);
        let response = self.send_message(registration).await?;

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            match response.await {
                Ok(reply) => {
                    info!(
                        "Successfully registered with server: {}",
                        reply.content.as_deref().unwrap_or_default()
                    );
                    if let Some(inner) = inner.upgrade() {
                        inner.learn_node_id(&reply);
                    }
                }
                Err(e) => warn!("Registration failed: {}", e),
            }
        });

        Ok(())
    }

    /// Sends an envelope and returns the future of its response.
    ///
    /// Fails with [`ClusterError::NotConnected`] without touching the socket
    /// when there is no connection.
    pub async fn send_message(&self, envelope: Envelope) -> Result<PendingResponse> {
        if !self.is_connected() {
            return Err(ClusterError::NotConnected);
        }

        let message_id = envelope.message_id().to_string();
        let response = self.inner.pending.register(&message_id)?;

        if let Err(e) = self.inner.write(&envelope).await {
            self.inner.pending.remove(&message_id);
            return Err(e);
        }

        debug!("Sent {} envelope {}", envelope.message_type, message_id);
        Ok(response)
    }

    /// Sends an envelope and waits for its response.
    pub async fn request(&self, envelope: Envelope) -> Result<Envelope> {
        self.send_message(envelope).await?.await
    }

    /// Like [`request`](Self::request), giving up after `timeout`.
    ///
    /// A timeout forgets the request but leaves the connection open.
    pub async fn request_with_timeout(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope> {
        let response = self.send_message(envelope).await?;
        let message_id = response.message_id().to_string();

        match tokio::time::timeout(timeout, response).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.pending.remove(&message_id);
                Err(ClusterError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    pub async fn send_heartbeat(&self) -> Result<PendingResponse> {
        self.send_message(self.envelope(MessageType::Heartbeat, "Heartbeat"))
            .await
    }

    pub async fn send_data(&self, data: impl Into<String>) -> Result<PendingResponse> {
        self.send_message(self.envelope(MessageType::Data, data))
            .await
    }

    /// Sends a COMMAND such as `status` or `nodes`.
    pub async fn send_command(&self, command: impl Into<String>) -> Result<PendingResponse> {
        self.send_message(self.envelope(MessageType::Command, command))
            .await
    }

    /// Asks the server to forward `content` to every online peer.
    pub async fn send_broadcast(&self, content: impl Into<String>) -> Result<PendingResponse> {
        self.send_message(self.envelope(MessageType::Broadcast, content))
            .await
    }

    /// Receives envelopes the server pushes without a request, such as
    /// broadcasts from other peers.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.pushed.subscribe()
    }

    /// Closes the connection and fails every pending request.
    pub async fn disconnect(&self) {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        self.inner.abort_tasks();

        self.inner.close_writer().await;

        let failed = self.inner.pending.fail_all(|| ClusterError::Disconnected);
        if was_connected {
            info!("Disconnected from server ({} pending requests failed)", failed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Node id the server registered this connection under.
    pub fn assigned_node_id(&self) -> Option<NodeId> {
        self.inner
            .assigned_node_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    fn envelope(&self, message_type: MessageType, content: impl Into<String>) -> Envelope {
        Envelope::with_content(message_type, content).with_source(self.client_id())
    }
}

impl ClientInner {
    async fn write(&self, envelope: &Envelope) -> Result<()> {
        let frame = self.codec.encode(envelope)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClusterError::NotConnected)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| map_io_error(e, "writing envelope"))?;
        writer
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing envelope"))
    }

    fn dispatch(&self, envelope: Envelope) {
        if !envelope.is_response() {
            debug!("Received pushed {} envelope", envelope.message_type);
            // No subscribers is fine
            let _ = self.pushed.send(envelope);
            return;
        }

        self.learn_node_id(&envelope);
        if envelope.correlation_id().is_some() {
            self.pending.complete(envelope);
        } else {
            info!(
                "Server says: {}",
                envelope.content.as_deref().unwrap_or_default()
            );
        }
    }

    fn learn_node_id(&self, envelope: &Envelope) {
        if let Some(node_id) = envelope.attribute(attr::NODE_ID).and_then(|v| v.as_str()) {
            self.set_assigned_node_id(Some(node_id.to_string()));
        }
    }

    fn set_assigned_node_id(&self, node_id: Option<NodeId>) {
        *self
            .assigned_node_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = node_id;
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error closing connection: {}", e);
            }
        }
    }

    /// Tears down a connection the read side gave up on.
    async fn connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.close_writer().await;
        let failed = self.pending.fail_all(|| ClusterError::Disconnected);
        if failed > 0 {
            warn!("Connection lost, failed {} pending requests", failed);
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_tasks(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.abort_tasks();
        self.pending.fail_all(|| ClusterError::Disconnected);
    }
}

async fn read_loop(inner: Weak<ClientInner>, mut reader: OwnedReadHalf, codec: EnvelopeCodec) {
    loop {
        let frame = codec.read_envelope(&mut reader).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match frame {
            Ok(Some(envelope)) => inner.dispatch(envelope),
            Ok(None) => {
                info!("Server closed the connection");
                inner.connection_lost().await;
                break;
            }
            Err(e) => {
                warn!("Error reading from server: {}", e);
                inner.connection_lost().await;
                break;
            }
        }
    }
}

async fn heartbeat_loop(inner: Weak<ClientInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let client = ClusterClient { inner };
        if !client.is_connected() {
            break;
        }

        let heartbeat = client.envelope(MessageType::Heartbeat, "Heartbeat");
        match client.request_with_timeout(heartbeat, period).await {
            Ok(_) => debug!("Heartbeat acknowledged"),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(FormatRegistry::new().get("json"), FrameCodec::new())
    }

    /// Accepts one connection, sends a welcome and hands the stream back
    async fn fake_server() -> (String, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let welcome = Envelope::with_content(MessageType::Response, "Welcome")
                .with_attribute(attr::NODE_ID, "client-127.0.0.1-1-1");
            codec().write_envelope(&mut stream, &welcome).await.unwrap();
            stream
        });
        (addr, accept)
    }

    async fn next(stream: &mut TcpStream) -> Envelope {
        codec().read_envelope(stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let client = ClusterClient::new(ClientConfig::default());

        assert!(!client.is_connected());
        assert!(matches!(
            client.send_data("ping").await,
            Err(ClusterError::NotConnected)
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ClusterClient::new(ClientConfig::default());
        assert!(client.connect(&addr).await.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_registers_first() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();

        let registration = next(&mut server).await;
        assert_eq!(registration.message_type, MessageType::Register);
        assert_eq!(registration.content.as_deref(), Some(client.client_id()));
        assert_eq!(registration.attribute(attr::VERSION).unwrap(), CLIENT_VERSION);
        assert!(registration.attribute(attr::START_TIME).is_some());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_welcome_assigns_node_id() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let _server = accept.await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.assigned_node_id().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.assigned_node_id().as_deref(), Some("client-127.0.0.1-1-1"));
    }

    #[tokio::test]
    async fn test_responses_resolve_out_of_order() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();
        let _registration = next(&mut server).await;

        let first = client.send_data("one").await.unwrap();
        let second = client.send_data("two").await.unwrap();
        let first_req = next(&mut server).await;
        let second_req = next(&mut server).await;

        // Answer in reverse order
        codec()
            .write_envelope(&mut server, &Envelope::response_to(&second_req, "reply two"))
            .await
            .unwrap();
        codec()
            .write_envelope(&mut server, &Envelope::response_to(&first_req, "reply one"))
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().content.as_deref(), Some("reply one"));
        assert_eq!(second.await.unwrap().content.as_deref(), Some("reply two"));
        assert_eq!(client.pending_count(), 1); // registration is never answered
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_remote_error() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();
        let _registration = next(&mut server).await;

        let pending = client.send_command("explode").await.unwrap();
        let req = next(&mut server).await;
        codec()
            .write_envelope(&mut server, &Envelope::error_response_to(&req, "boom"))
            .await
            .unwrap();

        assert!(matches!(pending.await, Err(ClusterError::Remote(msg)) if msg == "Error: boom"));
    }

    #[tokio::test]
    async fn test_server_close_fails_pending_requests() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();
        let _registration = next(&mut server).await;

        let pending = client.send_data("never answered").await.unwrap();
        drop(server);

        let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap();
        assert!(matches!(result, Err(ClusterError::Disconnected)));
        assert!(!client.is_connected());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_frame_closes_socket() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();
        let _registration = next(&mut server).await;

        let pending = client.send_data("waiting").await.unwrap();
        let _data = next(&mut server).await;

        // Well-formed frame, undecodable payload
        FrameCodec::new()
            .write_frame(&mut server, &[0xff, 0xff, 0xff])
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap();
        assert!(matches!(result, Err(ClusterError::Disconnected)));
        assert!(!client.is_connected());

        // The server side sees the connection end
        let eof = tokio::time::timeout(Duration::from_secs(2), codec().read_envelope(&mut server))
            .await
            .unwrap();
        assert!(matches!(eof, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_resending_pending_envelope_is_rejected() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();
        let _registration = next(&mut server).await;

        let envelope = Envelope::with_content(MessageType::Data, "once");
        let first = client.send_message(envelope.clone()).await.unwrap();
        assert!(matches!(
            client.send_message(envelope.clone()).await,
            Err(ClusterError::DuplicateRequest(_))
        ));

        let req = next(&mut server).await;
        codec()
            .write_envelope(&mut server, &Envelope::response_to(&req, "answered"))
            .await
            .unwrap();
        assert_eq!(first.await.unwrap().content.as_deref(), Some("answered"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_connection() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let _server = accept.await.unwrap();

        let before = client.pending_count();
        let result = client
            .request_with_timeout(
                Envelope::with_content(MessageType::Data, "slow"),
                Duration::from_millis(50),
            )
            .await;

        assert!(matches!(result, Err(ClusterError::Timeout(50))));
        assert_eq!(client.pending_count(), before);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        client.connect(&addr).await.unwrap();
        let _server = accept.await.unwrap();

        let pending = client.send_data("waiting").await.unwrap();
        client.disconnect().await;

        assert!(matches!(pending.await, Err(ClusterError::Disconnected)));
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_data("after").await,
            Err(ClusterError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_pushed_envelopes_reach_subscribers() {
        let (addr, accept) = fake_server().await;
        let client = ClusterClient::new(ClientConfig::default());
        let mut pushed = client.subscribe();
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();

        let broadcast = Envelope::with_content(MessageType::Broadcast, "hello all")
            .with_source("client-127.0.0.1-2-2");
        codec().write_envelope(&mut server, &broadcast).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), pushed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_broadcast());
        assert_eq!(received.content.as_deref(), Some("hello all"));
    }

    #[tokio::test]
    async fn test_heartbeats_are_sent_periodically() {
        let (addr, accept) = fake_server().await;
        let config = ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let client = ClusterClient::new(config);
        client.connect(&addr).await.unwrap();
        let mut server = accept.await.unwrap();
        let _registration = next(&mut server).await;

        let heartbeat = tokio::time::timeout(Duration::from_secs(2), next(&mut server))
            .await
            .unwrap();
        assert!(heartbeat.is_heartbeat());
        assert_eq!(heartbeat.source_node_id.as_deref(), Some(client.client_id()));
    }

    #[test]
    fn test_config_from_cluster_config() {
        let mut cluster = ClusterConfig::default();
        cluster.discovery.heartbeat_interval_ms = 1500;
        cluster.serialization.format = "postcard".to_string();

        let config = ClientConfig::from(&cluster);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.format, "postcard");
        assert_eq!(config.max_frame_length, cluster.server.max_frame_length);
    }
}
