use nodemesh_cluster::{
    ClusterManager, LoadBalancerRegistry, NoopDiscovery, ServiceDiscovery, StaticDiscovery,
};
use nodemesh_common::config::ClusterConfig;
use nodemesh_common::protocol::error::{ClusterError, Result};
use nodemesh_common::transport::{EnvelopeCodec, FormatRegistry, FrameCodec};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::{handle_connection, ConnectionContext};
use crate::handler::{DataHandler, LoggingDataHandler};
use crate::routes::ConnectionRoutes;

/// How long `shutdown()` waits for open connections to clean up
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// NodeMesh TCP server.
///
/// Accepts peer connections, registers each one with the [`ClusterManager`]
/// and answers their envelopes. Configure it after [`bind`](Self::bind), then
/// call [`start`](Self::start) to get a running [`ServerHandle`].
///
/// # Example
///
/// ```no_run
/// use nodemesh_common::config::ClusterConfig;
/// use nodemesh_server::ClusterServer;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = ClusterServer::bind("0.0.0.0:9090", ClusterConfig::default()).await?;
/// let handle = server.start()?;
///
/// tokio::signal::ctrl_c().await?;
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ClusterServer {
    listener: Arc<TcpListener>,
    config: ClusterConfig,
    manager: ClusterManager,
    codec: EnvelopeCodec,
    data_handler: Arc<dyn DataHandler>,
    discovery: Arc<dyn ServiceDiscovery>,
}

impl ClusterServer {
    /// Binds the listener on `bind_addr`.
    ///
    /// Seed nodes in the configuration enable static discovery; the envelope
    /// format and balancing strategy are resolved from the built-in registries.
    pub async fn bind(bind_addr: &str, config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ClusterError::Connection(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let manager = ClusterManager::with_registry(config.clone(), &LoadBalancerRegistry::new());
        let codec = Self::codec_for(&config, &FormatRegistry::new());
        let discovery: Arc<dyn ServiceDiscovery> = if config.discovery.seed_nodes.is_empty() {
            Arc::new(NoopDiscovery)
        } else {
            Arc::new(StaticDiscovery::from_config(&config.discovery))
        };

        Ok(Self {
            listener: Arc::new(listener),
            config,
            manager,
            codec,
            data_handler: Arc::new(LoggingDataHandler),
            discovery,
        })
    }

    fn codec_for(config: &ClusterConfig, formats: &FormatRegistry) -> EnvelopeCodec {
        EnvelopeCodec::new(
            formats.get(&config.serialization.format),
            FrameCodec::with_max_frame_length(config.server.max_frame_length),
        )
    }

    /// Resolves the configured envelope format from `formats`.
    pub fn with_formats(mut self, formats: &FormatRegistry) -> Self {
        self.codec = Self::codec_for(&self.config, formats);
        self
    }

    /// Resolves the configured balancing strategy from `strategies`.
    pub fn with_strategies(mut self, strategies: &LoadBalancerRegistry) -> Self {
        self.manager = ClusterManager::with_registry(self.config.clone(), strategies);
        self
    }

    pub fn with_data_handler(mut self, handler: Arc<dyn DataHandler>) -> Self {
        self.data_handler = handler;
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ClusterError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }

    /// Starts the cluster manager and the accept loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        self.manager.start()?;

        if let Err(e) = self.discovery.register_local_node(&self.config.node) {
            warn!("Failed to register local node with discovery: {}", e);
        }
        for node in self.discovery.discover_cluster_nodes() {
            self.manager.register_node(node);
        }

        let routes = ConnectionRoutes::new();
        self.manager.attach_router(Arc::new(routes.clone()));

        let ctx = Arc::new(ConnectionContext {
            manager: self.manager.clone(),
            routes: routes.clone(),
            codec: self.codec.clone(),
            data_handler: self.data_handler.clone(),
            connection_counter: AtomicU64::new(0),
        });

        let max_connections = self.config.server.max_connections;
        let limit = Arc::new(Semaphore::new(max_connections));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_loops = (0..self.config.server.boss_threads.max(1))
            .map(|_| {
                tokio::spawn(accept_loop(
                    self.listener.clone(),
                    ctx.clone(),
                    limit.clone(),
                    max_connections,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(
            "NodeMesh server {} listening on {} ({} format)",
            self.manager.local_node_id(),
            local_addr,
            self.codec.format_name()
        );

        Ok(ServerHandle {
            local_addr,
            manager: self.manager,
            routes,
            discovery: self.discovery,
            config: self.config,
            shutdown,
            accept_loops,
            limit,
            max_connections,
        })
    }
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    ctx: Arc<ConnectionContext>,
    limit: Arc<Semaphore>,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let permit = match limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection limit of {} reached, rejecting {}",
                    max_connections, peer
                );
                drop(stream);
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx, shutdown).await;
            drop(permit);
        });
    }
}

/// A running server.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the accept loops and closes every connection, but skips the orderly
/// cluster manager shutdown.
pub struct ServerHandle {
    local_addr: SocketAddr,
    manager: ClusterManager,
    routes: ConnectionRoutes,
    discovery: Arc<dyn ServiceDiscovery>,
    config: ClusterConfig,
    shutdown: watch::Sender<bool>,
    accept_loops: Vec<JoinHandle<()>>,
    limit: Arc<Semaphore>,
    max_connections: usize,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.routes.len()
    }

    /// Stops accepting, closes every connection and stops the manager.
    ///
    /// Connections still cleaning up after [`SHUTDOWN_GRACE`] are left to
    /// finish on their own.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down NodeMesh server on {}", self.local_addr);
        let _ = self.shutdown.send(true);

        for accept_loop in self.accept_loops {
            accept_loop.await?;
        }

        let permits = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.limit.acquire_many(permits)).await {
            Ok(_) => {}
            Err(_) => warn!(
                "{} connection(s) still open after {}ms, forcing shutdown",
                self.routes.len(),
                SHUTDOWN_GRACE.as_millis()
            ),
        }

        self.manager.detach_router();
        if let Err(e) = self.discovery.deregister_local_node(&self.config.node) {
            warn!("Failed to deregister local node from discovery: {}", e);
        }
        self.manager.stop().await?;

        info!("NodeMesh server stopped");
        Ok(())
    }
}
