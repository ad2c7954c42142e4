//! # NodeMesh CLI Entry Point
//!
//! Runs a NodeMesh node, or talks to one as a one-shot client.
//!
//! ## Usage
//!
//! ```bash
//! # Start a node with the defaults (port 9090, json, round-robin)
//! nodemesh serve
//!
//! # Start a node from a config file, overriding a few values
//! nodemesh serve -c cluster.json -b 0.0.0.0:9191 --seed 10.0.0.2:9090
//!
//! # Send DATA and print the reply
//! nodemesh send 127.0.0.1:9090 "hello"
//!
//! # Ask for the cluster status
//! nodemesh command 127.0.0.1:9090 status
//!
//! # Broadcast to every connected peer
//! nodemesh broadcast 127.0.0.1:9090 "maintenance at noon"
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use nodemesh_client::{ClientConfig, ClusterClient};
use nodemesh_common::config::ClusterConfig;
use nodemesh_common::{Envelope, MessageType};
use nodemesh_server::ClusterServer;
use std::time::Duration;

#[derive(FromArgs)]
/// NodeMesh - peer membership and message dispatch
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Send(SendArgs),
    Command(CommandArgs),
    Broadcast(BroadcastArgs),
}

/// Arguments for running a node.
///
/// Values come from the config file when one is given, otherwise from the
/// defaults; any flag passed here wins over both.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a NodeMesh node
struct ServeArgs {
    /// path to a JSON cluster configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// address to listen on (defaults to 0.0.0.0 and the configured port)
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// id of this node
    #[argh(option, long = "node-id")]
    node_id: Option<String>,

    /// peer to register at startup, as host:port (repeatable)
    #[argh(option, long = "seed")]
    seeds: Vec<String>,

    /// envelope format: json or postcard
    #[argh(option, short = 'f')]
    format: Option<String>,

    /// load balancing strategy: round-robin, random or least-connections
    #[argh(option, short = 's')]
    strategy: Option<String>,

    /// number of tokio worker threads
    #[argh(option, long = "worker-threads")]
    worker_threads: Option<usize>,

    /// maximum number of open connections
    #[argh(option, long = "max-connections")]
    max_connections: Option<usize>,

    /// heartbeat interval in milliseconds
    #[argh(option, long = "heartbeat-interval")]
    heartbeat_interval_ms: Option<u64>,

    /// heartbeat timeout in milliseconds
    #[argh(option, long = "heartbeat-timeout")]
    heartbeat_timeout_ms: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "send")]
/// send DATA to a node and print the reply
struct SendArgs {
    /// node address, as host:port
    #[argh(positional)]
    server_address: String,

    /// payload to send
    #[argh(positional)]
    data: String,

    /// envelope format the node uses
    #[argh(option, short = 'f', default = "\"json\".into()")]
    format: String,

    /// reply timeout in milliseconds
    #[argh(option, short = 't', long = "timeout", default = "5000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "command")]
/// run a COMMAND (status, nodes) on a node and print the reply
struct CommandArgs {
    /// node address, as host:port
    #[argh(positional)]
    server_address: String,

    /// command to run
    #[argh(positional)]
    command: String,

    /// envelope format the node uses
    #[argh(option, short = 'f', default = "\"json\".into()")]
    format: String,

    /// reply timeout in milliseconds
    #[argh(option, short = 't', long = "timeout", default = "5000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "broadcast")]
/// broadcast a message to every peer of a node
struct BroadcastArgs {
    /// node address, as host:port
    #[argh(positional)]
    server_address: String,

    /// message to broadcast
    #[argh(positional)]
    message: String,

    /// envelope format the node uses
    #[argh(option, short = 'f', default = "\"json\".into()")]
    format: String,

    /// reply timeout in milliseconds
    #[argh(option, short = 't', long = "timeout", default = "5000")]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::Serve(args) => {
            init_tracing();
            let config = load_config(&args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.server.worker_threads)
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(run_serve(args.bind, config))
        }
        // One-shot commands keep stdout clean for piping
        Commands::Send(args) => run_once(
            &args.server_address,
            &args.format,
            args.timeout_ms,
            Envelope::with_content(MessageType::Data, args.data),
        ),
        Commands::Command(args) => run_once(
            &args.server_address,
            &args.format,
            args.timeout_ms,
            Envelope::with_content(MessageType::Command, args.command),
        ),
        Commands::Broadcast(args) => run_once(
            &args.server_address,
            &args.format,
            args.timeout_ms,
            Envelope::with_content(MessageType::Broadcast, args.message),
        ),
    }
}

fn init_tracing() {
    // RUST_LOG overrides the default level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Builds the node configuration: file or defaults, then flag overrides.
fn load_config(args: &ServeArgs) -> Result<ClusterConfig> {
    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => ClusterConfig::default(),
    };

    if let Some(node_id) = &args.node_id {
        config.node.id = node_id.clone();
    }
    if !args.seeds.is_empty() {
        config.discovery.seed_nodes = args.seeds.clone();
    }
    if let Some(format) = &args.format {
        config.serialization.format = format.clone();
    }
    if let Some(strategy) = &args.strategy {
        config.load_balancer.strategy = strategy.clone();
    }
    if let Some(worker_threads) = args.worker_threads {
        config.server.worker_threads = worker_threads;
    }
    if let Some(max_connections) = args.max_connections {
        config.server.max_connections = max_connections;
    }
    if let Some(interval) = args.heartbeat_interval_ms {
        config.discovery.heartbeat_interval_ms = interval;
    }
    if let Some(timeout) = args.heartbeat_timeout_ms {
        config.discovery.heartbeat_timeout_ms = timeout;
    }

    config.validate()?;
    Ok(config)
}

async fn run_serve(bind: Option<String>, config: ClusterConfig) -> Result<()> {
    let bind = bind.unwrap_or_else(|| format!("0.0.0.0:{}", config.server.port));
    tracing::info!("Starting NodeMesh node {}", config.node.display_name());
    tracing::info!("Binding to: {}", bind);

    let handle = ClusterServer::bind(&bind, config).await?.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Received ctrl-c, shutting down");

    handle.shutdown().await?;
    Ok(())
}

fn run_once(server_address: &str, format: &str, timeout_ms: u64, envelope: Envelope) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let config = ClientConfig {
            format: format.to_string(),
            ..ClientConfig::default()
        };
        let client = ClusterClient::new(config);
        client
            .connect(server_address)
            .await
            .with_context(|| format!("Failed to connect to {}", server_address))?;

        let envelope = envelope.with_source(client.client_id());
        let reply = client
            .request_with_timeout(envelope, Duration::from_millis(timeout_ms))
            .await;
        client.disconnect().await;

        println!("{}", reply?.content.unwrap_or_default());
        Ok::<(), anyhow::Error>(())
    })
}
