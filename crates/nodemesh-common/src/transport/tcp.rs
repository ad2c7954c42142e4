use std::io;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};

use crate::protocol::error::{ClusterError, Result};

/// Default timeout for establishing a connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to a remote node.
///
/// The address may resolve to several socket addresses; each is tried in
/// turn until one accepts. Every attempt is bounded by `timeout`.
///
/// # Errors
///
/// Returns an error if:
/// - The address cannot be resolved
/// - Connection fails to all resolved addresses
///
/// # Example
///
/// ```no_run
/// use nodemesh_common::transport::{connect, DEFAULT_CONNECT_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = connect("127.0.0.1:9090", DEFAULT_CONNECT_TIMEOUT).await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = lookup_host(addr)
        .await
        .map_err(|e| ClusterError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => {
                // Small frames dominate the traffic
                stream
                    .set_nodelay(true)
                    .map_err(|e| map_io_error(e, "setting TCP_NODELAY"))?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => {
                last_err = Some(format!("timed out after {}ms", timeout.as_millis()));
            }
        }
    }

    Err(ClusterError::Connection(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err.unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

/// Maps IO errors to cluster errors.
///
/// - Timeouts/would block -> `Timeout`
/// - Lost connections -> `Connection`
/// - Other IO errors -> `Io`
pub fn map_io_error(err: io::Error, context: &str) -> ClusterError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ClusterError::Timeout(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => {
            ClusterError::Connection(format!("{}: Connection lost", context))
        }
        _ => ClusterError::Io(err),
    }
}
