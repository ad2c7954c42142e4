use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Frame too large: {len} bytes (max {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Client not connected")]
    NotConnected,

    #[error("Client disconnected")]
    Disconnected,

    #[error("Request {0} is already pending")]
    DuplicateRequest(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<std::net::AddrParseError> for ClusterError {
    fn from(err: std::net::AddrParseError) -> Self {
        ClusterError::InvalidConfig(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ClusterError {
    fn from(err: tokio::task::JoinError) -> Self {
        ClusterError::Shutdown(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
