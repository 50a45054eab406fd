//! Core tunnel errors

use thiserror::Error;

use tether_network::NetworkError;

/// Core tunnel errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Peer spoke an incompatible protocol version
    #[error("invalid protocol version {0}")]
    ProtocolVersion(u16),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
