//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or negotiation error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate loading or parsing error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Client certificate organization mismatch
    #[error("client organization {actual:?} does not match required {expected:?}")]
    OrganizationMismatch { expected: String, actual: String },

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),

    /// Kernel routing table error
    #[error("route error: {0}")]
    Route(String),

    /// Malformed or oversized framed packet
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Unparseable network specification
    #[error("invalid network {0:?}: {1}")]
    InvalidNetwork(String, String),

    /// Named interface has no IPv4 address
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
