//! Tether core protocol
//!
//! Implements the tunnel's control logic:
//! - Configuration loading and validation
//! - The packet forwarding table
//! - The per-connection handshake
//! - The session supervisor driving both tunnel roles

pub mod config;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod router;

pub use config::{Config, Mode};
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use router::ForwardingTable;
