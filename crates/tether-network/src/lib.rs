//! Tether network layer
//!
//! Network primitives for the tunnel:
//! - Mutually authenticated TLS transport (dialer/listener)
//! - TUN device adapter
//! - Handshake wire codec and IP-header packet framing
//! - Kernel routing table synchronization

pub mod error;
pub mod framed;
pub mod net;
pub mod packet;
pub mod routes;
pub mod tls;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use framed::{PacketRead, PacketStream, PacketWrite};
pub use net::Ipv4Net;
pub use packet::{HelloMessage, PROTOCOL_VERSION};
pub use tls::{Dialer, Listener, TlsMaterial};
#[cfg(target_os = "linux")]
pub use tun::Tun;
