//! TUN device adapter
//!
//! Creates a virtual point-to-point interface and exposes it through the
//! `PacketRead`/`PacketWrite` traits, making the device interchangeable
//! with a framed peer connection from the forwarding table's point of view.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::Tun;
