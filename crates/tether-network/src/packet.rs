//! Handshake wire format and IPv4 header helpers
//!
//! Hello wire format (big-endian):
//! [Version: 2 bytes][Net count: 2 bytes][Address: 4 bytes, Mask: 4 bytes]...

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};
use crate::net::Ipv4Net;

/// Handshake protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed hello header size (version + count)
pub const HELLO_HEADER_LEN: usize = 4;

/// Size of one advertised network entry (address + mask)
pub const NET_ENTRY_LEN: usize = 8;

/// The one-time hello exchanged on every connection before packet traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    /// Protocol version
    pub version: u16,

    /// Networks this node advertises as reachable
    pub networks: Vec<Ipv4Net>,
}

impl HelloMessage {
    /// Create a hello at the current protocol version
    pub fn new(networks: Vec<Ipv4Net>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            networks,
        }
    }

    /// Serialize to the wire layout
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HELLO_HEADER_LEN + self.networks.len() * NET_ENTRY_LEN);
        buf.put_u16(self.version);
        buf.put_u16(self.networks.len() as u16);
        for net in &self.networks {
            buf.put_slice(&net.addr().octets());
            buf.put_slice(&net.mask().octets());
        }
        buf.freeze()
    }

    /// Deserialize a complete hello from the wire layout
    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        if bytes.len() < HELLO_HEADER_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "hello too short: {} bytes",
                bytes.len()
            )));
        }

        let (version, count) = decode_hello_header(&bytes[..HELLO_HEADER_LEN]);
        let body = &bytes[HELLO_HEADER_LEN..];
        if body.len() != count as usize * NET_ENTRY_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "hello advertises {} networks but carries {} bytes",
                count,
                body.len()
            )));
        }

        Ok(Self {
            version,
            networks: decode_networks(body)?,
        })
    }
}

/// Decode the fixed hello header, returning (version, network count)
pub fn decode_hello_header(header: &[u8]) -> (u16, u16) {
    let version = u16::from_be_bytes([header[0], header[1]]);
    let count = u16::from_be_bytes([header[2], header[3]]);
    (version, count)
}

/// Decode a run of address/mask pairs
pub fn decode_networks(body: &[u8]) -> NetworkResult<Vec<Ipv4Net>> {
    if body.len() % NET_ENTRY_LEN != 0 {
        return Err(NetworkError::InvalidPacket(format!(
            "network list length {} is not a multiple of {}",
            body.len(),
            NET_ENTRY_LEN
        )));
    }

    Ok(body
        .chunks_exact(NET_ENTRY_LEN)
        .map(|entry| {
            let addr = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let mask = Ipv4Addr::new(entry[4], entry[5], entry[6], entry[7]);
            Ipv4Net::new(addr, mask)
        })
        .collect())
}

/// IPv4 header accessors for raw packets
pub mod ip {
    use std::net::Ipv4Addr;

    /// Minimum IPv4 header size
    pub const MIN_HEADER_LEN: usize = 20;

    /// Maximum IP datagram size
    pub const MAX_PACKET_LEN: usize = 65535;

    /// Check the version nibble for IPv4
    pub fn is_ipv4(packet: &[u8]) -> bool {
        !packet.is_empty() && packet[0] >> 4 == 4
    }

    /// Total length field (bytes 2-3)
    pub fn total_length(packet: &[u8]) -> Option<u16> {
        if packet.len() < MIN_HEADER_LEN {
            return None;
        }
        Some(u16::from_be_bytes([packet[2], packet[3]]))
    }

    /// Transport protocol number (byte 9)
    pub fn protocol(packet: &[u8]) -> Option<u8> {
        if packet.len() < MIN_HEADER_LEN {
            return None;
        }
        Some(packet[9])
    }

    /// Source address (bytes 12-15)
    pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < MIN_HEADER_LEN {
            return None;
        }
        Some(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        ))
    }

    /// Destination address (bytes 16-19)
    pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < MIN_HEADER_LEN {
            return None;
        }
        Some(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))
    }
}
