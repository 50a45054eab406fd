//! IPv4 network addressing
//!
//! The handshake wire format carries networks as raw address/mask pairs,
//! so `Ipv4Net` stores a mask rather than a prefix length.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{NetworkError, NetworkResult};

/// An IPv4 network expressed as base address + mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    mask: Ipv4Addr,
}

impl Ipv4Net {
    /// Create a network from an address and mask.
    ///
    /// The base address is normalized by masking, so `10.0.0.5/24`
    /// becomes `10.0.0.0/24`.
    pub fn new(addr: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let base = u32::from(addr) & u32::from(mask);
        Self {
            addr: Ipv4Addr::from(base),
            mask,
        }
    }

    /// Create a network from an address and prefix length
    pub fn from_prefix(addr: Ipv4Addr, prefix_len: u8) -> NetworkResult<Self> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidNetwork(
                format!("{}/{}", addr, prefix_len),
                "prefix length must be 0-32".into(),
            ));
        }
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        };
        Ok(Self::new(addr, Ipv4Addr::from(mask)))
    }

    /// Base address of the network
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Network mask
    pub fn mask(&self) -> Ipv4Addr {
        self.mask
    }

    /// Prefix length derived from the mask
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.mask).count_ones() as u8
    }

    /// Check if an address falls within this network
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.mask) == u32::from(self.addr)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len())
    }
}

impl FromStr for Ipv4Net {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| {
            NetworkError::InvalidNetwork(s.into(), "expected <address>/<prefix>".into())
        })?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| NetworkError::InvalidNetwork(s.into(), format!("bad address: {}", e)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| NetworkError::InvalidNetwork(s.into(), format!("bad prefix: {}", e)))?;
        Self::from_prefix(addr, prefix_len)
    }
}

/// Look up the first IPv4 address assigned to a named interface
pub fn interface_ipv4(name: &str) -> NetworkResult<Ipv4Addr> {
    let ifaces = get_if_addrs::get_if_addrs()?;
    ifaces
        .iter()
        .find_map(|iface| match &iface.addr {
            get_if_addrs::IfAddr::V4(v4) if iface.name == name => Some(v4.ip),
            _ => None,
        })
        .ok_or_else(|| NetworkError::InterfaceNotFound(name.into()))
}

/// Check whether an interface with the given name is present
pub fn interface_exists(name: &str) -> NetworkResult<bool> {
    let ifaces = get_if_addrs::get_if_addrs()?;
    Ok(ifaces.iter().any(|iface| iface.name == name))
}
