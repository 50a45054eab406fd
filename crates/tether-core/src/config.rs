//! Tunnel configuration
//!
//! Loaded once at process start from a YAML file and immutable afterwards.
//! Validation failures are fatal before any connection activity.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use tether_network::{net, Ipv4Net, TlsMaterial};

use crate::error::{CoreError, CoreResult};

/// Tunnel role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Dials the server; one connection at a time
    Client,
    /// Accepts any number of concurrent clients
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// On-disk configuration file format
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    mode: Mode,
    address: String,
    interface: String,
    key_path: String,
    cert_path: String,
    ca_cert_path: String,
    #[serde(default)]
    client_organization: Option<String>,
    #[serde(default, rename = "advertiseCIDRs")]
    advertise_cidrs: Vec<String>,
    #[serde(default, rename = "extraAdvertiseCIDRs")]
    extra_advertise_cidrs: Vec<String>,
}

/// Immutable process-wide settings
pub struct Config {
    /// Tunnel role
    pub mode: Mode,

    /// Dial target (client) or listen address (server)
    pub address: String,

    /// Local virtual interface name
    pub interface: String,

    /// Required subject organization for connecting clients (server only)
    pub client_organization: Option<String>,

    /// Networks this node tells its peer it can reach
    pub advertise_cidrs: Vec<Ipv4Net>,

    /// Certificate material for the TLS transport
    pub tls: TlsMaterial,
}

impl Config {
    /// Load and resolve a configuration file
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let file: ConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> CoreResult<Self> {
        let mut advertise_cidrs = Vec::new();
        for entry in file
            .advertise_cidrs
            .iter()
            .chain(file.extra_advertise_cidrs.iter())
        {
            if entry.is_empty() {
                continue;
            }
            advertise_cidrs.push(resolve_cidr(entry)?);
        }

        let tls = TlsMaterial::load(&file.cert_path, &file.key_path, &file.ca_cert_path)?;

        Ok(Self {
            mode: file.mode,
            address: file.address,
            interface: file.interface,
            client_organization: file.client_organization.filter(|org| !org.is_empty()),
            advertise_cidrs,
            tls,
        })
    }

    /// Fail-fast validation of settings that would otherwise surface as
    /// confusing runtime errors
    pub fn validate(&self) -> CoreResult<()> {
        if self.mode == Mode::Client && self.client_organization.is_some() {
            return Err(CoreError::Config(
                "clientOrganization can't be set in client mode".into(),
            ));
        }

        if net::interface_exists(&self.interface)? {
            return Err(CoreError::Config(format!(
                "interface {:?} already exists",
                self.interface
            )));
        }

        Ok(())
    }
}

/// Resolve one advertiseCIDRs entry.
///
/// An entry may name a local interface instead of an address
/// (`eth0/24` means "this machine's eth0 address with a /24 mask"),
/// resolved against the interface's current IPv4 address at load time.
fn resolve_cidr(entry: &str) -> CoreResult<Ipv4Net> {
    let resolved;
    let mut cidr = entry;

    if !entry.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some((ifname, prefix)) = entry.split_once('/') {
            let ip = net::interface_ipv4(ifname)?;
            resolved = format!("{}/{}", ip, prefix);
            cidr = &resolved;
        }
    }

    cidr.parse()
        .map_err(|e| CoreError::Config(format!("advertiseCIDRs entry {:?}: {}", entry, e)))
}
