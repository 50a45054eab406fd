//! Mutually authenticated TLS transport
//!
//! Produces encrypted stream connections between exactly two processes.
//! The dialer retries forever; the listener accepts forever. Both verify
//! the peer against the configured CA pool, and the listener can
//! additionally pin the client certificate's subject organization.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::error::{NetworkError, NetworkResult};

/// Backoff between failed connect/accept attempts
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// TCP keepalive idle time; dead peers are detected by the OS,
/// not by an application-level heartbeat
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// TCP keepalive probe interval
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Certificate material loaded once at startup
pub struct TlsMaterial {
    /// Local certificate chain
    pub certs: Vec<CertificateDer<'static>>,

    /// Local private key
    pub key: PrivateKeyDer<'static>,

    /// CA pool the peer is verified against
    pub roots: RootCertStore,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
            roots: self.roots.clone(),
        }
    }
}

impl TlsMaterial {
    /// Load certificate, key, and CA certificate from PEM files
    pub fn load(cert_path: &str, key_path: &str, ca_cert_path: &str) -> NetworkResult<Self> {
        let certs = read_pem(cert_path)?;
        let key = read_key(key_path)?;
        let ca_certs = read_pem(ca_cert_path)?;

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| NetworkError::Certificate(format!("bad CA certificate in {}: {}", ca_cert_path, e)))?;
        }
        if roots.is_empty() {
            return Err(NetworkError::Certificate(format!(
                "no CA certificate found in {}",
                ca_cert_path
            )));
        }

        Ok(Self { certs, key, roots })
    }

    /// Build material from in-memory PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str, ca_cert_pem: &str) -> NetworkResult<Self> {
        let certs = parse_pem_certs(&mut cert_pem.as_bytes())?;
        let key = parse_pem_key(&mut key_pem.as_bytes())?;

        let mut roots = RootCertStore::empty();
        for cert in parse_pem_certs(&mut ca_cert_pem.as_bytes())? {
            roots
                .add(cert)
                .map_err(|e| NetworkError::Certificate(format!("bad CA certificate: {}", e)))?;
        }

        Ok(Self { certs, key, roots })
    }
}

fn read_pem(path: &str) -> NetworkResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| NetworkError::Certificate(format!("cannot open {}: {}", path, e)))?;
    let certs = parse_pem_certs(&mut std::io::BufReader::new(file))?;
    if certs.is_empty() {
        return Err(NetworkError::Certificate(format!(
            "no certificate found in {}",
            path
        )));
    }
    Ok(certs)
}

fn read_key(path: &str) -> NetworkResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| NetworkError::Certificate(format!("cannot open {}: {}", path, e)))?;
    parse_pem_key(&mut std::io::BufReader::new(file))
}

fn parse_pem_certs(reader: &mut dyn BufRead) -> NetworkResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::Certificate(format!("failed to parse certificate: {}", e)))
}

fn parse_pem_key(reader: &mut dyn BufRead) -> NetworkResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| NetworkError::Certificate(format!("failed to parse key: {}", e)))?
        .ok_or_else(|| NetworkError::Certificate("no private key found".into()))
}

/// Client-role connection factory: retries a TLS connect until one succeeds
pub struct Dialer {
    address: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl Dialer {
    /// Build a dialer presenting the local certificate and verifying the
    /// server against the CA pool
    pub fn new(address: &str, material: TlsMaterial) -> NetworkResult<Self> {
        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| NetworkError::Tls(format!("invalid server name {:?}: {}", host, e)))?;

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(material.roots)
            .with_client_auth_cert(material.certs, material.key)
            .map_err(|e| NetworkError::Tls(format!("client TLS config: {}", e)))?;

        Ok(Self {
            address: address.to_string(),
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Block until a connection is established. This is the client's
    /// reconnect mechanism: it never gives up.
    pub async fn get_conn(&self) -> client::TlsStream<TcpStream> {
        loop {
            match self.try_connect().await {
                Ok(stream) => return stream,
                Err(e) => {
                    debug!("connect to {} failed: {}", self.address, e);
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> NetworkResult<client::TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(&self.address).await?;
        set_keepalive(&tcp)?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        Ok(stream)
    }
}

/// Server-role connection factory: requires and verifies client certificates
pub struct Listener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    required_organization: Option<String>,
}

impl Listener {
    /// Bind the listening socket. Bind failure is fatal to startup.
    pub async fn bind(
        address: &str,
        material: TlsMaterial,
        required_organization: Option<String>,
    ) -> NetworkResult<Self> {
        let verifier = WebPkiClientVerifier::builder(Arc::new(material.roots))
            .build()
            .map_err(|e| NetworkError::Tls(format!("client verifier: {}", e)))?;

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(material.certs, material.key)
            .map_err(|e| NetworkError::Tls(format!("server TLS config: {}", e)))?;

        let listener = TcpListener::bind(address).await?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            required_organization,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> NetworkResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until a fully authenticated connection arrives, retrying
    /// past transient accept and handshake failures
    pub async fn get_conn(&self) -> server::TlsStream<TcpStream> {
        loop {
            match self.accept_one().await {
                Ok(stream) => return stream,
                // Load-balancer probes connect and hang up without
                // negotiating TLS; don't let them flood the log.
                Err(NetworkError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("accept failed: {}", e);
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn accept_one(&self) -> NetworkResult<server::TlsStream<TcpStream>> {
        let (tcp, peer) = self.listener.accept().await?;
        set_keepalive(&tcp)?;

        let stream = self.acceptor.accept(tcp).await?;

        if let Some(required) = &self.required_organization {
            let (_, conn) = stream.get_ref();
            let actual = client_organization(conn)?;
            if actual.as_deref() != Some(required.as_str()) {
                return Err(NetworkError::OrganizationMismatch {
                    expected: required.clone(),
                    actual: actual.unwrap_or_default(),
                });
            }
        }

        debug!("accepted connection from {}", peer);
        Ok(stream)
    }
}

/// Extract the subject organization from the verified client leaf certificate
fn client_organization(conn: &rustls::ServerConnection) -> NetworkResult<Option<String>> {
    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| NetworkError::Certificate("no client certificate presented".into()))?;

    leaf_organization(leaf.as_ref())
}

/// Parse a DER certificate and return its subject organization, if any
pub fn leaf_organization(cert_der: &[u8]) -> NetworkResult<Option<String>> {
    let (_, parsed) = X509Certificate::from_der(cert_der)
        .map_err(|e| NetworkError::Certificate(format!("failed to parse certificate: {}", e)))?;

    let org = parsed
        .subject()
        .iter_organization()
        .next()
        .and_then(|org| org.as_str().ok())
        .map(|org| org.to_string());
    Ok(org)
}

fn set_keepalive(tcp: &TcpStream) -> NetworkResult<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(tcp).set_tcp_keepalive(&keepalive)?;
    Ok(())
}
