//! Session supervisor
//!
//! Wires the TUN device, forwarding table, transport, and handshake
//! together and drives the tunnel's reconnect/accept loop. Each
//! connection moves through connect -> handshake -> forwarding -> closed;
//! teardown removes the connection's forwarding entries and kernel routes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{info, warn};

use tether_network::{routes, Dialer, Listener, PacketRead, PacketStream, PacketWrite, Tun};

use crate::config::{Config, Mode};
use crate::error::CoreResult;
use crate::handshake;
use crate::router::ForwardingTable;

/// Delay between client reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The top-level tunnel control loop
pub struct Engine {
    config: Config,
    table: Arc<ForwardingTable>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl Engine {
    /// Create an engine around a validated configuration
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: Arc::new(ForwardingTable::new()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// Run the tunnel until `stop` is called.
    ///
    /// Creates the TUN device (fatal on failure), registers it in the
    /// forwarding table for the locally advertised networks, starts the
    /// permanent TUN forwarder task, then enters the role-specific
    /// connection loop.
    pub async fn run(self: &Arc<Self>) -> CoreResult<()> {
        let tun = Arc::new(Tun::create(&self.config.interface)?);

        self.table
            .add_networks(&self.config.advertise_cidrs, tun.clone())
            .await;

        // Local-origin traffic: a single permanent reader for the device.
        let engine = Arc::clone(self);
        let tun_reader = tun.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.forward_loop(tun_reader).await {
                warn!("TUN forwarder stopped: {}", e);
            }
        });

        info!(
            "starting tunnel in {} mode, advertising {} networks",
            self.config.mode,
            self.config.advertise_cidrs.len()
        );

        match self.config.mode {
            Mode::Server => self.run_server().await,
            Mode::Client => self.run_client().await,
        }
    }

    /// Request shutdown. All accept, dial, and forwarding loops observe
    /// the notification and unwind; the TUN device closes once the last
    /// loop releases it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Accept loop: any number of simultaneous peers, one task each
    async fn run_server(self: &Arc<Self>) -> CoreResult<()> {
        let listener = Listener::bind(
            &self.config.address,
            self.config.tls.clone(),
            self.config.client_organization.clone(),
        )
        .await?;
        info!("listening on {}", self.config.address);

        loop {
            if self.is_shutdown() {
                return Ok(());
            }
            tokio::select! {
                conn = listener.get_conn() => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_conn(conn).await {
                            warn!("connection closed: {}", e);
                        }
                    });
                }
                _ = self.shutdown_notify.notified() => return Ok(()),
            }
        }
    }

    /// Dial loop: exactly one active peer connection at a time, redialed
    /// serially after the previous one drops
    async fn run_client(self: &Arc<Self>) -> CoreResult<()> {
        let dialer = Dialer::new(&self.config.address, self.config.tls.clone())?;

        loop {
            if self.is_shutdown() {
                return Ok(());
            }
            tokio::select! {
                conn = dialer.get_conn() => {
                    info!("connected to {}", self.config.address);
                    if let Err(e) = self.handle_conn(conn).await {
                        warn!("connection closed: {}", e);
                    }
                }
                _ = self.shutdown_notify.notified() => return Ok(()),
            }
            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = self.shutdown_notify.notified() => return Ok(()),
            }
        }
    }

    /// Per-connection state machine.
    ///
    /// A handshake failure leaves the forwarding table and kernel routes
    /// untouched; a route-add failure unwinds the table entries just
    /// registered; after that, any read/write error tears the whole
    /// connection state down.
    async fn handle_conn<S>(&self, mut stream: S) -> CoreResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer_networks =
            handshake::exchange(&mut stream, &self.config.advertise_cidrs).await?;
        info!(
            "handshake complete, peer advertised {} networks",
            peer_networks.len()
        );

        let conn = Arc::new(PacketStream::new(stream));
        let writer: Arc<dyn PacketWrite> = conn.clone();

        self.table.add_networks(&peer_networks, writer.clone()).await;

        if let Err(e) = routes::add_routes(&peer_networks, &self.config.interface) {
            self.table.remove_writer(&writer).await;
            return Err(e.into());
        }

        let result = self.forward_loop(conn).await;

        self.table.remove_writer(&writer).await;
        routes::remove_routes(&peer_networks, &self.config.interface);

        result
    }

    /// Read packets and dispatch them through the forwarding table until
    /// the reader errors or the engine shuts down
    async fn forward_loop<R>(&self, reader: Arc<R>) -> CoreResult<()>
    where
        R: PacketRead + ?Sized,
    {
        loop {
            tokio::select! {
                packet = reader.read_packet() => {
                    let packet = packet?;
                    self.table.dispatch(&packet).await;
                }
                _ = self.shutdown_notify.notified() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use rcgen::{
        BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    };
    use tokio::io::AsyncWriteExt;

    use tether_network::{Ipv4Net, TlsMaterial};

    /// Mint a throwaway CA plus server/client leaf material
    fn test_pki(client_org: Option<&str>) -> (TlsMaterial, TlsMaterial) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tether test ca");
        let ca_pem = ca_params.self_signed(&ca_key).unwrap().pem();
        let issuer = Issuer::from_ca_cert_pem(&ca_pem, &ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();
        let server =
            TlsMaterial::from_pem(&server_cert.pem(), &server_key.serialize_pem(), &ca_pem)
                .unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params =
            CertificateParams::new(vec!["client.tether.test".to_string()]).unwrap();
        if let Some(org) = client_org {
            client_params
                .distinguished_name
                .push(DnType::OrganizationName, org);
        }
        let client_cert = client_params.signed_by(&client_key, &issuer).unwrap();
        let client =
            TlsMaterial::from_pem(&client_cert.pem(), &client_key.serialize_pem(), &ca_pem)
                .unwrap();

        (server, client)
    }

    fn test_config(
        mode: Mode,
        address: String,
        tls: TlsMaterial,
        advertise_cidrs: Vec<Ipv4Net>,
    ) -> Config {
        Config {
            mode,
            address,
            interface: "tether-test0".into(),
            client_organization: None,
            advertise_cidrs,
            tls,
        }
    }

    #[tokio::test]
    async fn test_server_serves_two_clients_concurrently() {
        let (server_material, client_material) = test_pki(None);

        let listener = Listener::bind("127.0.0.1:0", server_material.clone(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server_nets: Vec<Ipv4Net> = vec!["10.250.0.0/24".parse().unwrap()];
        let engine = Engine::new(test_config(
            Mode::Server,
            addr.clone(),
            server_material,
            server_nets.clone(),
        ));

        // Accept loop in the shape of run_server, minus the TUN device.
        let accept_engine = engine.clone();
        tokio::spawn(async move {
            loop {
                let conn = listener.get_conn().await;
                let engine = accept_engine.clone();
                tokio::spawn(async move {
                    let _ = engine.handle_conn(conn).await;
                });
            }
        });

        let dialer_a = Dialer::new(&addr, client_material.clone()).unwrap();
        let dialer_b = Dialer::new(&addr, client_material.clone()).unwrap();

        // Both clients handshake at the same time; neither blocks the other.
        let (mut conn_a, mut conn_b) = tokio::join!(dialer_a.get_conn(), dialer_b.get_conn());
        let (nets_a, nets_b) = tokio::join!(
            handshake::exchange(&mut conn_a, &[]),
            handshake::exchange(&mut conn_b, &[]),
        );
        assert_eq!(nets_a.unwrap(), server_nets);
        assert_eq!(nets_b.unwrap(), server_nets);

        // Both connections are in the forwarding state: the server keeps
        // reading framed packets from each without closing.
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&20u16.to_be_bytes());
        conn_a.write_all(&packet).await.unwrap();
        conn_b.write_all(&packet).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        conn_a.write_all(&packet).await.unwrap();
        conn_b.write_all(&packet).await.unwrap();

        engine.stop();
    }

    #[tokio::test]
    async fn test_client_redials_serially_after_drop() {
        let (server_material, client_material) = test_pki(None);

        let listener = Listener::bind("127.0.0.1:0", server_material, None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // A server that completes the handshake and immediately hangs up.
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let mut conn = listener.get_conn().await;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = handshake::exchange(&mut conn, &[]).await;
            }
        });

        let engine = Engine::new(test_config(
            Mode::Client,
            addr,
            client_material,
            Vec::new(),
        ));
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_client().await })
        };

        sleep(Duration::from_millis(2500)).await;
        let dials = accepted.load(Ordering::SeqCst);
        assert!(dials >= 2, "expected a redial after teardown, saw {}", dials);
        assert!(dials <= 4, "client is redialing without delay: {}", dials);

        engine.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_table_untouched() {
        let (server_material, client_material) = test_pki(None);

        let listener = Listener::bind("127.0.0.1:0", server_material.clone(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let engine = Engine::new(test_config(
            Mode::Server,
            addr.clone(),
            server_material,
            Vec::new(),
        ));

        let server_engine = engine.clone();
        let server = tokio::spawn(async move {
            let conn = listener.get_conn().await;
            server_engine.handle_conn(conn).await
        });

        // Speak version 2 at the server.
        let dialer = Dialer::new(&addr, client_material).unwrap();
        let mut conn = dialer.get_conn().await;
        conn.write_all(&[0u8, 2, 0, 0]).await.unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::error::CoreError::ProtocolVersion(2)));
        assert!(engine.table.is_empty().await);
    }

    #[tokio::test]
    async fn test_organization_pinning_rejects_wrong_org() {
        let (server_material, client_material) = test_pki(Some("field-ops"));

        let listener = Listener::bind(
            "127.0.0.1:0",
            server_material,
            Some("cluster-admins".to_string()),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // The listener never yields this connection; the client's
        // handshake dies instead of completing.
        tokio::spawn(async move {
            let _conn = listener.get_conn().await;
            panic!("connection with wrong organization was accepted");
        });

        let dialer = Dialer::new(&addr, client_material).unwrap();
        let mut conn = dialer.get_conn().await;
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            handshake::exchange(&mut conn, &[]),
        )
        .await;

        match result {
            Ok(Err(_)) => {}
            Ok(Ok(_)) => panic!("handshake succeeded against a pinned listener"),
            Err(_elapsed) => panic!("pinned listener neither rejected nor closed"),
        }
    }

    #[tokio::test]
    async fn test_organization_pinning_accepts_matching_org() {
        let (server_material, client_material) = test_pki(Some("cluster-admins"));

        let listener = Listener::bind(
            "127.0.0.1:0",
            server_material,
            Some("cluster-admins".to_string()),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.get_conn().await;
            handshake::exchange(&mut conn, &[]).await
        });

        let dialer = Dialer::new(&addr, client_material).unwrap();
        let mut conn = dialer.get_conn().await;
        handshake::exchange(&mut conn, &[]).await.unwrap();

        server.await.unwrap().unwrap();
    }
}
