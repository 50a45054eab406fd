//! Packet forwarding table
//!
//! The single source of truth for "where does a packet for this
//! destination go". Entries are matched in insertion order: the first
//! entry whose network contains the destination wins. This is deliberate
//! add-order routing, not longest-prefix matching.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use tether_network::packet::ip;
use tether_network::{Ipv4Net, PacketWrite};

struct Entry {
    network: Ipv4Net,
    writer: Arc<dyn PacketWrite>,
}

/// Thread-safe mapping from destination network to the writer
/// responsible for it
#[derive(Default)]
pub struct ForwardingTable {
    entries: Mutex<Vec<Entry>>,
}

impl ForwardingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry per network, bound to the given writer.
    ///
    /// Called for the local TUN device at startup and for each peer
    /// connection after its handshake completes.
    pub async fn add_networks(&self, networks: &[Ipv4Net], writer: Arc<dyn PacketWrite>) {
        let mut entries = self.entries.lock().await;
        for net in networks {
            debug!("forwarding table: add {}", net);
            entries.push(Entry {
                network: *net,
                writer: writer.clone(),
            });
        }
    }

    /// Remove every entry bound to the given writer, preserving the
    /// relative order of the remaining entries
    pub async fn remove_writer(&self, writer: &Arc<dyn PacketWrite>) {
        let mut entries = self.entries.lock().await;
        entries.retain(|entry| {
            let keep = !Arc::ptr_eq(&entry.writer, writer);
            if !keep {
                debug!("forwarding table: remove {}", entry.network);
            }
            keep
        });
    }

    /// Route one packet to the first matching entry's writer.
    ///
    /// Packets with no matching entry are dropped with a diagnostic log
    /// line; a failing target writer is likewise only logged, since its
    /// own connection will observe the error and tear itself down.
    pub async fn dispatch(&self, packet: &[u8]) {
        if !ip::is_ipv4(packet) {
            trace!("dropping non-IPv4 packet ({} bytes)", packet.len());
            return;
        }
        let (Some(src), Some(dst)) = (ip::source(packet), ip::destination(packet)) else {
            trace!("dropping truncated packet ({} bytes)", packet.len());
            return;
        };

        let writer = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .find(|entry| entry.network.contains(dst))
                .map(|entry| entry.writer.clone())
        };

        match writer {
            Some(writer) => {
                if let Err(e) = writer.write_packet(packet).await {
                    debug!("forward {} -> {}: {}", src, dst, e);
                }
            }
            None => {
                debug!(
                    "no route for packet {} -> {} (protocol {}), dropping",
                    src,
                    dst,
                    ip::protocol(packet).unwrap_or_default()
                );
            }
        }
    }

    /// Number of entries currently installed
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the table has no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tether_network::NetworkResult;

    /// Writer that records everything dispatched to it
    #[derive(Default)]
    struct MockWriter {
        sent: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl PacketWrite for MockWriter {
        async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()> {
            self.sent.lock().await.push(Bytes::copy_from_slice(packet));
            Ok(())
        }
    }

    fn packet_to(dst: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&20u16.to_be_bytes());
        packet[12..16].copy_from_slice(&[192, 0, 2, 1]);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    fn nets(specs: &[&str]) -> Vec<Ipv4Net> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_insertion_order_wins() {
        let table = ForwardingTable::new();
        let w1 = Arc::new(MockWriter::default());
        let w2 = Arc::new(MockWriter::default());

        // The /8 is added first, so it beats the narrower /16.
        table
            .add_networks(&nets(&["10.0.0.0/8"]), w1.clone())
            .await;
        table
            .add_networks(&nets(&["10.0.0.0/16"]), w2.clone())
            .await;

        table.dispatch(&packet_to([10, 0, 1, 5])).await;

        assert_eq!(w1.sent.lock().await.len(), 1);
        assert!(w2.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_match_drops_without_writer() {
        let table = ForwardingTable::new();
        let w1 = Arc::new(MockWriter::default());
        table
            .add_networks(&nets(&["10.0.0.0/8"]), w1.clone())
            .await;

        table.dispatch(&packet_to([192, 168, 1, 1])).await;

        assert!(w1.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_ipv4_dropped() {
        let table = ForwardingTable::new();
        let w1 = Arc::new(MockWriter::default());
        table.add_networks(&nets(&["0.0.0.0/0"]), w1.clone()).await;

        let mut packet = packet_to([10, 0, 0, 1]);
        packet[0] = 0x60; // IPv6 version nibble
        table.dispatch(&packet).await;
        table.dispatch(&[]).await;

        assert!(w1.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_writer_isolation() {
        let table = ForwardingTable::new();
        let w1: Arc<dyn PacketWrite> = Arc::new(MockWriter::default());
        let w2 = Arc::new(MockWriter::default());

        table
            .add_networks(&nets(&["10.0.0.0/8", "172.16.0.0/16"]), w1.clone())
            .await;
        table
            .add_networks(&nets(&["10.1.0.0/16"]), w2.clone())
            .await;
        table
            .add_networks(&nets(&["192.168.0.0/16"]), w1.clone())
            .await;

        table.remove_writer(&w1).await;
        assert_eq!(table.len().await, 1);

        // w2's entry survives and still routes.
        table.dispatch(&packet_to([10, 1, 2, 3])).await;
        assert_eq!(w2.sent.lock().await.len(), 1);

        // w1's entries are gone.
        table.dispatch(&packet_to([172, 16, 0, 1])).await;
        assert_eq!(w2.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutation_and_dispatch() {
        let table = Arc::new(ForwardingTable::new());
        let stable = Arc::new(MockWriter::default());
        table
            .add_networks(&nets(&["10.0.0.0/8"]), stable.clone())
            .await;

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10_000 {
                    table.dispatch(&packet_to([10, 9, 8, 7])).await;
                }
            }));
        }
        for _ in 0..4 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10_000 {
                    let w: Arc<dyn PacketWrite> = Arc::new(MockWriter::default());
                    table.add_networks(&nets(&["172.16.0.0/16"]), w.clone()).await;
                    table.remove_writer(&w).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Churned writers all removed; the stable entry took every dispatch.
        assert_eq!(table.len().await, 1);
        assert_eq!(stable.sent.lock().await.len(), 40_000);
    }
}
