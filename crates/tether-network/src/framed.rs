//! Packet capability traits and stream framing
//!
//! Raw IPv4 datagrams travel back-to-back on the byte stream with no
//! extra framing; the receiver reconstructs packet boundaries from the
//! IP header's total-length field.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{NetworkError, NetworkResult};
use crate::packet::ip;

/// Blocking read of one whole IP packet
#[async_trait]
pub trait PacketRead: Send + Sync {
    /// Read a single packet
    async fn read_packet(&self) -> NetworkResult<Bytes>;
}

/// Blocking write of one whole IP packet
#[async_trait]
pub trait PacketWrite: Send + Sync {
    /// Write a single packet
    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()>;
}

/// Packet framing over an established, handshaken stream connection
pub struct PacketStream<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Wrap a stream, splitting it into independently locked halves
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> PacketRead for PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn read_packet(&self) -> NetworkResult<Bytes> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; ip::MIN_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < ip::MIN_HEADER_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "declared total length {} below minimum header size",
                total
            )));
        }

        let mut packet = BytesMut::with_capacity(total);
        packet.extend_from_slice(&header);
        packet.resize(total, 0);
        reader.read_exact(&mut packet[ip::MIN_HEADER_LEN..]).await?;

        Ok(packet.freeze())
    }
}

#[async_trait]
impl<S> PacketWrite for PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await?;
        writer.flush().await?;
        Ok(())
    }
}
