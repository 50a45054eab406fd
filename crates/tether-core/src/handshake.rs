//! Per-connection handshake
//!
//! Each side writes its hello (protocol version + advertised networks)
//! and reads the peer's, on the raw stream, before any packet traffic is
//! forwarded. Incompatible versions reject the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tether_network::packet::{
    decode_hello_header, decode_networks, HELLO_HEADER_LEN, NET_ENTRY_LEN, PROTOCOL_VERSION,
};
use tether_network::{HelloMessage, Ipv4Net};

use crate::error::{CoreError, CoreResult};

/// Exchange advertised networks with the peer.
///
/// Returns the peer's network list, or an error if the peer speaks an
/// incompatible protocol version. On error the caller must close the
/// connection without registering it anywhere.
pub async fn exchange<S>(stream: &mut S, local_networks: &[Ipv4Net]) -> CoreResult<Vec<Ipv4Net>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = HelloMessage::new(local_networks.to_vec());
    stream.write_all(&hello.to_bytes()).await?;
    stream.flush().await?;
    debug!("sent hello with {} networks", local_networks.len());

    let mut header = [0u8; HELLO_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (version, count) = decode_hello_header(&header);
    if version != PROTOCOL_VERSION {
        return Err(CoreError::ProtocolVersion(version));
    }

    let mut body = vec![0u8; count as usize * NET_ENTRY_LEN];
    stream.read_exact(&mut body).await?;
    let networks = decode_networks(&body)?;
    debug!("received hello with {} networks", networks.len());

    Ok(networks)
}
