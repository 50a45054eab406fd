//! Linux TUN device implementation
//!
//! Creates the interface with raw ioctls: `/dev/net/tun` + TUNSETIFF in
//! no-packet-info mode, then interface flags through a throwaway datagram
//! socket. Requires CAP_NET_ADMIN.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::unix::AsyncFd;
use tracing::info;

use crate::error::{NetworkError, NetworkResult};
use crate::framed::{PacketRead, PacketWrite};
use crate::packet::ip;

const TUN_DEVICE: &str = "/dev/net/tun";
const TUN_MAJOR: u32 = 10;
const TUN_MINOR: u32 = 200;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 24 - std::mem::size_of::<libc::c_short>()],
}

impl IfReqFlags {
    fn new(name: &str, flags: libc::c_short) -> NetworkResult<Self> {
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 24 - std::mem::size_of::<libc::c_short>()],
        };
        write_ifname(&mut ifr.ifr_name, name)?;
        Ok(ifr)
    }
}

fn write_ifname(dst: &mut [libc::c_char; libc::IFNAMSIZ], name: &str) -> NetworkResult<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
        return Err(NetworkError::Tun(format!(
            "invalid interface name {:?}",
            name
        )));
    }
    for (slot, b) in dst.iter_mut().zip(bytes) {
        *slot = *b as libc::c_char;
    }
    Ok(())
}

/// A virtual point-to-point network interface
///
/// Must be created inside a tokio runtime. The underlying file handle is
/// released (and the interface destroyed) on drop.
pub struct Tun {
    fd: AsyncFd<File>,
    name: String,
}

impl Tun {
    /// Create and bring up a TUN interface with the given name.
    ///
    /// Any failure here is fatal to process startup: there is no retry.
    pub fn create(name: &str) -> NetworkResult<Self> {
        ensure_device_node()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(TUN_DEVICE)
            .map_err(|e| NetworkError::Tun(format!("cannot open {}: {}", TUN_DEVICE, e)))?;

        let ifr = IfReqFlags::new(name, IFF_TUN | IFF_NO_PI)?;
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) } < 0 {
            return Err(NetworkError::Tun(format!(
                "TUNSETIFF for {:?}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        set_interface_flags(name)?;

        let fd = AsyncFd::new(file)?;
        info!("created TUN device {}", name);

        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Create the /dev/net/tun character device node if the host (e.g. a
/// minimal container image) doesn't already have one
fn ensure_device_node() -> NetworkResult<()> {
    if std::path::Path::new(TUN_DEVICE).exists() {
        return Ok(());
    }

    std::fs::create_dir_all("/dev/net")
        .map_err(|e| NetworkError::Tun(format!("cannot create /dev/net: {}", e)))?;

    let dev = libc::makedev(TUN_MAJOR, TUN_MINOR);
    if unsafe { libc::mknod(c"/dev/net/tun".as_ptr(), libc::S_IFCHR | 0o666, dev) } < 0 {
        return Err(NetworkError::Tun(format!(
            "mknod {}: {}",
            TUN_DEVICE,
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Mark the interface UP | POINTOPOINT | RUNNING | NOARP | MULTICAST
/// through a throwaway datagram socket
fn set_interface_flags(name: &str) -> NetworkResult<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(NetworkError::Tun(format!(
            "flag socket: {}",
            std::io::Error::last_os_error()
        )));
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };

    let flags = (libc::IFF_UP
        | libc::IFF_POINTOPOINT
        | libc::IFF_RUNNING
        | libc::IFF_NOARP
        | libc::IFF_MULTICAST) as libc::c_short;
    let ifr = IfReqFlags::new(name, flags)?;

    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } < 0 {
        return Err(NetworkError::Tun(format!(
            "SIOCSIFFLAGS for {:?}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

#[async_trait]
impl PacketRead for Tun {
    async fn read_packet(&self) -> NetworkResult<Bytes> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buf = BytesMut::zeroed(ip::MAX_PACKET_LEN + 1);

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(result) => {
                    let n = result?;
                    buf.truncate(n);
                    return Ok(buf.freeze());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl PacketWrite for Tun {
    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()> {
        loop {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(packet)
            }) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname_too_long() {
        let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
        assert!(write_ifname(&mut name, "an-interface-name-well-past-ifnamsiz").is_err());
        assert!(write_ifname(&mut name, "").is_err());
        assert!(write_ifname(&mut name, "tether0").is_ok());
    }

    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn test_create_tun_device() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let tun = Tun::create("tether-test0").unwrap();
            assert_eq!(tun.name(), "tether-test0");
        });
    }
}
