//! Kernel routing table synchronization
//!
//! Installs and removes host routes bound to the tunnel interface for
//! networks learned from remote peers, via SIOCADDRT/SIOCDELRT ioctls.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::net::Ipv4Net;

/// Install one kernel route per network, egressing the given interface.
///
/// The first failure aborts the batch and surfaces the error; routes added
/// before the failure are not rolled back here.
pub fn add_routes(networks: &[Ipv4Net], interface: &str) -> NetworkResult<()> {
    if networks.is_empty() {
        return Ok(());
    }

    let sock = route_socket()?;
    let ifname = route_ifname(interface)?;

    for net in networks {
        route_ioctl(&sock, libc::SIOCADDRT, *net, &ifname).map_err(|e| {
            NetworkError::Route(format!("add {} via {}: {}", net, interface, e))
        })?;
        debug!("added route {} dev {}", net, interface);
    }

    Ok(())
}

/// Remove the kernel routes for the given networks.
///
/// Best-effort: this runs during connection teardown, so failures are
/// logged and the remaining networks are still processed.
pub fn remove_routes(networks: &[Ipv4Net], interface: &str) {
    if networks.is_empty() {
        return;
    }

    let sock = match route_socket() {
        Ok(sock) => sock,
        Err(e) => {
            warn!("route removal skipped: {}", e);
            return;
        }
    };
    let ifname = match route_ifname(interface) {
        Ok(ifname) => ifname,
        Err(e) => {
            warn!("route removal skipped: {}", e);
            return;
        }
    };

    for net in networks {
        match route_ioctl(&sock, libc::SIOCDELRT, *net, &ifname) {
            Ok(()) => debug!("removed route {} dev {}", net, interface),
            Err(e) => warn!("remove route {} dev {}: {}", net, interface, e),
        }
    }
}

fn route_socket() -> NetworkResult<OwnedFd> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(NetworkError::Route(format!(
            "route socket: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

fn route_ifname(interface: &str) -> NetworkResult<CString> {
    CString::new(interface)
        .map_err(|_| NetworkError::Route(format!("invalid interface name {:?}", interface)))
}

fn route_ioctl(
    sock: &OwnedFd,
    request: libc::c_ulong,
    net: Ipv4Net,
    ifname: &CString,
) -> std::io::Result<()> {
    let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
    route.rt_dst = inet_sockaddr(net.addr());
    route.rt_genmask = inet_sockaddr(net.mask());
    route.rt_flags = libc::RTF_UP;
    route.rt_dev = ifname.as_ptr() as *mut libc::c_char;

    if unsafe { libc::ioctl(sock.as_raw_fd(), request as _, &route) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn inet_sockaddr(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.octets()),
        },
        sin_zero: [0; 8],
    };
    // sockaddr_in and sockaddr are layout-compatible views of the same
    // 16-byte structure.
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}
