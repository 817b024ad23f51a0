//! Forwarding-target resolution.
//!
//! The remote endpoint named on the command line is resolved once at
//! startup. Either half may come out "unset": an unset host or port falls
//! back, per flow, to the original destination the kernel recorded for the
//! intercepted connection.

use log::{debug, info};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use tokio::net::lookup_host;

/// How the remote endpoint of each new flow is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPolicy {
    fixed_host: Option<IpAddr>,
    fixed_port: Option<u16>,
}

impl ForwardPolicy {
    /// Resolve the command-line remote endpoint.
    ///
    /// A host of `"0"`, or one resolving only to the wildcard address,
    /// leaves the host side dynamic; a port of 0 leaves the port side
    /// dynamic. The address is taken from the first candidate that is not
    /// the wildcard.
    pub async fn resolve(remote_host: &str, remote_port: u16) -> io::Result<Self> {
        let fixed_port = (remote_port != 0).then_some(remote_port);
        let fixed_host = if remote_host == "0" {
            None
        } else {
            lookup_host((remote_host, remote_port))
                .await?
                .map(|candidate| candidate.ip())
                .find(|ip| !ip.is_unspecified())
        };
        Ok(ForwardPolicy {
            fixed_host,
            fixed_port,
        })
    }

    /// Policy with both sides pinned, bypassing resolution.
    pub fn fixed(target: SocketAddr) -> Self {
        ForwardPolicy {
            fixed_host: Some(target.ip()),
            fixed_port: Some(target.port()),
        }
    }

    /// Address pinned by the policy, if any. Its family drives listener
    /// binding; `None` asks for a dual-stack listener.
    pub fn fixed_host(&self) -> Option<IpAddr> {
        self.fixed_host
    }

    /// Port pinned by the policy, if any.
    pub fn fixed_port(&self) -> Option<u16> {
        self.fixed_port
    }

    /// Forwarding target for one flow, given the destination the kernel
    /// recorded for it.
    pub fn target_for(&self, original: SocketAddr) -> SocketAddr {
        let ip = self.fixed_host.unwrap_or_else(|| original.ip());
        let port = self.fixed_port.unwrap_or_else(|| original.port());
        SocketAddr::new(ip, port)
    }

    /// Announce the forwarding mode at startup.
    pub fn announce(&self, remote_host: &str, remote_port: u16) {
        match (self.fixed_host, self.fixed_port) {
            (Some(_), Some(_)) => {
                info!("Using fixed forwarding to {},{}.", remote_host, remote_port)
            }
            (None, Some(_)) => info!(
                "Using dynamic (transparent proxy) forwarding with fixed port {}.",
                remote_port
            ),
            (Some(_), None) => info!(
                "Using dynamic (transparent proxy) forwarding with fixed addr {}.",
                remote_host
            ),
            (None, None) => info!("Using dynamic (transparent proxy) forwarding."),
        }
    }
}

/// Destination the kernel recorded for an intercepted flow.
///
/// On Linux the netfilter pre-NAT record is queried first; everywhere else,
/// and whenever that query fails, the local socket name is the best
/// available answer.
pub fn original_destination(fd: RawFd, local: SocketAddr) -> SocketAddr {
    #[cfg(target_os = "linux")]
    {
        match netfilter_original_dst(fd, local.is_ipv6()) {
            Ok(addr) => return addr,
            Err(err) => debug!(
                "original destination lookup failed ({}), using local socket name",
                err
            ),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = fd;
        debug!("no original destination record, using local socket name");
    }
    local
}

#[cfg(target_os = "linux")]
fn netfilter_original_dst(fd: RawFd, v6: bool) -> io::Result<SocketAddr> {
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    const SO_ORIGINAL_DST: libc::c_int = 80;
    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

    if v6 {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                IP6T_SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        Ok(SocketAddr::V6(SocketAddrV6::new(
            ip,
            u16::from_be(addr.sin6_port),
            addr.sin6_flowinfo,
            addr.sin6_scope_id,
        )))
    } else {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok(SocketAddr::V4(SocketAddrV4::new(
            ip,
            u16::from_be(addr.sin_port),
        )))
    }
}
