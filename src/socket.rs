//! Socket construction for rused.
//!
//! Everything `std` and tokio cannot express directly lives here: family
//! selection and dual-stack binding, `IPV6_V6ONLY`, `SO_OOBINLINE`, the
//! fixed listen backlog, and the connected forward sockets.

use log::debug;
use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsFd;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::Proto;

const LISTEN_BACKLOG: i32 = 16;

/// The listening end of the proxy.
///
/// For UDP the socket is shared: every datagram flow sends its replies back
/// through it, so the tracker holds clones of the handle.
pub enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(sock) => sock.local_addr(),
            Listener::Udp(sock) => sock.local_addr(),
        }
    }
}

/// Bind the proxy listener on `port`.
///
/// `family` pins the address family when the forward policy names a
/// concrete host; a v6 listener then refuses v4-mapped traffic. `None`
/// binds a dual-stack wildcard so both families are accepted.
pub fn bind_listener(proto: Proto, family: Option<IpAddr>, port: u16) -> io::Result<Listener> {
    let candidates: Vec<(Domain, IpAddr, Option<bool>)> = match family {
        Some(IpAddr::V4(_)) => vec![(Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None)],
        Some(IpAddr::V6(_)) => vec![(Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED), Some(true))],
        None => vec![
            (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED), Some(false)),
            (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None),
        ],
    };

    let mut last_err = None;
    for (domain, ip, only_v6) in candidates {
        let addr = SocketAddr::new(ip, port);
        match bind_one(proto, domain, addr, only_v6) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                debug!("bind {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "listening socket failed")
    }))
}

fn bind_one(
    proto: Proto,
    domain: Domain,
    addr: SocketAddr,
    only_v6: Option<bool>,
) -> io::Result<Listener> {
    match proto {
        Proto::Tcp => {
            let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
            socket.set_reuse_address(true)?;
            if let Some(flag) = only_v6 {
                socket.set_only_v6(flag)?;
            }
            socket.bind(&addr.into())?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;
            Ok(Listener::Tcp(TcpListener::from_std(socket.into())?))
        }
        Proto::Udp => {
            let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
            socket.set_reuse_address(true)?;
            if let Some(flag) = only_v6 {
                socket.set_only_v6(flag)?;
            }
            socket.set_out_of_band_inline(true)?;
            socket.bind(&addr.into())?;
            socket.set_nonblocking(true)?;
            Ok(Listener::Udp(Arc::new(UdpSocket::from_std(socket.into())?)))
        }
    }
}

/// Enable inline delivery of out-of-band data.
pub fn set_oob_inline<S: AsFd>(sock: &S) -> io::Result<()> {
    SockRef::from(sock).set_out_of_band_inline(true)
}

/// Open and connect the forward stream for a TCP flow.
pub async fn connect_tcp(target: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(target).await?;
    set_oob_inline(&stream)?;
    Ok(stream)
}

/// Open and connect the forward socket for a datagram flow.
///
/// The connect pins the peer: this socket only receives datagrams sent by
/// the forward target.
pub async fn connect_udp(target: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    set_oob_inline(&socket)?;
    Ok(socket)
}
