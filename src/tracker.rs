//! Per-flow state: the unified TCP/UDP connection record and its registry.
//!
//! TCP and UDP flows share one record type. The client side is a tagged
//! variant rather than a nullable address, and the send path dispatches on
//! it, so the handlers never care which protocol they are serving.

use log::debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use uuid::Uuid;

/// Connection state.
///
/// Ordering matters: every state at or past `Disconnected` marks the entry
/// for removal by the sweep at the end of the current dispatch iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Datagram forwarded to the server, no response seen yet (UDP only).
    Unreplied,

    /// Accepted stream, or a datagram flow the server has answered.
    Established,

    /// Read or write on either side failed or hit EOF.
    Disconnected,

    /// Idle past the configured deadline (UDP only).
    TimedOut,
}

/// The client side of a flow: an accepted stream for TCP, or the shared
/// listening socket plus the datagram return address for UDP.
pub enum ClientEnd {
    Tcp(TcpStream),
    Udp {
        listener: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl ClientEnd {
    /// Datagram return address; `None` for TCP where the stream itself
    /// identifies the client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            ClientEnd::Tcp(_) => None,
            ClientEnd::Udp { peer, .. } => Some(*peer),
        }
    }

    /// Non-blocking read from the client. Datagrams from UDP clients arrive
    /// at the shared listener instead, so that variant never has data here.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientEnd::Tcp(stream) => stream.try_read(buf),
            ClientEnd::Udp { .. } => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    /// Send an edited buffer back to the client.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            ClientEnd::Tcp(stream) => stream.write_all(data).await,
            ClientEnd::Udp { listener, peer } => {
                listener.send_to(data, *peer).await.map(|_| ())
            }
        }
    }
}

/// Socket connected to the forward target.
pub enum PeerSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl PeerSocket {
    /// Wait until the forward socket has data.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            PeerSocket::Tcp(sock) => sock.readable().await,
            PeerSocket::Udp(sock) => sock.readable().await,
        }
    }

    /// Non-blocking read of one chunk or datagram.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PeerSocket::Tcp(sock) => sock.try_read(buf),
            PeerSocket::Udp(sock) => sock.try_recv(buf),
        }
    }

    /// Send one edited buffer to the forward target.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            PeerSocket::Tcp(sock) => sock.write_all(data).await,
            PeerSocket::Udp(sock) => sock.send(data).await.map(|_| ()),
        }
    }
}

/// One tracked forwarding session.
pub struct Connection {
    id: Uuid,
    pub client: ClientEnd,
    pub forward: PeerSocket,

    /// Time of the most recent read or write on this flow.
    pub last_activity: Instant,
    pub state: ConnState,

    /// Per-connection copy of the rule expiry counters.
    pub live: Vec<i32>,
}

impl Connection {
    /// Track a new flow. TCP flows start out established; datagram flows
    /// are unreplied until the server answers.
    pub fn new(client: ClientEnd, forward: PeerSocket, live: Vec<i32>, now: Instant) -> Self {
        let state = match client {
            ClientEnd::Tcp(_) => ConnState::Established,
            ClientEnd::Udp { .. } => ConnState::Unreplied,
        };
        Connection {
            id: Uuid::new_v4(),
            client,
            forward,
            last_activity: now,
            state,
            live,
        }
    }

    /// Diagnostic identifier for correlating log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True when the entry must be removed by the next sweep.
    pub fn is_dead(&self) -> bool {
        self.state >= ConnState::Disconnected
    }

    /// Idle time left before a datagram flow expires; `None` for TCP,
    /// which has no idle deadline.
    pub fn expiry_in(&self, now: Instant, udp_timeout: Duration) -> Option<Duration> {
        match self.client {
            ClientEnd::Tcp(_) => None,
            ClientEnd::Udp { .. } => {
                Some(udp_timeout.saturating_sub(now.duration_since(self.last_activity)))
            }
        }
    }
}

/// Registry of live flows, owned and touched only by the dispatcher.
///
/// Lookups are linear scans; the target workload is tens of concurrent
/// flows.
#[derive(Default)]
pub struct Tracker {
    conns: Vec<Connection>,
}

impl Tracker {
    pub fn new() -> Self {
        Tracker { conns: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Connection {
        &mut self.conns[idx]
    }

    /// Register a flow, returning its index for this iteration.
    pub fn insert(&mut self, conn: Connection) -> usize {
        self.conns.push(conn);
        self.conns.len() - 1
    }

    /// Find the datagram flow matching a source address, if any.
    pub fn find_udp(&self, addr: SocketAddr) -> Option<usize> {
        self.conns
            .iter()
            .position(|conn| conn.client.peer_addr() == Some(addr))
    }

    /// Mark idle datagram flows as timed out.
    pub fn expire_idle(&mut self, now: Instant, udp_timeout: Duration) {
        for conn in &mut self.conns {
            if conn.client.peer_addr().is_some()
                && conn.state < ConnState::Disconnected
                && now.duration_since(conn.last_activity) >= udp_timeout
            {
                debug!("connection {}: idle timeout", conn.id);
                conn.state = ConnState::TimedOut;
            }
        }
    }

    /// Drop every entry at or past `Disconnected`, closing its sockets.
    pub fn sweep(&mut self) {
        self.conns.retain(|conn| {
            if conn.is_dead() {
                debug!("connection {}: removed ({:?})", conn.id, conn.state);
                false
            } else {
                true
            }
        });
    }
}
