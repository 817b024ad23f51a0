//! The dispatcher: a single-task readiness loop driving every flow.
//!
//! Each iteration arms one wait over the listener, every tracked socket,
//! the earliest datagram expiry and the cancellation flag, then handles
//! whichever event fired, expires idle datagram flows, and sweeps dead
//! entries. Readiness is level-triggered, so events that lost the race are
//! picked up on the immediately following iterations.
//!
//! The two scratch buffers are shared by every flow. That is sound only
//! while all handlers run to completion on this one task; if concurrency is
//! ever added they must move into the connections.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::resolver::{original_destination, ForwardPolicy};
use crate::rules::RuleSet;
use crate::socket::{connect_tcp, connect_udp, set_oob_inline, Listener};
use crate::tracker::{ClientEnd, ConnState, Connection, PeerSocket, Tracker};

/// Largest chunk read from a socket in one event.
pub const MAX_BUF: usize = 100_000;

/// Default idle deadline for datagram flows.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(30);

/// What woke the dispatcher up.
enum Wake {
    /// The TCP listener produced a connection (or failed to).
    Incoming(io::Result<(TcpStream, SocketAddr)>),

    /// The UDP listener has a datagram waiting.
    Datagram,

    /// A tracked TCP client socket is readable.
    Client(usize),

    /// A tracked forward socket is readable.
    Forward(usize),

    /// The earliest datagram expiry deadline passed with no data.
    Deadline,

    /// The cancellation flag was raised.
    Canceled,
}

/// Single-threaded forwarding dispatcher.
///
/// Owns the listener, the tracker and the scratch buffers. Individual
/// flows may die at any time; the loop itself only stops on cancellation.
pub struct Dispatcher {
    listener: Listener,
    policy: ForwardPolicy,
    rules: RuleSet,
    tracker: Tracker,
    udp_timeout: Duration,
    shutdown: watch::Receiver<bool>,

    /// Scratch buffer for raw reads, shared across flows.
    buf: Vec<u8>,

    /// Scratch buffer for edited output, shared across flows.
    edited: Vec<u8>,

    /// Refreshed right after every readiness wait.
    now: Instant,
}

impl Dispatcher {
    pub fn new(
        listener: Listener,
        policy: ForwardPolicy,
        rules: RuleSet,
        udp_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Dispatcher {
            listener,
            policy,
            rules,
            tracker: Tracker::new(),
            udp_timeout,
            shutdown,
            buf: vec![0u8; MAX_BUF],
            edited: Vec::with_capacity(MAX_BUF),
            now: Instant::now(),
        }
    }

    /// Number of flows currently tracked.
    pub fn active_flows(&self) -> usize {
        self.tracker.len()
    }

    /// Run until canceled. Dropping the dispatcher afterwards closes the
    /// listener and every tracked socket.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            let deadline = self.next_deadline();
            let wake = wait_for_event(
                &self.listener,
                &self.tracker,
                deadline,
                &mut self.shutdown,
            )
            .await;
            self.now = Instant::now();

            match wake {
                Wake::Canceled => break,
                Wake::Incoming(result) => self.accept_stream(result).await,
                Wake::Datagram => self.take_datagram().await,
                Wake::Client(idx) => self.client_to_server(idx).await,
                Wake::Forward(idx) => self.server_to_client(idx).await,
                Wake::Deadline => debug!("no data before the earliest expiry deadline"),
            }

            self.tracker.expire_idle(self.now, self.udp_timeout);
            self.tracker.sweep();
        }
        info!("Dispatcher stopped, dropping {} active flow(s).", self.tracker.len());
        Ok(())
    }

    /// Earliest datagram expiry across tracked flows, if any. TCP-only
    /// workloads wait without a deadline.
    fn next_deadline(&self) -> Option<Duration> {
        let mut deadline = None;
        let cap = self.udp_timeout + Duration::from_secs(1);
        for conn in self.tracker.iter() {
            if let Some(remain) = conn.expiry_in(self.now, self.udp_timeout) {
                if remain < deadline.unwrap_or(cap) {
                    deadline = Some(remain);
                }
            }
        }
        deadline
    }

    /// Intake for a newly accepted TCP stream.
    async fn accept_stream(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, client_addr) = match result {
            Ok(pair) => pair,
            Err(err) => {
                error!("accept(): {}", err);
                return;
            }
        };
        if let Err(err) = set_oob_inline(&stream) {
            debug!("SO_OOBINLINE on accepted stream: {}", err);
        }
        let original = self.original_dst_of(stream.as_raw_fd(), stream.local_addr());
        info!("Got incoming connection from {} to {}", client_addr, original);
        let target = self.policy.target_for(original);
        info!("Forwarding connection to {}", target);

        match connect_tcp(target).await {
            Ok(forward) => {
                let conn = Connection::new(
                    ClientEnd::Tcp(stream),
                    PeerSocket::Tcp(forward),
                    self.rules.fresh_counts(),
                    self.now,
                );
                debug!("connection {}: tracking {}", conn.id(), client_addr);
                self.tracker.insert(conn);
            }
            Err(err) => {
                warn!("Cannot connect to remote server, dropping connection. ({})", err);
            }
        }
    }

    /// Intake for the UDP listener: route the datagram to its flow,
    /// creating one for a source address never seen before.
    async fn take_datagram(&mut self) {
        let sock = match &self.listener {
            Listener::Udp(sock) => Arc::clone(sock),
            Listener::Tcp(_) => return,
        };
        let (size, client_addr) = match sock.try_recv_from(&mut self.buf) {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                error!("recvfrom(): {}", err);
                return;
            }
        };
        let idx = match self.tracker.find_udp(client_addr) {
            Some(idx) => {
                debug!("Got incoming datagram from existing connection.");
                idx
            }
            None => match self.open_udp_flow(sock, client_addr).await {
                Some(idx) => idx,
                None => return,
            },
        };
        if size > 0 {
            info!("Caught client -> server packet.");
            self.pump_to_server(idx, size).await;
        }
    }

    /// Create the tracker entry for a datagram from an unseen source.
    async fn open_udp_flow(
        &mut self,
        listener: Arc<UdpSocket>,
        client_addr: SocketAddr,
    ) -> Option<usize> {
        let original = self.original_dst_of(listener.as_raw_fd(), listener.local_addr());
        info!("Got incoming connection from {} to {}", client_addr, original);
        let target = self.policy.target_for(original);
        info!("Forwarding connection to {}", target);

        match connect_udp(target).await {
            Ok(forward) => {
                let conn = Connection::new(
                    ClientEnd::Udp {
                        listener,
                        peer: client_addr,
                    },
                    PeerSocket::Udp(forward),
                    self.rules.fresh_counts(),
                    self.now,
                );
                debug!("connection {}: tracking {}", conn.id(), client_addr);
                Some(self.tracker.insert(conn))
            }
            Err(err) => {
                warn!("Cannot connect to remote server, dropping connection. ({})", err);
                None
            }
        }
    }

    /// Client to server for TCP streams.
    async fn client_to_server(&mut self, idx: usize) {
        let conn = self.tracker.get_mut(idx);
        match conn.client.try_read(&mut self.buf) {
            Ok(0) => {
                debug!("connection {}: client disconnected (eof)", conn.id());
                conn.state = ConnState::Disconnected;
            }
            Ok(size) => {
                info!("Caught client -> server packet.");
                self.pump_to_server(idx, size).await;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!("connection {}: client disconnected (read: {})", conn.id(), err);
                conn.state = ConnState::Disconnected;
            }
        }
    }

    /// Rule-apply-and-forward for a chunk already sitting in the scratch
    /// buffer, shared by stream reads and datagram intake.
    async fn pump_to_server(&mut self, idx: usize, size: usize) {
        let conn = self.tracker.get_mut(idx);
        self.rules
            .apply(&self.buf[..size], &mut conn.live, &mut self.edited);
        conn.last_activity = self.now;
        if self.edited.is_empty() {
            return;
        }
        if let Err(err) = conn.forward.send(&self.edited).await {
            debug!("connection {}: server disconnected (write: {})", conn.id(), err);
            conn.state = ConnState::Disconnected;
        }
    }

    /// Server to client for both protocols.
    async fn server_to_client(&mut self, idx: usize) {
        let conn = self.tracker.get_mut(idx);
        match conn.forward.try_read(&mut self.buf) {
            Ok(0) => {
                debug!("connection {}: server disconnected (eof)", conn.id());
                conn.state = ConnState::Disconnected;
            }
            Ok(size) => {
                info!("Caught server -> client packet.");
                self.rules
                    .apply(&self.buf[..size], &mut conn.live, &mut self.edited);
                conn.last_activity = self.now;
                conn.state = ConnState::Established;
                if !self.edited.is_empty() {
                    if let Err(err) = conn.client.send(&self.edited).await {
                        debug!(
                            "connection {}: client disconnected (write: {})",
                            conn.id(),
                            err
                        );
                        conn.state = ConnState::Disconnected;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!("connection {}: server disconnected (read: {})", conn.id(), err);
                conn.state = ConnState::Disconnected;
            }
        }
    }

    /// Destination the kernel recorded for a flow, with the local socket
    /// name as the fallback.
    fn original_dst_of(&self, fd: RawFd, local: io::Result<SocketAddr>) -> SocketAddr {
        let local =
            local.unwrap_or_else(|_| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        original_destination(fd, local)
    }
}

/// Arm one readiness wait over everything the dispatcher cares about and
/// return the first event that fires.
async fn wait_for_event(
    listener: &Listener,
    tracker: &Tracker,
    deadline: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Wake {
    let mut waits: FuturesUnordered<BoxFuture<'_, Wake>> = FuturesUnordered::new();

    match listener {
        Listener::Tcp(sock) => {
            waits.push(Box::pin(async move { Wake::Incoming(sock.accept().await) }))
        }
        Listener::Udp(sock) => waits.push(Box::pin(async move {
            // errors surface on the try_recv_from that follows
            let _ = sock.readable().await;
            Wake::Datagram
        })),
    }

    for (idx, conn) in tracker.iter().enumerate() {
        if let ClientEnd::Tcp(stream) = &conn.client {
            waits.push(Box::pin(async move {
                let _ = stream.readable().await;
                Wake::Client(idx)
            }));
        }
        let forward = &conn.forward;
        waits.push(Box::pin(async move {
            let _ = forward.readable().await;
            Wake::Forward(idx)
        }));
    }

    if let Some(remain) = deadline {
        waits.push(Box::pin(async move {
            sleep(remain).await;
            Wake::Deadline
        }));
    }

    waits.push(Box::pin(async move {
        // a closed channel counts as cancellation
        let _ = shutdown.changed().await;
        Wake::Canceled
    }));

    waits.next().await.unwrap_or(Wake::Canceled)
}
