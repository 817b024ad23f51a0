//! Tests for the connection tracker

#[cfg(test)]
mod tests {
    use crate::tracker::{ClientEnd, ConnState, Connection, PeerSocket, Tracker};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio::time::Instant;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn udp_flow(peer: SocketAddr) -> Connection {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let forward = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        forward.connect(listener.local_addr().unwrap()).await.unwrap();
        Connection::new(
            ClientEnd::Udp { listener, peer },
            PeerSocket::Udp(forward),
            vec![-1],
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn tcp_flows_start_established() {
        let (client, server) = tcp_pair().await;
        let conn = Connection::new(
            ClientEnd::Tcp(client),
            PeerSocket::Tcp(server),
            vec![-1, 3],
            Instant::now(),
        );
        assert_eq!(conn.state, ConnState::Established);
        assert_eq!(conn.client.peer_addr(), None);
        assert_eq!(conn.live, vec![-1, 3]);
    }

    #[tokio::test]
    async fn udp_flows_start_unreplied() {
        let peer: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let conn = udp_flow(peer).await;
        assert_eq!(conn.state, ConnState::Unreplied);
        assert_eq!(conn.client.peer_addr(), Some(peer));
    }

    #[test]
    fn dead_states_are_ordered_after_live_ones() {
        assert!(ConnState::Unreplied < ConnState::Disconnected);
        assert!(ConnState::Established < ConnState::Disconnected);
        assert!(ConnState::Disconnected <= ConnState::TimedOut);
    }

    #[tokio::test]
    async fn same_source_address_shares_one_entry() {
        let peer_a: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let peer_b: SocketAddr = "127.0.0.1:2222".parse().unwrap();

        let mut tracker = Tracker::new();
        let first = tracker.insert(udp_flow(peer_a).await);
        assert_eq!(tracker.find_udp(peer_a), Some(first));
        assert_eq!(tracker.find_udp(peer_b), None);

        let second = tracker.insert(udp_flow(peer_b).await);
        assert_eq!(tracker.find_udp(peer_b), Some(second));
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn sweep_drops_dead_entries_only() {
        let peer_a: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let peer_b: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        let peer_c: SocketAddr = "127.0.0.1:3333".parse().unwrap();

        let mut tracker = Tracker::new();
        tracker.insert(udp_flow(peer_a).await);
        let doomed = tracker.insert(udp_flow(peer_b).await);
        let expired = tracker.insert(udp_flow(peer_c).await);
        tracker.get_mut(doomed).state = ConnState::Disconnected;
        tracker.get_mut(expired).state = ConnState::TimedOut;

        tracker.sweep();
        assert_eq!(tracker.len(), 1);
        assert!(tracker.find_udp(peer_a).is_some());
        assert!(tracker.find_udp(peer_b).is_none());
        assert!(tracker.find_udp(peer_c).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_udp_flows_time_out() {
        let peer: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let mut tracker = Tracker::new();
        let idx = tracker.insert(udp_flow(peer).await);

        tokio::time::advance(Duration::from_secs(29)).await;
        tracker.expire_idle(Instant::now(), Duration::from_secs(30));
        assert_eq!(tracker.get_mut(idx).state, ConnState::Unreplied);

        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.expire_idle(Instant::now(), Duration::from_secs(30));
        assert_eq!(tracker.get_mut(idx).state, ConnState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn tcp_flows_never_time_out() {
        let (client, server) = tcp_pair().await;
        let mut tracker = Tracker::new();
        let idx = tracker.insert(Connection::new(
            ClientEnd::Tcp(client),
            PeerSocket::Tcp(server),
            vec![],
            Instant::now(),
        ));

        tokio::time::advance(Duration::from_secs(3600)).await;
        tracker.expire_idle(Instant::now(), Duration::from_secs(30));
        assert_eq!(tracker.get_mut(idx).state, ConnState::Established);
        assert_eq!(
            tracker.get_mut(idx).expiry_in(Instant::now(), Duration::from_secs(30)),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_remaining_floors_at_zero() {
        let peer: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let conn = udp_flow(peer).await;

        let timeout = Duration::from_secs(30);
        assert_eq!(conn.expiry_in(Instant::now(), timeout), Some(timeout));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(conn.expiry_in(Instant::now(), timeout), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn activity_refreshes_the_deadline() {
        let peer: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let mut tracker = Tracker::new();
        let idx = tracker.insert(udp_flow(peer).await);

        let later = Instant::now() + Duration::from_secs(29);
        tracker.get_mut(idx).last_activity = later;
        tracker.expire_idle(later + Duration::from_secs(29), Duration::from_secs(30));
        assert_eq!(tracker.get_mut(idx).state, ConnState::Unreplied);
    }
}
