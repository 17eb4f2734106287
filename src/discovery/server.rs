//! UDP discovery server.
//!
//! Owns the UDP socket, the pending-request map and the ping dedup
//! cache. Outgoing pings are correlated with pongs by the 32-byte packet
//! hash; concurrent pings to the same `address:udp_port` collapse onto
//! one in-flight request whose shared future every caller awaits.
//!
//! Incoming datagrams are handled atomically, one at a time, on a
//! spawned receive task: pings are answered with pongs, findneighbours
//! from the routing table, pongs resolve their pending ping, and
//! neighbours surface as a `peers` event. A ping from a node the table
//! does not know is reported as a single-peer `peers` event after a
//! short delay, so the layer above can decide whether to adopt it.
//!
//! All methods take `&self`: pings run concurrently with each other and
//! with `destroy`, which fails every outstanding ping instead of leaving
//! its caller hanging.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::message::{self, FindNeighbours, Neighbours, Packet, PacketError, Ping, Pong};
use super::table::PeerTable;
use super::{unix_time_ms, unix_time_secs, DptEvent, Endpoint, EventTx, Peer, PING_VERSION};
use crate::cache::DedupCache;
use crate::config::DiscoveryConfig;
use crate::identity::{Identity, NodeId};

/// Dedup cache capacity.
const DEDUP_CAPACITY: usize = 1000;

/// Dedup cache entry TTL.
const DEDUP_TTL_MS: u64 = 1000;

/// How long before a `peers` event announces an unknown pinger.
const NEW_PEER_DELAY: Duration = Duration::from_millis(100);

/// How far in the future outgoing packets claim to expire.
const EXPIRATION_WINDOW_SECS: u64 = 60;

/// Receive buffer size; discovery datagrams are far smaller.
const RECV_BUFFER_SIZE: usize = 2048;

/// Errors from discovery server operations.
#[derive(Debug, Error)]
pub enum DptError {
    #[error("server destroyed")]
    Destroyed,

    #[error("server not bound")]
    NotBound,

    #[error("server already bound")]
    AlreadyBound,

    #[error("endpoint {0} has no udp port")]
    NoUdpPort(String),

    #[error("ping timeout for {0}")]
    PingTimeout(String),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure modes a shared ping future can resolve to.
///
/// Cloneable so deduplicated callers all observe the same outcome.
#[derive(Clone, Debug, Error)]
pub enum PingFailure {
    #[error("ping timeout for {0}")]
    Timeout(String),

    #[error("server destroyed")]
    Destroyed,
}

impl From<PingFailure> for DptError {
    fn from(failure: PingFailure) -> Self {
        match failure {
            PingFailure::Timeout(key) => DptError::PingTimeout(key),
            PingFailure::Destroyed => DptError::Destroyed,
        }
    }
}

type PingResult = Result<Peer, PingFailure>;
type SharedPing = Shared<BoxFuture<'static, PingResult>>;

/// A ping awaiting its pong, keyed by packet hash.
struct PendingPing {
    endpoint: Endpoint,
    reply_tx: oneshot::Sender<PingResult>,
}

/// State shared between the server handle and its receive task.
struct ServerShared {
    pending: Mutex<HashMap<[u8; 32], PendingPing>>,
    dedup: tokio::sync::Mutex<DedupCache<SharedPing>>,
    destroyed: AtomicBool,
}

/// Everything the receive task needs to dispatch a datagram.
struct RecvContext {
    socket: Arc<UdpSocket>,
    shared: Arc<ServerShared>,
    identity: Arc<Identity>,
    table: Arc<dyn PeerTable>,
    event_tx: EventTx,
}

/// The discovery server.
pub struct DptServer {
    config: DiscoveryConfig,
    identity: Arc<Identity>,
    table: Arc<dyn PeerTable>,
    event_tx: EventTx,
    shared: Arc<ServerShared>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl DptServer {
    /// Create an unbound server.
    pub fn new(
        config: DiscoveryConfig,
        identity: Arc<Identity>,
        table: Arc<dyn PeerTable>,
        event_tx: EventTx,
    ) -> Self {
        Self {
            config,
            identity,
            table,
            event_tx,
            shared: Arc::new(ServerShared {
                pending: Mutex::new(HashMap::new()),
                dedup: tokio::sync::Mutex::new(DedupCache::new(DEDUP_CAPACITY, DEDUP_TTL_MS)),
                destroyed: AtomicBool::new(false),
            }),
            socket: Mutex::new(None),
            recv_task: Mutex::new(None),
        }
    }

    /// The local socket address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap().clone()
    }

    fn check_alive(&self) -> Result<(), DptError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(DptError::Destroyed);
        }
        Ok(())
    }

    /// Bind the UDP socket and start receiving.
    pub async fn bind(&self) -> Result<(), DptError> {
        self.check_alive()?;
        if self.current_socket().is_some() {
            return Err(DptError::AlreadyBound);
        }

        let socket = Arc::new(UdpSocket::bind(self.config.bind_addr()).await?);
        let local_addr = socket.local_addr()?;
        *self.socket.lock().unwrap() = Some(socket.clone());

        let ctx = Arc::new(RecvContext {
            socket,
            shared: self.shared.clone(),
            identity: self.identity.clone(),
            table: self.table.clone(),
            event_tx: self.event_tx.clone(),
        });
        *self.recv_task.lock().unwrap() = Some(tokio::spawn(recv_loop(ctx)));

        info!(local_addr = %local_addr, "discovery server listening");
        let _ = self.event_tx.send(DptEvent::Listening(local_addr)).await;
        Ok(())
    }

    /// Close the socket and fail every outstanding ping.
    ///
    /// All later operations on this server return `Destroyed`.
    pub async fn destroy(&self) -> Result<(), DptError> {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return Err(DptError::Destroyed);
        }

        let task = self.recv_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.socket.lock().unwrap().take();

        let drained: Vec<PendingPing> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.reply_tx.send(Err(PingFailure::Destroyed));
        }
        self.shared.dedup.lock().await.clear();

        info!("discovery server destroyed");
        let _ = self.event_tx.send(DptEvent::Close).await;
        Ok(())
    }

    /// Ping `endpoint` and wait for its pong.
    ///
    /// Resolves with the peer (endpoint plus the node id recovered from
    /// the pong signature) or fails after the configured timeout.
    /// Concurrent pings to the same `address:udp_port` share one
    /// datagram and one outcome.
    pub async fn ping(&self, endpoint: &Endpoint) -> Result<Peer, DptError> {
        self.check_alive()?;
        let socket = self.current_socket().ok_or(DptError::NotBound)?;
        let target = endpoint
            .udp_addr()
            .ok_or_else(|| DptError::NoUdpPort(endpoint.address.to_string()))?;
        let dedup_key = endpoint.udp_key().expect("udp_addr implies udp_key");

        // The dedup lock is held across encode-and-send so concurrent
        // callers cannot race a second datagram onto the wire.
        let mut dedup = self.shared.dedup.lock().await;
        if let Some(inflight) = dedup.get(&dedup_key, unix_time_ms()) {
            drop(dedup);
            trace!(endpoint = %endpoint, "joining in-flight ping");
            return Ok(inflight.await?);
        }

        let ping = Packet::Ping(Ping {
            version: PING_VERSION,
            from: self.config.endpoint(),
            to: endpoint.clone(),
            expiration: unix_time_secs() + EXPIRATION_WINDOW_SECS,
        });
        let datagram = message::encode(&ping, self.identity.secret_key());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&datagram[..32]);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(
            hash,
            PendingPing {
                endpoint: endpoint.clone(),
                reply_tx,
            },
        );

        if let Err(error) = socket.send_to(&datagram, target).await {
            self.shared.pending.lock().unwrap().remove(&hash);
            return Err(error.into());
        }
        trace!(endpoint = %endpoint, hash = %hex::encode(&hash[..8]), "ping sent");

        let shared = self.shared.clone();
        let timeout = self.config.timeout();
        let timeout_key = dedup_key.clone();
        let inflight: SharedPing = async move {
            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(result)) => result,
                // Sender dropped without an answer: the server went away
                Ok(Err(_)) => Err(PingFailure::Destroyed),
                Err(_) => {
                    shared.pending.lock().unwrap().remove(&hash);
                    debug!(endpoint = %timeout_key, "ping timed out");
                    Err(PingFailure::Timeout(timeout_key))
                }
            }
        }
        .boxed()
        .shared();

        dedup.insert(dedup_key, inflight.clone(), unix_time_ms());
        drop(dedup);

        Ok(inflight.await?)
    }

    /// Ask `endpoint` for its peers closest to `target`.
    ///
    /// Fire and forget: any neighbours arrive later as a `peers` event.
    pub async fn find_neighbours(
        &self,
        endpoint: &Endpoint,
        target: &NodeId,
    ) -> Result<(), DptError> {
        self.check_alive()?;
        let socket = self.current_socket().ok_or(DptError::NotBound)?;
        let addr = endpoint
            .udp_addr()
            .ok_or_else(|| DptError::NoUdpPort(endpoint.address.to_string()))?;

        let packet = Packet::FindNeighbours(FindNeighbours {
            target: *target,
            expiration: unix_time_secs() + EXPIRATION_WINDOW_SECS,
        });
        let datagram = message::encode(&packet, self.identity.secret_key());
        socket.send_to(&datagram, addr).await?;
        trace!(endpoint = %endpoint, target = %target, "findneighbours sent");
        Ok(())
    }
}

/// Receive loop, spawned by `bind` and aborted by `destroy`.
async fn recv_loop(ctx: Arc<RecvContext>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        match ctx.socket.recv_from(&mut buf).await {
            Ok((len, addr)) => handle_datagram(&ctx, &buf[..len], addr).await,
            Err(error) => {
                warn!(error = %error, "udp receive error");
                let _ = ctx.event_tx.send(DptEvent::Error(error.to_string())).await;
            }
        }
    }
}

async fn handle_datagram(ctx: &RecvContext, data: &[u8], addr: SocketAddr) {
    let decoded = match message::decode(data) {
        Ok(decoded) => decoded,
        Err(error) => {
            debug!(addr = %addr, error = %error, "dropping malformed datagram");
            return;
        }
    };

    trace!(
        addr = %addr,
        from = %decoded.node_id,
        packet = decoded.packet.type_name(),
        "datagram received"
    );

    match decoded.packet {
        Packet::Ping(ping) => handle_ping(ctx, ping, decoded.node_id, decoded.hash, addr).await,
        Packet::Pong(pong) => handle_pong(ctx, pong, decoded.node_id),
        Packet::FindNeighbours(find) => handle_find_neighbours(ctx, find, addr).await,
        Packet::Neighbours(neighbours) => {
            let _ = ctx.event_tx.send(DptEvent::Peers(neighbours.peers)).await;
        }
    }
}

async fn handle_ping(
    ctx: &RecvContext,
    ping: Ping,
    node_id: NodeId,
    hash: [u8; 32],
    addr: SocketAddr,
) {
    let source = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => {
            debug!(addr = %addr, "ignoring ping from non-ipv4 source");
            return;
        }
    };

    // Pong back to the observed source; the tcp port is whatever the
    // pinger claimed for itself.
    let pong = Packet::Pong(Pong {
        to: Endpoint {
            address: *source.ip(),
            udp_port: Some(source.port()),
            tcp_port: ping.from.tcp_port,
        },
        ping_hash: hash,
        expiration: unix_time_secs() + EXPIRATION_WINDOW_SECS,
    });
    let datagram = message::encode(&pong, ctx.identity.secret_key());
    if let Err(error) = ctx.socket.send_to(&datagram, addr).await {
        warn!(addr = %addr, error = %error, "failed to send pong");
    }

    // Give an unknown but reachable pinger to the layer above, slightly
    // delayed so our pong lands first.
    if ping.from.udp_port.is_some() && ctx.table.get_peer(&node_id).is_none() {
        let event_tx = ctx.event_tx.clone();
        let peer = Peer {
            id: node_id,
            endpoint: ping.from,
        };
        tokio::spawn(async move {
            tokio::time::sleep(NEW_PEER_DELAY).await;
            let _ = event_tx.send(DptEvent::Peers(vec![peer])).await;
        });
    }
}

fn handle_pong(ctx: &RecvContext, pong: Pong, node_id: NodeId) {
    let entry = ctx.shared.pending.lock().unwrap().remove(&pong.ping_hash);
    match entry {
        Some(entry) => {
            let peer = Peer {
                id: node_id,
                endpoint: entry.endpoint,
            };
            // Receiver may have timed out already; nothing to do then
            let _ = entry.reply_tx.send(Ok(peer));
        }
        None => {
            trace!(from = %node_id, "dropping unmatched pong");
        }
    }
}

async fn handle_find_neighbours(ctx: &RecvContext, find: FindNeighbours, addr: SocketAddr) {
    let peers = ctx.table.closest_peers(&find.target);
    let packet = Packet::Neighbours(Neighbours {
        peers,
        expiration: unix_time_secs() + EXPIRATION_WINDOW_SECS,
    });
    let datagram = message::encode(&packet, ctx.identity.secret_key());
    if let Err(error) = ctx.socket.send_to(&datagram, addr).await {
        warn!(addr = %addr, error = %error, "failed to send neighbours");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{event_channel, EventRx, MemoryPeerTable};
    use std::net::Ipv4Addr;
    use tokio::time::{sleep, timeout, Duration};

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn test_config(timeout_ms: u64) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: Some("127.0.0.1:0".parse().unwrap()),
            timeout_ms: Some(timeout_ms),
            endpoint: None,
        }
    }

    async fn bound_server(
        timeout_ms: u64,
    ) -> (Arc<DptServer>, Arc<Identity>, Arc<MemoryPeerTable>, EventRx) {
        let identity = Arc::new(Identity::generate());
        let table = Arc::new(MemoryPeerTable::new());
        let (event_tx, mut event_rx) = event_channel(64);

        let server = Arc::new(DptServer::new(
            test_config(timeout_ms),
            identity.clone(),
            table.clone(),
            event_tx,
        ));
        server.bind().await.unwrap();

        // Consume the listening event
        match event_rx.recv().await {
            Some(DptEvent::Listening(_)) => {}
            other => panic!("expected listening event, got {other:?}"),
        }

        (server, identity, table, event_rx)
    }

    fn endpoint_of(server: &DptServer) -> Endpoint {
        let addr = server.local_addr().unwrap();
        Endpoint::new(LOCALHOST, addr.port(), addr.port())
    }

    #[tokio::test]
    async fn test_ping_pong_happy_path() {
        let (a, _, _, _rx_a) = bound_server(10_000).await;
        let (b, b_identity, _, _rx_b) = bound_server(10_000).await;

        let peer = a.ping(&endpoint_of(&b)).await.unwrap();

        assert_eq!(&peer.id, b_identity.node_id());
        assert_eq!(peer.endpoint, endpoint_of(&b));
        assert!(a.shared.pending.lock().unwrap().is_empty());

        a.destroy().await.unwrap();
        b.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_timeout() {
        let (server, _, _, _rx) = bound_server(300).await;

        // A bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let target = Endpoint::new(LOCALHOST, port, port);

        let error = server.ping(&target).await.unwrap_err();
        match error {
            DptError::PingTimeout(key) => assert_eq!(key, format!("127.0.0.1:{port}")),
            other => panic!("expected timeout, got {other}"),
        }
        assert!(server.shared.pending.lock().unwrap().is_empty());

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_late_pong_after_timeout_is_dropped() {
        let (server, _, _, _rx) = bound_server(200).await;

        let remote = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote_identity = Identity::generate();
        let port = remote.local_addr().unwrap().port();
        let target = Endpoint::new(LOCALHOST, port, port);

        let result = server.ping(&target).await;
        assert!(matches!(result, Err(DptError::PingTimeout(_))));

        // Read the ping and answer it only after the timeout fired
        let mut buf = vec![0u8; 2048];
        let (len, from) = remote.recv_from(&mut buf).await.unwrap();
        let ping = message::decode(&buf[..len]).unwrap();
        let pong = Packet::Pong(Pong {
            to: target.clone(),
            ping_hash: ping.hash,
            expiration: unix_time_secs() + 60,
        });
        remote
            .send_to(&message::encode(&pong, remote_identity.secret_key()), from)
            .await
            .unwrap();

        // The late pong matches nothing and the server stays healthy
        sleep(Duration::from_millis(100)).await;
        assert!(server.shared.pending.lock().unwrap().is_empty());

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_dedup_single_datagram() {
        let (server, _, _, _rx) = bound_server(1_000).await;

        // Raw remote that counts datagrams and answers the first ping
        let remote = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote_identity = Identity::generate();
        let port = remote.local_addr().unwrap().port();
        let target = Endpoint::new(LOCALHOST, port, port);

        let first = {
            let server = server.clone();
            let target = target.clone();
            tokio::spawn(async move { server.ping(&target).await })
        };
        let second = {
            let server = server.clone();
            let target = target.clone();
            tokio::spawn(async move { server.ping(&target).await })
        };

        // Exactly one ping datagram reaches the remote
        let mut buf = vec![0u8; 2048];
        let (len, from) = timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .expect("no ping arrived")
            .unwrap();
        let ping = message::decode(&buf[..len]).unwrap();
        assert!(matches!(ping.packet, Packet::Ping(_)));

        let extra = timeout(Duration::from_millis(200), remote.recv_from(&mut buf)).await;
        assert!(extra.is_err(), "second datagram hit the wire");

        // Answer the one ping; both callers resolve to the same peer
        let pong = Packet::Pong(Pong {
            to: target.clone(),
            ping_hash: ping.hash,
            expiration: unix_time_secs() + 60,
        });
        remote
            .send_to(&message::encode(&pong, remote_identity.secret_key()), from)
            .await
            .unwrap();

        let peer_a = first.await.unwrap().unwrap();
        let peer_b = second.await.unwrap().unwrap();
        assert_eq!(peer_a, peer_b);
        assert_eq!(&peer_a.id, remote_identity.node_id());

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_pong_dropped() {
        let (server, _, _, _rx) = bound_server(10_000).await;
        let addr = server.local_addr().unwrap();

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_identity = Identity::generate();
        let pong = Packet::Pong(Pong {
            to: Endpoint::new(LOCALHOST, addr.port(), addr.port()),
            ping_hash: [0x42; 32],
            expiration: unix_time_secs() + 60,
        });
        remote
            .send_to(&message::encode(&pong, remote_identity.secret_key()), addr)
            .await
            .unwrap();

        // Server keeps working afterwards
        sleep(Duration::from_millis(100)).await;
        assert!(server.shared.pending.lock().unwrap().is_empty());

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_pinger_emits_peers_event() {
        let (server, _, _, mut events) = bound_server(10_000).await;
        let addr = server.local_addr().unwrap();

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_identity = Identity::generate();
        let remote_port = remote.local_addr().unwrap().port();
        let claimed = Endpoint::new(LOCALHOST, remote_port, 30399);

        let ping = Packet::Ping(Ping {
            version: PING_VERSION,
            from: claimed.clone(),
            to: Endpoint::new(LOCALHOST, addr.port(), addr.port()),
            expiration: unix_time_secs() + 60,
        });
        let datagram = message::encode(&ping, remote_identity.secret_key());
        let sent_at = std::time::Instant::now();
        remote.send_to(&datagram, addr).await.unwrap();

        // The pong comes straight back, echoing our packet hash and
        // claimed tcp port
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .expect("no pong arrived")
            .unwrap();
        match message::decode(&buf[..len]).unwrap().packet {
            Packet::Pong(pong) => {
                assert_eq!(pong.ping_hash, datagram[..32]);
                assert_eq!(pong.to.tcp_port, Some(30399));
                assert_eq!(pong.to.udp_port, Some(remote_port));
            }
            other => panic!("expected pong, got {}", other.type_name()),
        }

        // And the unknown pinger surfaces as a delayed peers event
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no peers event")
            .unwrap();
        match event {
            DptEvent::Peers(peers) => {
                assert!(sent_at.elapsed() >= NEW_PEER_DELAY);
                assert_eq!(peers.len(), 1);
                assert_eq!(&peers[0].id, remote_identity.node_id());
                assert_eq!(peers[0].endpoint, claimed);
            }
            other => panic!("expected peers event, got {other:?}"),
        }

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_known_pinger_emits_no_event() {
        let (server, _, table, mut events) = bound_server(10_000).await;
        let addr = server.local_addr().unwrap();

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_identity = Identity::generate();
        let remote_port = remote.local_addr().unwrap().port();
        let claimed = Endpoint::new(LOCALHOST, remote_port, remote_port);

        table.insert(Peer {
            id: *remote_identity.node_id(),
            endpoint: claimed.clone(),
        });

        let ping = Packet::Ping(Ping {
            version: PING_VERSION,
            from: claimed,
            to: Endpoint::new(LOCALHOST, addr.port(), addr.port()),
            expiration: unix_time_secs() + 60,
        });
        remote
            .send_to(&message::encode(&ping, remote_identity.secret_key()), addr)
            .await
            .unwrap();

        let event = timeout(Duration::from_millis(400), events.recv()).await;
        assert!(event.is_err(), "known pinger produced an event: {event:?}");

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_neighbours_answered_from_table() {
        let (server, _, table, _rx) = bound_server(10_000).await;
        let addr = server.local_addr().unwrap();

        let known = Peer {
            id: *Identity::generate().node_id(),
            endpoint: Endpoint::new(Ipv4Addr::new(10, 1, 2, 3), 30303, 30303),
        };
        table.insert(known.clone());

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_identity = Identity::generate();
        let find = Packet::FindNeighbours(FindNeighbours {
            target: known.id,
            expiration: unix_time_secs() + 60,
        });
        remote
            .send_to(&message::encode(&find, remote_identity.secret_key()), addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .expect("no neighbours arrived")
            .unwrap();
        match message::decode(&buf[..len]).unwrap().packet {
            Packet::Neighbours(neighbours) => {
                assert_eq!(neighbours.peers, vec![known]);
            }
            other => panic!("expected neighbours, got {}", other.type_name()),
        }

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_neighbours_emit_peers_event() {
        let (server, _, _, mut events) = bound_server(10_000).await;
        let addr = server.local_addr().unwrap();

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_identity = Identity::generate();
        let peers = vec![Peer {
            id: *Identity::generate().node_id(),
            endpoint: Endpoint::new(Ipv4Addr::new(10, 9, 8, 7), 30303, 30303),
        }];
        let neighbours = Packet::Neighbours(Neighbours {
            peers: peers.clone(),
            expiration: unix_time_secs() + 60,
        });
        remote
            .send_to(
                &message::encode(&neighbours, remote_identity.secret_key()),
                addr,
            )
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no peers event")
            .unwrap();
        match event {
            DptEvent::Peers(received) => assert_eq!(received, peers),
            other => panic!("expected peers event, got {other:?}"),
        }

        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_rejects_outstanding_pings() {
        let (server, _, _, _rx) = bound_server(10_000).await;

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let target = Endpoint::new(LOCALHOST, port, port);

        let pending_ping = {
            let server = server.clone();
            tokio::spawn(async move { server.ping(&target).await })
        };

        // Let the ping register before destroying
        sleep(Duration::from_millis(100)).await;
        server.destroy().await.unwrap();

        let result = timeout(Duration::from_secs(1), pending_ping)
            .await
            .expect("ping future hung")
            .unwrap();
        assert!(matches!(result, Err(DptError::Destroyed)));
    }

    #[tokio::test]
    async fn test_operations_fail_after_destroy() {
        let (server, _, _, _rx) = bound_server(10_000).await;
        server.destroy().await.unwrap();

        let target = Endpoint::new(LOCALHOST, 30303, 30303);
        assert!(matches!(
            server.ping(&target).await,
            Err(DptError::Destroyed)
        ));
        assert!(matches!(server.bind().await, Err(DptError::Destroyed)));
        assert!(matches!(server.destroy().await, Err(DptError::Destroyed)));
    }

    #[tokio::test]
    async fn test_double_bind_fails() {
        let (server, _, _, _rx) = bound_server(10_000).await;
        assert!(matches!(server.bind().await, Err(DptError::AlreadyBound)));
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_requires_udp_port() {
        let (server, _, _, _rx) = bound_server(10_000).await;

        let unreachable = Endpoint {
            address: LOCALHOST,
            udp_port: None,
            tcp_port: Some(30303),
        };
        assert!(matches!(
            server.ping(&unreachable).await,
            Err(DptError::NoUdpPort(_))
        ));

        server.destroy().await.unwrap();
    }
}
