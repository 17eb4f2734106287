//! UDP node discovery.
//!
//! A four-message protocol over UDP lets nodes probe each other's
//! liveness and learn new peer candidates:
//!
//! - `ping` / `pong` check reachability and correlate by packet hash.
//! - `findneighbours` / `neighbours` ask a peer for the nodes it knows
//!   closest to a target id.
//!
//! Every datagram is signed with the sender's static key and prefixed
//! with its own hash, which doubles as the request correlation id. The
//! routing table that decides *which* peers are worth remembering lives
//! above this module behind the [`PeerTable`] trait; discovery only
//! reports what it hears as [`DptEvent`]s.

mod message;
mod server;
mod table;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::identity::NodeId;

pub use message::{
    decode, encode, DecodedPacket, FindNeighbours, Neighbours, Packet, PacketError, Ping, Pong,
    PING_VERSION,
};
pub use server::{DptError, DptServer, PingFailure};
pub use table::{MemoryPeerTable, PeerTable};

/// A host on the network, as carried in discovery payloads.
///
/// `udp_port == None` means the node cannot be reached by discovery;
/// `tcp_port` is where its session transport listens, if known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
}

impl Endpoint {
    /// Endpoint with an address and both ports.
    pub fn new(address: Ipv4Addr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            address,
            udp_port: Some(udp_port),
            tcp_port: Some(tcp_port),
        }
    }

    /// Wildcard endpoint with no reachable ports.
    pub fn unspecified() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            udp_port: None,
            tcp_port: None,
        }
    }

    /// The UDP socket address, if the endpoint is reachable by discovery.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_port
            .map(|port| SocketAddr::V4(SocketAddrV4::new(self.address, port)))
    }

    /// Dedup key: `"address:udp_port"`.
    pub(crate) fn udp_key(&self) -> Option<String> {
        self.udp_port.map(|port| format!("{}:{}", self.address, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.udp_port {
            Some(port) => write!(f, "{}:{}", self.address, port),
            None => write!(f, "{}:-", self.address),
        }
    }
}

/// A known peer: its id plus where to reach it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

/// Events the discovery server reports to the layer above it.
#[derive(Clone, Debug)]
pub enum DptEvent {
    /// The UDP socket is bound and receiving.
    Listening(SocketAddr),
    /// The server was destroyed and its socket closed.
    Close,
    /// A transport-level error; the server keeps running.
    Error(String),
    /// Peer candidates heard from the network.
    Peers(Vec<Peer>),
}

/// Sender half of the discovery event channel.
pub type EventTx = mpsc::Sender<DptEvent>;

/// Receiver half of the discovery event channel.
pub type EventRx = mpsc::Receiver<DptEvent>;

/// Create the event channel the server publishes on.
pub fn event_channel(capacity: usize) -> (EventTx, EventRx) {
    mpsc::channel(capacity)
}

/// Current Unix time in milliseconds.
pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the Unix epoch")
        .as_millis() as u64
}

/// Current Unix time in seconds.
pub(crate) fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the Unix epoch")
        .as_secs()
}
