//! WISP: Wire-level Secure Peering
//!
//! The transport core of a peer-to-peer stack: a UDP node-discovery
//! server that gossips peer candidates, and an authenticated handshake
//! plus framed record layer for the encrypted TCP sessions dialed to
//! the peers it finds.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod ecies;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod mac;

// Re-export identity types
pub use identity::{Identity, IdentityError, NodeId, NODE_ID_SIZE};

// Re-export config types
pub use config::{Config, ConfigError, DiscoveryConfig, EndpointConfig, IdentityConfig};

// Re-export discovery types
pub use discovery::{
    event_channel, DptError, DptEvent, DptServer, Endpoint, EventRx, EventTx, MemoryPeerTable,
    Peer, PeerTable, PingFailure,
};

// Re-export handshake types
pub use handshake::{
    Handshake, HandshakeError, Progress, Role, ACK_MSG_SIZE, AUTH_MSG_SIZE,
};

// Re-export framing types
pub use framing::{FrameCodec, FramingError, HEADER_SIZE, MAX_BODY_SIZE};

// Re-export envelope and MAC types
pub use ecies::EciesError;
pub use mac::FrameMac;
