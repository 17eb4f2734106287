//! Routing-table seam.
//!
//! The discovery server consults a peer table when answering
//! findneighbours requests and when deciding whether a pinger is new.
//! Bucket refresh and eviction policy belong to the layer that owns the
//! table; this module only defines the interface plus a plain in-memory
//! implementation for the daemon and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use super::Peer;
use crate::identity::NodeId;

/// How many peers a findneighbours reply carries at most.
pub const CLOSEST_PEERS_LIMIT: usize = 16;

/// Read access to the routing table.
pub trait PeerTable: Send + Sync {
    /// Look up a peer by id.
    fn get_peer(&self, id: &NodeId) -> Option<Peer>;

    /// The known peers closest to `target`, nearest first.
    fn closest_peers(&self, target: &NodeId) -> Vec<Peer>;
}

/// Flat in-memory peer table ordered by XOR distance.
#[derive(Default)]
pub struct MemoryPeerTable {
    peers: Mutex<HashMap<NodeId, Peer>>,
}

impl MemoryPeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer.
    pub fn insert(&self, peer: Peer) {
        self.peers.lock().unwrap().insert(peer.id, peer);
    }

    /// Remove a peer by id.
    pub fn remove(&self, id: &NodeId) -> Option<Peer> {
        self.peers.lock().unwrap().remove(id)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }
}

impl PeerTable for MemoryPeerTable {
    fn get_peer(&self, id: &NodeId) -> Option<Peer> {
        self.peers.lock().unwrap().get(id).cloned()
    }

    fn closest_peers(&self, target: &NodeId) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.lock().unwrap().values().cloned().collect();
        peers.sort_by_key(|peer| peer.id.distance(target));
        peers.truncate(CLOSEST_PEERS_LIMIT);
        peers
    }
}
