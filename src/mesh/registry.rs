//! Discovered peer registry for the local-network transport
//!
//! Populated by announce datagrams and aged out by the announce timer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

// ─────────────────────────────────────────────────────────────────
// Discovered Peer
// ─────────────────────────────────────────────────────────────────

/// A peer heard on the discovery port
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Peer identity
    pub id: String,

    /// Display name from the announce
    pub name: String,

    /// Data address (announce source ip + announced port)
    pub addr: SocketAddr,

    /// Last time an announce arrived
    pub last_seen: Instant,
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe table of discovered peers
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, DiscoveredPeer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer. Returns true if it was not known.
    pub fn upsert(&self, id: &str, name: &str, addr: SocketAddr) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(peer) => {
                peer.name = name.to_string();
                peer.addr = addr;
                peer.last_seen = Instant::now();
                false
            }
            None => {
                peers.insert(
                    id.to_string(),
                    DiscoveredPeer {
                        id: id.to_string(),
                        name: name.to_string(),
                        addr,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<DiscoveredPeer> {
        self.peers.read().get(id).cloned()
    }

    pub fn all_peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Remove peers not refreshed within `ttl`, returning them
    pub fn prune_stale(&self, ttl: Duration) -> Vec<DiscoveredPeer> {
        let mut peers = self.peers.write();
        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        stale.iter().filter_map(|id| peers.remove(id)).collect()
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
