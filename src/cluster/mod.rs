//! Cluster membership view and peer RPC plumbing
//!
//! Membership itself is supplied externally (static config today); this
//! module holds the roster snapshot the locator iterates, the pooled client
//! connections used for peer fan-out, and the locator that picks which peer
//! server owns a worker.

pub mod locator;
pub mod pool;

pub use locator::{
    HasNodeConnRequest, HasNodeConnResponse, Locator, PeerQuery, STATUS_HAS_NODE_CONN,
};
pub use pool::{ConnPool, PoolConfig};

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A peer control-plane server in the same cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerServer {
    /// Stable identity, independent of the address the peer is reachable at.
    pub id: String,
    pub addr: SocketAddr,
    pub region: String,
    pub major_version: u16,
    /// Whether this entry describes the local server.
    pub is_self: bool,
}

/// Known peer servers, keyed by identity.
#[derive(Default)]
pub struct PeerRoster {
    peers: RwLock<HashMap<String, PeerServer>>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer entry.
    pub async fn upsert(&self, peer: PeerServer) {
        self.peers.write().await.insert(peer.id.clone(), peer);
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.peers.write().await.remove(id).is_some()
    }

    /// Copy of the current peer list, ordered by identity so iteration is
    /// stable across calls.
    pub async fn snapshot(&self) -> Vec<PeerServer> {
        let mut peers: Vec<PeerServer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}
