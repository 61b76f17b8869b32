//! Pooled client connections to peer servers
//!
//! One multiplexed session per peer address, dialed lazily and reused across
//! RPCs. Each RPC runs over a fresh substream with its own deadline; a
//! transport failure evicts the pooled session so the next call redials.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cluster::locator::{
    HasNodeConnRequest, HasNodeConnResponse, PeerQuery, STATUS_HAS_NODE_CONN,
};
use crate::cluster::PeerServer;
use crate::rpc::dispatch::node_rpc;
use crate::session::{MuxSession, YamuxSession};
use crate::types::{BackhaulError, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub dial_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Transport factory and cache for server-to-server RPC.
pub struct ConnPool {
    sessions: DashMap<SocketAddr, Arc<YamuxSession>>,
    config: PoolConfig,
}

impl ConnPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Perform a unary RPC against a peer server, dialing or reusing the
    /// pooled connection to it.
    pub async fn rpc<A, R>(&self, peer: &PeerServer, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let session = self.session_for(peer).await?;
        match timeout(
            self.config.rpc_timeout,
            node_rpc(session.as_ref(), method, args),
        )
        .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.evict(peer.addr, &session);
                Err(e)
            }
            Err(_) => {
                self.evict(peer.addr, &session);
                Err(BackhaulError::Timeout(
                    self.config.rpc_timeout.as_millis() as u64
                ))
            }
        }
    }

    /// Number of pooled sessions, for introspection.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    async fn session_for(&self, peer: &PeerServer) -> Result<Arc<YamuxSession>> {
        if let Some(existing) = self.sessions.get(&peer.addr) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing.value()));
            }
        }

        let stream = timeout(self.config.dial_timeout, TcpStream::connect(peer.addr))
            .await
            .map_err(|_| BackhaulError::Timeout(self.config.dial_timeout.as_millis() as u64))??;
        let _ = stream.set_nodelay(true);

        // Peer servers never open substreams back over a pooled connection,
        // so the inbound receiver is dropped.
        let (session, _inbound) = YamuxSession::client(stream);
        info!(
            peer = %peer.id,
            addr = %peer.addr,
            version = peer.major_version,
            "dialed peer server"
        );

        // Two callers may race the first dial; keep exactly one session.
        let (kept, extra) = match self.sessions.entry(peer.addr) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    occupied.insert(Arc::clone(&session));
                    (session, None)
                } else {
                    (Arc::clone(occupied.get()), Some(session))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&session));
                (session, None)
            }
        };
        if let Some(loser) = extra {
            debug!(addr = %peer.addr, "discarding duplicate peer session");
            loser.close().await;
        }
        Ok(kept)
    }

    fn evict(&self, addr: SocketAddr, session: &Arc<YamuxSession>) {
        let removed = self
            .sessions
            .remove_if(&addr, |_, stored| Arc::ptr_eq(stored, session));
        if removed.is_some() {
            debug!(%addr, "evicted pooled peer session");
        }
    }
}

#[async_trait]
impl PeerQuery for ConnPool {
    async fn has_node_conn(
        &self,
        peer: &PeerServer,
        req: &HasNodeConnRequest,
    ) -> Result<HasNodeConnResponse> {
        self.rpc(peer, STATUS_HAS_NODE_CONN, req).await
    }
}
