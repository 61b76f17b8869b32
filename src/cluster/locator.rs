//! Worker session locator
//!
//! A server that lacks a direct session to a worker asks every peer server
//! which of them holds one, and routes to the peer with the most recently
//! established session. The locator is best-effort: it never retries, and a
//! single flaky peer cannot poison the lookup for a routable worker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::{PeerRoster, PeerServer};
use crate::types::{BackhaulError, FanoutErrors, Result};

/// Fan-out RPC method answered from each peer's local registry.
pub const STATUS_HAS_NODE_CONN: &str = "Status.HasNodeConn";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasNodeConnRequest {
    pub region: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasNodeConnResponse {
    pub connected: bool,
    /// Unset when `connected` is false.
    pub established: Option<DateTime<Utc>>,
}

/// Seam over the peer RPC path so the locator's decision logic is testable
/// without live connections.
#[async_trait]
pub trait PeerQuery: Send + Sync {
    async fn has_node_conn(
        &self,
        peer: &PeerServer,
        req: &HasNodeConnRequest,
    ) -> Result<HasNodeConnResponse>;
}

/// Resolves which peer server holds the most recent session to a worker.
pub struct Locator {
    roster: Arc<PeerRoster>,
    query: Arc<dyn PeerQuery>,
    local_id: String,
    region: String,
}

impl Locator {
    pub fn new(
        roster: Arc<PeerRoster>,
        query: Arc<dyn PeerQuery>,
        local_id: String,
        region: String,
    ) -> Self {
        Self {
            roster,
            query,
            local_id,
            region,
        }
    }

    /// Ask every peer (never self) whether it holds a session to `node_id`
    /// and return the one with the strictly most recent establish time.
    ///
    /// Per-peer failures are collected, and discarded entirely if any peer
    /// reports a connection. With no winner, the aggregate error is returned
    /// if there were failures, otherwise [`BackhaulError::NoNodeConn`].
    /// Callers are expected to have checked their local registry first.
    pub async fn server_with_node_conn(&self, node_id: &str) -> Result<PeerServer> {
        let peers = self.roster.snapshot().await;
        let req = HasNodeConnRequest {
            region: self.region.clone(),
            node_id: node_id.to_string(),
        };

        let candidates: Vec<PeerServer> = peers
            .into_iter()
            .filter(|peer| !peer.is_self && peer.id != self.local_id)
            .collect();

        // Parallel fan-out; the ordered join keeps the tie-break stable.
        let calls: Vec<_> = candidates
            .iter()
            .map(|peer| self.query.has_node_conn(peer, &req))
            .collect();
        let responses = future::join_all(calls).await;

        let mut most_recent: Option<(PeerServer, DateTime<Utc>)> = None;
        let mut failures: Vec<String> = Vec::new();

        for (peer, response) in candidates.iter().zip(responses) {
            match response {
                Ok(resp) if resp.connected => {
                    let established = resp.established.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let supersedes = match &most_recent {
                        Some((_, best)) => established > *best,
                        None => true,
                    };
                    if supersedes {
                        most_recent = Some((peer.clone(), established));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    failures.push(format!("failed querying server {}: {}", peer.addr, e));
                }
            }
        }

        match most_recent {
            Some((peer, established)) => {
                debug!(
                    %node_id,
                    peer = %peer.id,
                    %established,
                    "located node connection"
                );
                Ok(peer)
            }
            None if !failures.is_empty() => Err(FanoutErrors { errors: failures }.into()),
            None => Err(BackhaulError::NoNodeConn),
        }
    }
}
