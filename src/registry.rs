//! Node connection registry
//!
//! Tracks which workers hold a live multiplexed session to this server and
//! when each session was established. The establish time is what peer
//! servers compare during locator fan-out, so it only needs to be internally
//! consistent on this server.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::session::MuxSession;

/// Connection state for one registered worker. Immutable once inserted;
/// replaced wholesale on reconnect.
#[derive(Clone)]
pub struct NodeConn {
    /// Session for dialing back to the worker.
    pub session: Arc<dyn MuxSession>,
    /// When the connection was established.
    pub established: DateTime<Utc>,
}

/// Identity attached to an inbound transport handshake.
///
/// `node_id` is `None` until the peer registers as a worker; peer servers and
/// CLI callers never do, so their contexts never touch the registry.
#[derive(Clone)]
pub struct ConnContext {
    pub node_id: Option<String>,
    pub session: Arc<dyn MuxSession>,
}

/// Worker id → live session table with concurrent readers.
#[derive(Default)]
pub struct NodeRegistry {
    conns: DashMap<String, NodeConn>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    /// Look up the connection for a worker.
    pub fn get(&self, node_id: &str) -> Option<NodeConn> {
        self.conns.get(node_id).map(|entry| entry.value().clone())
    }

    /// Copy of the current worker id → establish time map. Later mutations
    /// do not affect the returned map.
    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.conns
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().established))
            .collect()
    }

    /// Register the session carried by `ctx`, superseding any prior entry for
    /// the same worker. A context without a non-empty node id is a no-op.
    pub fn add(&self, ctx: &ConnContext) {
        let Some(node_id) = ctx.node_id.as_deref() else {
            return;
        };
        if node_id.is_empty() {
            return;
        }
        self.conns.insert(
            node_id.to_string(),
            NodeConn {
                session: Arc::clone(&ctx.session),
                established: Utc::now(),
            },
        );
        debug!(%node_id, total = self.conns.len(), "node connection registered");
    }

    /// Remove the mapping for the worker in `ctx`, but only while it still
    /// points at the same session. A stale remove racing a reconnect must not
    /// evict the fresh entry.
    pub fn remove(&self, ctx: &ConnContext) {
        let Some(node_id) = ctx.node_id.as_deref() else {
            return;
        };
        if node_id.is_empty() {
            return;
        }
        let removed = self
            .conns
            .remove_if(node_id, |_, conn| Arc::ptr_eq(&conn.session, &ctx.session));
        if removed.is_some() {
            debug!(%node_id, total = self.conns.len(), "node connection removed");
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BoxConn;
    use crate::types::{BackhaulError, Result};
    use async_trait::async_trait;

    struct NullSession;

    #[async_trait]
    impl MuxSession for NullSession {
        async fn open(&self) -> Result<BoxConn> {
            Err(BackhaulError::Session("null session".to_string()))
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            true
        }
    }

    fn ctx(node_id: Option<&str>) -> ConnContext {
        ConnContext {
            node_id: node_id.map(String::from),
            session: Arc::new(NullSession),
        }
    }

    #[test]
    fn test_add_and_get() {
        let registry = NodeRegistry::new();
        let ctx = ctx(Some("node-1"));

        registry.add(&ctx);

        let conn = registry.get("node-1").expect("entry present");
        assert!(Arc::ptr_eq(&conn.session, &ctx.session));
        assert!(registry.get("node-2").is_none());
    }

    #[test]
    fn test_reconnect_supersedes_prior_entry() {
        let registry = NodeRegistry::new();
        let first = ctx(Some("node-1"));
        let second = ctx(Some("node-1"));

        registry.add(&first);
        let before = registry.get("node-1").unwrap().established;
        registry.add(&second);

        let conn = registry.get("node-1").unwrap();
        assert!(Arc::ptr_eq(&conn.session, &second.session));
        assert!(conn.established >= before);
        assert_eq!(registry.len(), 1, "overwrite must not duplicate the entry");
    }

    #[test]
    fn test_empty_node_id_is_a_noop() {
        let registry = NodeRegistry::new();

        registry.add(&ctx(Some("")));
        registry.add(&ctx(None));
        assert!(registry.is_empty());

        registry.add(&ctx(Some("node-1")));
        registry.remove(&ctx(Some("")));
        registry.remove(&ctx(None));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = NodeRegistry::new();
        let ctx = ctx(Some("node-1"));

        registry.add(&ctx);
        registry.remove(&ctx);
        registry.remove(&ctx);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_remove_does_not_evict_fresh_session() {
        let registry = NodeRegistry::new();
        let old = ctx(Some("node-1"));
        let new = ctx(Some("node-1"));

        registry.add(&old);
        registry.add(&new);

        // The old connection's teardown races in after the reconnect.
        registry.remove(&old);

        let conn = registry.get("node-1").expect("fresh entry must survive");
        assert!(Arc::ptr_eq(&conn.session, &new.session));

        registry.remove(&new);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let registry = NodeRegistry::new();
        registry.add(&ctx(Some("node-1")));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);

        registry.add(&ctx(Some("node-2")));
        registry.remove(&ctx(Some("node-1")));

        assert_eq!(snapshot.len(), 1, "snapshot must not track later mutations");
        assert!(snapshot.contains_key("node-1"));
    }

    #[test]
    fn test_concurrent_adds_leave_exactly_one_winner() {
        let registry = Arc::new(NodeRegistry::new());
        let contexts: Vec<ConnContext> = (0..8).map(|_| ctx(Some("node-1"))).collect();

        let handles: Vec<_> = contexts
            .iter()
            .map(|c| {
                let registry = Arc::clone(&registry);
                let c = c.clone();
                std::thread::spawn(move || registry.add(&c))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
        let winner = registry.get("node-1").unwrap();
        assert!(
            contexts
                .iter()
                .any(|c| Arc::ptr_eq(&c.session, &winner.session)),
            "winning session must be one of the inserted sessions"
        );
    }
}
