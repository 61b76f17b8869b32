//! Control-plane server runtime
//!
//! Accepts worker and peer connections, wraps each in a multiplexed session,
//! serves inbound substreams through the handler demux, and keeps the node
//! registry in step with connection lifecycles. All state is owned by the
//! server instance; nothing lives in process-wide singletons.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{ConnPool, Locator, PeerQuery, PeerRoster, PeerServer, PoolConfig};
use crate::cluster::locator::{HasNodeConnRequest, HasNodeConnResponse, STATUS_HAS_NODE_CONN};
use crate::registry::{ConnContext, NodeRegistry};
use crate::rpc::dispatch::node_streaming_rpc;
use crate::rpc::{
    bridge, HandlerRegistry, PingRequest, PingResponse, RegisterRequest, RegisterResponse,
    FABRIC_PING, FABRIC_REGISTER,
};
use crate::session::{BoxConn, MuxSession, YamuxSession};
use crate::types::{BackhaulError, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub node_id: Uuid,
    pub listen: SocketAddr,
    pub region: String,
    pub pool: PoolConfig,
}

/// One control-plane server instance.
pub struct Server {
    config: ServerConfig,
    registry: Arc<NodeRegistry>,
    roster: Arc<PeerRoster>,
    pool: Arc<ConnPool>,
    handlers: Arc<HandlerRegistry>,
    locator: Locator,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new());
        let roster = Arc::new(PeerRoster::new());
        let pool = Arc::new(ConnPool::new(config.pool.clone()));
        let handlers = Arc::new(HandlerRegistry::new());
        let locator = Locator::new(
            Arc::clone(&roster),
            Arc::clone(&pool) as Arc<dyn PeerQuery>,
            config.node_id.to_string(),
            config.region.clone(),
        );

        let server = Arc::new(Self {
            config,
            registry,
            roster,
            pool,
            handlers,
            locator,
        });
        server.register_builtin_handlers();
        server
    }

    fn register_builtin_handlers(&self) {
        let registry = Arc::clone(&self.registry);
        self.handlers
            .register_unary(STATUS_HAS_NODE_CONN, move |req: HasNodeConnRequest| {
                let registry = Arc::clone(&registry);
                async move {
                    let response = match registry.get(&req.node_id) {
                        Some(conn) => HasNodeConnResponse {
                            connected: true,
                            established: Some(conn.established),
                        },
                        None => HasNodeConnResponse {
                            connected: false,
                            established: None,
                        },
                    };
                    Ok::<_, String>(response)
                }
            });

        let node_id = self.config.node_id.to_string();
        self.handlers
            .register_unary(FABRIC_PING, move |_req: PingRequest| {
                let node_id = node_id.clone();
                async move { Ok::<_, String>(PingResponse { node_id }) }
            });
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let addr = listener.local_addr()?;
        info!(
            %addr,
            node_id = %self.config.node_id,
            region = %self.config.region,
            "backhaul server listening"
        );
        self.accept_loop(listener).await;
        Ok(())
    }

    /// Bind and serve in the background; returns the bound address.
    pub async fn listen(self: Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let addr = listener.local_addr()?;
        info!(
            %addr,
            node_id = %self.config.node_id,
            region = %self.config.region,
            "backhaul server listening"
        );
        tokio::spawn(async move { self.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, remote)) => {
                    debug!(%remote, "inbound connection");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle_connection(socket, remote).await });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Drive one inbound connection: serve its substreams, track the worker
    /// registration if one arrives, and clean the registry up afterwards.
    async fn handle_connection(self: Arc<Self>, socket: TcpStream, remote: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let (session, mut inbound) = YamuxSession::server(socket);
        let session: Arc<dyn MuxSession> = session;

        // Filled in by the registration handler; consulted at teardown.
        let identity: Arc<Mutex<Option<ConnContext>>> = Arc::new(Mutex::new(None));

        let conn_handlers = HandlerRegistry::scoped(Arc::clone(&self.handlers));
        {
            let registry = Arc::clone(&self.registry);
            let identity = Arc::clone(&identity);
            let session = Arc::clone(&session);
            let server_id = self.config.node_id.to_string();
            let region = self.config.region.clone();
            conn_handlers.register_unary(FABRIC_REGISTER, move |req: RegisterRequest| {
                let registry = Arc::clone(&registry);
                let identity = Arc::clone(&identity);
                let session = Arc::clone(&session);
                let server_id = server_id.clone();
                let region = region.clone();
                async move {
                    if req.node_id.is_empty() {
                        return Err("node id must not be empty".to_string());
                    }
                    let ctx = ConnContext {
                        node_id: Some(req.node_id.clone()),
                        session,
                    };
                    registry.add(&ctx);
                    *identity.lock().await = Some(ctx);
                    info!(
                        node_id = %req.node_id,
                        region = %req.region,
                        version = req.major_version,
                        "node registered"
                    );
                    Ok(RegisterResponse { server_id, region })
                }
            });
        }
        let conn_handlers = Arc::new(conn_handlers);

        while let Some(stream) = inbound.recv().await {
            let handlers = Arc::clone(&conn_handlers);
            tokio::spawn(async move { handlers.serve_stream(stream).await });
        }

        // Session driver ended; a stale context cannot evict a reconnect.
        if let Some(ctx) = identity.lock().await.take() {
            self.registry.remove(&ctx);
            info!(node_id = ?ctx.node_id, %remote, "node connection closed");
        } else {
            debug!(%remote, "connection closed");
        };
    }

    /// Relay an inbound byte stream to a locally-held worker session: open a
    /// streaming substream for `method` and splice the two together. Returns
    /// [`BackhaulError::NoNodeConn`] if this server does not hold the worker.
    pub async fn relay_to_node(
        &self,
        node_id: &str,
        method: &str,
        inbound: BoxConn,
    ) -> Result<(u64, u64)> {
        let conn = self
            .registry
            .get(node_id)
            .ok_or(BackhaulError::NoNodeConn)?;
        let outbound = node_streaming_rpc(conn.session.as_ref(), method).await?;
        Ok(bridge(inbound, outbound).await)
    }

    /// Which peer server most recently saw `node_id`. Check the local
    /// registry first; self is never queried.
    pub async fn server_with_node_conn(&self, node_id: &str) -> Result<PeerServer> {
        self.locator.server_with_node_conn(node_id).await
    }

    /// Session for a locally-connected worker, if any.
    pub fn node_session(&self, node_id: &str) -> Option<Arc<dyn MuxSession>> {
        self.registry.get(node_id).map(|conn| conn.session)
    }

    /// Worker id → establish time for every locally-held connection.
    pub fn connected_nodes(&self) -> HashMap<String, DateTime<Utc>> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn roster(&self) -> &Arc<PeerRoster> {
        &self.roster
    }

    pub fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn node_id(&self) -> Uuid {
        self.config.node_id
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }
}
