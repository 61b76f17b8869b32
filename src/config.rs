//! Configuration for the backhaul server daemon
//!
//! CLI arguments and environment variable handling using clap.

use std::net::SocketAddr;

use clap::Parser;
use uuid::Uuid;

use crate::cluster::{PeerServer, PoolConfig};
use crate::rpc::PROTOCOL_VERSION;
use crate::server::ServerConfig;
use crate::types::{BackhaulError, Result};

/// Backhaul - reverse-RPC fabric server
#[derive(Parser, Debug, Clone)]
#[command(name = "backhaul")]
#[command(about = "Control-plane server dispatching reverse RPCs to connected workers")]
pub struct Args {
    /// Unique identifier for this server instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on for worker and peer connections
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:7420")]
    pub listen: SocketAddr,

    /// Region identifier for this server (used in locator fan-out)
    #[arg(long, env = "REGION", default_value = "global")]
    pub region: String,

    /// Peer servers as "id@host:port" or "id@host:port@region", repeatable
    /// or comma-separated
    #[arg(long = "peer", env = "PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Dial timeout for peer connections in milliseconds
    #[arg(long, env = "DIAL_TIMEOUT_MS", default_value = "5000")]
    pub dial_timeout_ms: u64,

    /// Per-RPC timeout for peer calls in milliseconds
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value = "30000")]
    pub rpc_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration beyond what clap can express.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(BackhaulError::Config("region must not be empty".to_string()));
        }
        for spec in &self.peers {
            parse_peer(spec)?;
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            node_id: self.node_id,
            listen: self.listen,
            region: self.region.clone(),
            pool: PoolConfig {
                dial_timeout: std::time::Duration::from_millis(self.dial_timeout_ms),
                rpc_timeout: std::time::Duration::from_millis(self.rpc_timeout_ms),
            },
        }
    }

    /// Parsed peer list, including the entry for this server itself.
    pub fn peer_servers(&self) -> Result<Vec<PeerServer>> {
        let mut peers = vec![PeerServer {
            id: self.node_id.to_string(),
            addr: self.listen,
            region: self.region.clone(),
            major_version: PROTOCOL_VERSION,
            is_self: true,
        }];
        for spec in &self.peers {
            peers.push(parse_peer(spec)?);
        }
        Ok(peers)
    }
}

/// Parse "id@host:port" or "id@host:port@region".
pub fn parse_peer(spec: &str) -> Result<PeerServer> {
    let mut parts = spec.splitn(3, '@');
    let id = parts
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BackhaulError::Config(format!("peer '{}': missing id", spec)))?;
    let addr: SocketAddr = parts
        .next()
        .ok_or_else(|| BackhaulError::Config(format!("peer '{}': missing address", spec)))?
        .parse()
        .map_err(|e| BackhaulError::Config(format!("peer '{}': {}", spec, e)))?;
    let region = parts.next().unwrap_or("global").to_string();
    Ok(PeerServer {
        id: id.to_string(),
        addr,
        region,
        major_version: PROTOCOL_VERSION,
        is_self: false,
    })
}
