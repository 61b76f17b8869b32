//! Backhaul - reverse-RPC fabric for control planes
//!
//! Workers behind NAT or firewalls cannot be dialed directly, so each worker
//! opens one long-lived TCP connection to a control-plane server and
//! multiplexes logical substreams over it. Any server in the cluster can then
//! dispatch unary or streaming calls *back* to any connected worker.
//!
//! ## Services
//!
//! - **Session**: multiplexed connection abstraction over yamux, one per worker
//! - **Registry**: in-memory table of worker id → live session + establish time
//! - **Locator**: fan-out query asking peer servers which one holds a worker
//! - **Dispatcher**: unary and streaming substream protocols with a mode byte
//! - **Bridge**: full-duplex byte splice between two connections
//! - **Server / Agent**: accept-loop and worker-side runtimes wiring it together

pub mod agent;
pub mod cluster;
pub mod config;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod types;

pub use agent::{Agent, AgentConfig};
pub use cluster::{ConnPool, Locator, PeerRoster, PeerServer, PoolConfig};
pub use config::Args;
pub use registry::{ConnContext, NodeConn, NodeRegistry};
pub use rpc::{bridge, node_rpc, node_streaming_rpc, HandlerRegistry, StreamMode};
pub use server::{Server, ServerConfig};
pub use session::{BoxConn, MuxSession, YamuxSession};
pub use types::{BackhaulError, Result};
