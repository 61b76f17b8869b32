//! Substream dispatch protocols
//!
//! Every new substream starts with a one-byte mode selector, then speaks
//! either the length-prefixed unary codec or a streaming handshake followed
//! by opaque bytes. Both servers and workers run the same demultiplexer on
//! their inbound substreams.

pub mod bridge;
pub mod codec;
pub mod dispatch;
pub mod handlers;

pub use bridge::bridge;
pub use codec::{RequestHeader, ResponseHeader, StreamingHeader};
pub use dispatch::{node_rpc, node_streaming_rpc, StreamMode};
pub use handlers::HandlerRegistry;

use serde::{Deserialize, Serialize};

/// Wire protocol major version, exchanged at registration for diagnostics.
pub const PROTOCOL_VERSION: u16 = 1;

/// Worker handshake method: binds a worker id to the connection's session.
pub const FABRIC_REGISTER: &str = "Fabric.Register";

/// Liveness echo, served by both servers and workers.
pub const FABRIC_PING: &str = "Fabric.Ping";

/// Registration payload sent by a worker right after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub region: String,
    pub major_version: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Identity of the server that accepted the registration.
    pub server_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    /// Identity of the answering endpoint.
    pub node_id: String,
}
