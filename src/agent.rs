//! Worker-side agent runtime
//!
//! Dials the control-plane server, registers the worker id over the fresh
//! session, then serves reverse-RPC substreams until the session dies and
//! reconnects with exponential backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::{
    HandlerRegistry, RegisterRequest, RegisterResponse, FABRIC_REGISTER, PROTOCOL_VERSION,
};
use crate::rpc::dispatch::node_rpc;
use crate::session::{MuxSession, YamuxSession};
use crate::types::{BackhaulError, Result};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: SocketAddr,
    pub node_id: String,
    pub region: String,
    pub dial_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl AgentConfig {
    pub fn new(server_addr: SocketAddr, node_id: impl Into<String>) -> Self {
        Self {
            server_addr,
            node_id: node_id.into(),
            region: "global".to_string(),
            dial_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// Worker agent: owns the handler registry served to the control plane.
pub struct Agent {
    config: AgentConfig,
    handlers: Arc<HandlerRegistry>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registry the control plane's reverse RPCs dispatch into. Register
    /// handlers before calling [`Agent::run`].
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Token that stops the run loop and closes the current session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect-serve-reconnect loop. Returns once shut down.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = self.config.initial_backoff;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match self.connect_and_serve().await {
                Ok(()) => {
                    debug!("session ended");
                    backoff = self.config.initial_backoff;
                }
                Err(e) => {
                    warn!(error = %e, server = %self.config.server_addr, "session failed");
                }
            }
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            debug!(delay = ?backoff, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    async fn connect_and_serve(&self) -> Result<()> {
        let stream = timeout(
            self.config.dial_timeout,
            TcpStream::connect(self.config.server_addr),
        )
        .await
        .map_err(|_| BackhaulError::Timeout(self.config.dial_timeout.as_millis() as u64))??;
        let _ = stream.set_nodelay(true);

        let (session, mut inbound) = YamuxSession::client(stream);

        // Identify ourselves before serving any dispatches.
        let request = RegisterRequest {
            node_id: self.config.node_id.clone(),
            region: self.config.region.clone(),
            major_version: PROTOCOL_VERSION,
        };
        let response: RegisterResponse =
            node_rpc(session.as_ref(), FABRIC_REGISTER, &request).await?;
        info!(
            node_id = %self.config.node_id,
            server_id = %response.server_id,
            region = %response.region,
            "registered with server"
        );

        loop {
            tokio::select! {
                next = inbound.recv() => match next {
                    Some(stream) => {
                        let handlers = Arc::clone(&self.handlers);
                        tokio::spawn(async move { handlers.serve_stream(stream).await });
                    }
                    None => return Ok(()),
                },
                _ = self.shutdown.cancelled() => {
                    session.close().await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_doubles_to_cap() {
        let config = AgentConfig::new("127.0.0.1:7420".parse().unwrap(), "node-1");
        let mut backoff = config.initial_backoff;
        let mut schedule = Vec::new();
        for _ in 0..12 {
            schedule.push(backoff);
            backoff = (backoff * 2).min(config.max_backoff);
        }
        assert_eq!(schedule[0], Duration::from_millis(100));
        assert_eq!(schedule[1], Duration::from_millis(200));
        assert!(schedule.iter().all(|d| *d <= config.max_backoff));
        assert_eq!(*schedule.last().unwrap(), config.max_backoff);
    }
}
