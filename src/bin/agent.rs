//! Backhaul agent - worker-side daemon
//!
//! Run this on each worker node. It opens the outbound connection to a
//! backhaul server, registers, and serves reverse RPCs: a liveness ping and
//! a byte-echo stream useful for smoke-testing a deployment.
//!
//! Usage:
//!   backhaul-agent --server 10.0.0.1:7420 --node-id worker-7

use std::net::SocketAddr;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use backhaul::rpc::{PingRequest, PingResponse, FABRIC_PING};
use backhaul::{Agent, AgentConfig};

#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Worker agent serving reverse RPCs from a backhaul server")]
struct Args {
    /// Backhaul server address
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:7420")]
    server: SocketAddr,

    /// Worker identifier (auto-generated if not provided)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Region identifier
    #[arg(long, env = "REGION", default_value = "global")]
    region: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("backhaul={},info", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let node_id = args
        .node_id
        .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    info!("Backhaul agent starting");
    info!("Server:  {}", args.server);
    info!("Node ID: {}", node_id);
    info!("Region:  {}", args.region);

    let agent = Agent::new(AgentConfig::new(args.server, node_id.clone()).with_region(args.region));

    let ping_id = node_id.clone();
    agent
        .handlers()
        .register_unary(FABRIC_PING, move |_req: PingRequest| {
            let node_id = ping_id.clone();
            async move { Ok::<_, String>(PingResponse { node_id }) }
        });

    agent.handlers().register_streaming("Fabric.Echo", |conn| async move {
        let (mut read, mut write) = tokio::io::split(conn);
        if let Err(e) = tokio::io::copy(&mut read, &mut write).await {
            debug!(error = %e, "echo stream ended");
        }
        let _ = write.shutdown().await;
    });

    if let Err(e) = agent.run().await {
        error!("agent error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
