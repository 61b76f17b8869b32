//! Backhaul - reverse-RPC fabric server

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backhaul::{Args, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("backhaul={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Backhaul - reverse-RPC fabric");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen:  {}", args.listen);
    info!("Region:  {}", args.region);
    info!("Peers:   {}", args.peers.len());

    let server = Server::new(args.server_config());
    for peer in args.peer_servers()? {
        info!(
            "  peer {} at {} ({}){}",
            peer.id,
            peer.addr,
            peer.region,
            if peer.is_self { " [self]" } else { "" }
        );
        server.roster().upsert(peer).await;
    }

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
