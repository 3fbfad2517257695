//! Stream Relay - Main Entry Point
//!
//! Peer-to-peer live media relay node.

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sr_relay::config::{Cli, Config};
use sr_relay::identity;
use sr_relay::relay::Relay;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli);

    // Initialize rustls crypto provider (required for WebRTC)
    // This must happen before any TLS/WebRTC operations
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let default_filter = if config.verbose {
        "sr_relay=debug,libp2p=info"
    } else {
        "sr_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting stream relay"
    );

    // Identity failures are the one thing worth dying for at startup.
    let keypair = identity::load_or_generate(&config.persist_dir, config.regen_identity)?;

    let cancel = CancellationToken::new();
    let relay = Relay::start(config, keypair, cancel.clone()).await?;
    info!(peer_id = %relay.local_peer_id(), "Relay running");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cleaning up...");
            shutdown.cancel();
        }
    });

    relay.run().await?;
    info!("Relay shutdown complete");
    Ok(())
}
