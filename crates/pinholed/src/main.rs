//! pinholed — UDP hole-punching rendezvous server daemon.

use anyhow::{Context, Result};

use pinhole_core::crypto::Keypair;
use pinhole_net::RendezvousServer;

mod config;

use config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DaemonConfig::load().context("failed to load configuration")?;

    // The registry is in-memory; a restart starts empty and clients
    // re-greet to be rediscovered.
    let keypair = Keypair::generate();
    tracing::info!(public_key = hex::encode(keypair.public), "keypair ready");

    let server = RendezvousServer::bind(config.listen, keypair)
        .await
        .context("failed to bind rendezvous socket")?;
    tracing::info!(addr = %server.local_addr()?, "pinholed listening");

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    tracing::info!("shutting down");
    server.shutdown();
    runner
        .await
        .context("dispatcher task panicked")?
        .context("dispatcher failed")?;

    Ok(())
}
