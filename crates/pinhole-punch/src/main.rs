//! pinhole-punch — command-line peer.
//!
//! Greets and registers with a rendezvous server, then punches through to
//! a target peer when one is named. Without a target it stays up and
//! answers punches from others.
//!
//! Usage: pinhole-punch <id> <server-addr> [target-id]

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{bail, Context, Result};

use pinhole_net::Client;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(id), Some(server)) = (args.next(), args.next()) else {
        bail!("usage: pinhole-punch <id> <server-addr> [target-id]");
    };
    let server_addr: SocketAddr = server
        .parse()
        .with_context(|| format!("invalid server address: {server}"))?;
    let target = args.next();

    let client = Client::builder(&id, server_addr)
        .on_registered(|id| tracing::info!(id, "registered"))
        .on_connecting(|peer| tracing::info!(peer, "connecting"))
        .on_connected(|peer| tracing::info!(peer, "connected"))
        .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .context("failed to bind local socket")?;
    tracing::info!(
        addr = %client.local_addr()?,
        public_key = hex::encode(&client.me().public_key),
        "client ready"
    );

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    client.start().await.context("failed to greet the server")?;

    match target {
        Some(peer_id) => {
            client
                .connect(&peer_id)
                .await
                .with_context(|| format!("punch to {peer_id} failed"))?;
            let secret = client
                .peer_secret(&peer_id)
                .context("connected but no secret bound")?;
            tracing::info!(
                peer = %peer_id,
                secret = hex::encode(&secret[..8]),
                "hole punched, shared secret bound"
            );
        }
        None => {
            tracing::info!("waiting for punches — ctrl-c to exit");
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for ctrl-c")?;
        }
    }

    client.shutdown();
    runner
        .await
        .context("dispatcher task panicked")?
        .context("dispatcher failed")?;
    Ok(())
}
