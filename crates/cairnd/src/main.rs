//! cairnd — Cairn mesh-metadata gossip daemon.

use std::path::Path;

use anyhow::{Context, Result};

use cairn_core::config::CairnConfig;
use cairnd::{stream, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = CairnConfig::load().context("loading configuration")?;
    let daemon = config.daemon;
    tracing::info!(
        mode = daemon.mode,
        interfaces = ?daemon.interfaces,
        "cairnd starting"
    );

    let server = Server::new(daemon.clone());

    for ifname in &daemon.interfaces {
        server
            .clone()
            .bind_interface(ifname)
            .with_context(|| format!("binding interface '{ifname}'"))?;
    }

    if !daemon.listen_tcp.is_empty() {
        stream::spawn_tcp_listener(server.clone(), &daemon.listen_tcp).await?;
    }
    if !daemon.listen_unix.is_empty() {
        stream::spawn_unix_listener(server.clone(), Path::new(&daemon.listen_unix))?;
    }
    if daemon.interfaces.is_empty() {
        tracing::warn!("no interfaces configured; gossip fabric is not reachable");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    server.shutdown();
    Ok(())
}
