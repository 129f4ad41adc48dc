//! weftd - the per-host overlay datapath daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weft::backend::{Backend, ExternalInterface};
use weft::config::DaemonConfig;
use weft::subnet::StaticLeaseSource;

#[derive(Parser, Debug)]
#[command(name = "weftd")]
#[command(about = "Host-resident UDP overlay datapath for container fabrics")]
struct Args {
    /// Path to the daemon config file (JSON)
    #[arg(short, long, default_value = "/etc/weftd.json")]
    config: PathBuf,

    /// Overlay network name
    #[arg(short, long, default_value = "weft")]
    netname: String,

    /// Address of the external interface the overlay UDP socket binds to
    #[arg(long)]
    iface_addr: std::net::Ipv4Addr,

    /// Physical MTU of the external interface
    #[arg(long, default_value = "1500")]
    mtu: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "starting weftd");

    let config = DaemonConfig::load(&args.config)?;

    let lease_source = Arc::new(StaticLeaseSource::new(config.subnet, config.peers.clone()));
    let backend = Backend::new(
        lease_source,
        ExternalInterface {
            iface_addr: args.iface_addr,
            public_addr: config.public_ip,
            mtu: args.mtu,
        },
    );

    let token = CancellationToken::new();
    let (network, mut workers) = backend
        .register_network(&args.netname, config.network, &config.backend, &token)
        .await
        .context("registering overlay network")?;

    let network_token = token.clone();
    workers.push(tokio::spawn(async move {
        network.run(network_token).await;
    }));

    wait_for_shutdown_signal().await;
    info!("shutting down");
    token.cancel();

    for handle in workers {
        if let Err(err) = handle.await {
            error!(error = %err, "worker join failed");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "installing SIGTERM handler");
            // Fall back to ctrl-c alone.
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "waiting for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "waiting for ctrl-c");
            }
        }
        _ = sigterm.recv() => {}
    }
}
