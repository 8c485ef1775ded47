//! The `cachew` daemon: a caching HTTP/1.1 forward proxy.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cachew::{Config, Proxy};

/// A caching HTTP/1.1 forward proxy with a two-tier memory and disk cache.
#[derive(Debug, Parser)]
#[command(name = "cachew", version, about)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    address: Option<std::net::IpAddr>,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Root directory of the on-disk cache.
    #[arg(long)]
    disk_cache: Option<PathBuf>,

    /// Root directory for local document serving.
    #[arg(long)]
    local_root: Option<PathBuf>,

    /// Never talk to the network; serve only what is cached.
    #[arg(long)]
    offline: bool,
}

fn main() -> cachew::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(address) = args.address {
        config.proxy_address = address;
    }
    if let Some(port) = args.port {
        config.proxy_port = port;
    }
    if let Some(root) = args.disk_cache {
        config.disk_cache_root = Some(root);
    }
    if let Some(root) = args.local_root {
        config.local_document_root = Some(root);
    }
    if args.offline {
        config.proxy_offline = true;
    }
    config.repair();

    // The engine is strictly single-threaded and cooperative.
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let proxy = Proxy::bind(config).await?;
        let core = proxy.core();
        tokio::select! {
            result = proxy.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, flushing the disk cache");
                core.flush();
                Ok(())
            }
        }
    })
}
