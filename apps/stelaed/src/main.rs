use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};
use url::Url;

use stelae_core::config::Config;
use stelae_core::paths::Homes;
use stelae_mcp::{Downstream, HttpDownstream, HttpDownstreamOptions};

use stelaed::app;

#[derive(Debug, Parser)]
#[command(name = "stelaed", version, about = "Aggregating MCP gateway facade")]
struct Args {
    /// Path to the gateway config file.
    #[arg(long, env = "STELAE_CONFIG")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long, env = "STELAE_LISTEN")]
    listen: Option<SocketAddr>,
}

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let homes = Homes::from_env();

    let mut downstreams: Vec<(String, stelae_core::ServerOptions, Arc<dyn Downstream>)> =
        Vec::new();
    for (name, server) in &config.mcp_servers {
        let endpoint = Url::parse(&server.url)
            .with_context(|| format!("parse url for server {name}"))?;
        let mut opts = HttpDownstreamOptions::new(endpoint, server.transport);
        opts.timeout = Duration::from_secs(server.options.timeout_secs.unwrap_or(30).max(5));
        let client = HttpDownstream::new(opts)
            .with_context(|| format!("build client for server {name}"))?;
        downstreams.push((name.clone(), server.options.clone(), Arc::new(client)));
    }

    let addr: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => config
            .mcp_proxy
            .addr
            .parse()
            .with_context(|| format!("parse listen addr {:?}", config.mcp_proxy.addr))?,
    };

    let state = app::new_state(config, homes)?;
    tokio::spawn(app::connect_all(state.clone(), downstreams));

    let router = app::router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, endpoint = %state.mcp_path(), "facade listening");

    let shutdown = Arc::new(Notify::new());
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.notify_waiters();

    match tokio::time::timeout(SHUTDOWN_DEADLINE, server).await {
        Ok(joined) => joined.context("server task")?.context("serve")?,
        Err(_) => warn!("graceful shutdown deadline exceeded; exiting"),
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
