use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http::StatusCode;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vms_proxy::{
    shim_router, AllowOrigin, CorsOptions, ProxyOptions, ShimConfig, DEFAULT_ALLOW_ORIGIN,
    DEFAULT_PREFIX, DEFAULT_UPSTREAM,
};

/// CORS-enabled reverse proxy shim for a local VM backend.
#[derive(Debug, Parser)]
#[command(name = "vms-proxy", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "VMS_PROXY_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Path prefix relayed to the upstream.
    #[arg(long, env = "VMS_PROXY_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Upstream base URL.
    #[arg(long, env = "VMS_PROXY_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// Allowed CORS origin. Repeat for a list, pass '*' to allow any.
    #[arg(long = "allow-origin", env = "VMS_PROXY_ALLOW_ORIGIN", default_value = DEFAULT_ALLOW_ORIGIN)]
    allow_origin: Vec<String>,

    /// Status code answered on successful preflights.
    #[arg(long, default_value_t = 200)]
    preflight_status: u16,

    /// Upstream response deadline in seconds. Unbounded when omitted.
    #[arg(long)]
    upstream_timeout_secs: Option<u64>,
}

fn resolve_origin(mut values: Vec<String>) -> AllowOrigin {
    if values.iter().any(|v| v == "*") {
        return AllowOrigin::Any;
    }
    if values.len() == 1 {
        return AllowOrigin::Exact(values.swap_remove(0));
    }
    AllowOrigin::List(values)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal err={}", err);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let preflight_status = StatusCode::from_u16(cli.preflight_status)
        .context("preflight status must be a valid HTTP status code")?;

    let config = ShimConfig {
        listen_addr: cli.listen,
        prefix: cli.prefix,
        upstream: cli.upstream,
        cors: CorsOptions {
            origin: resolve_origin(cli.allow_origin),
            preflight_status,
            ..CorsOptions::default()
        },
        proxy: ProxyOptions {
            upstream_timeout: cli.upstream_timeout_secs.map(Duration::from_secs),
            ..ProxyOptions::default()
        },
    };

    let app = shim_router(&config).context("invalid shim configuration")?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        "CORS-enabled proxy listening at http://{} forwarding {} to {}",
        listener.local_addr()?,
        config.prefix,
        config.upstream
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
