mod auth;
mod authority;
mod config;
mod git;
mod health;
mod http;
mod metrics;
mod quota;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::cache::PermissionCache;
use crate::auth::gate::AccessGate;
use crate::auth::resolver::{Clock, PermissionResolver, SystemClock};
use crate::authority::{Authority, MeteredAuthority};
use crate::config::Config;
use crate::git::http_backend::HttpBackend;
use crate::git::GitBackend;
use crate::metrics::MetricsRegistry;
use crate::quota::QuotaGate;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ledgergit", about = "Git smart-HTTP gateway with ledger-backed permissions")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/ledgergit/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub gate: Arc<AccessGate>,
    /// Runs allowed requests; `git http-backend` in production.
    pub git: Arc<dyn GitBackend>,
    pub authority: Arc<dyn Authority>,
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_state(config: Arc<Config>) -> Result<AppState> {
    let metrics = MetricsRegistry::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let authority: Arc<dyn Authority> = Arc::new(MeteredAuthority::new(
        authority::build_authority(&config)?,
        metrics.metrics.authority_calls.clone(),
    ));
    tracing::info!(
        rpc_url = %config.authority.rpc_url,
        contract = %config.authority.contract_id,
        "permission authority configured"
    );

    let token_ttl = Duration::from_secs(config.auth.token_ttl_secs);
    let resolver = PermissionResolver::new(
        Arc::clone(&authority),
        Arc::clone(&clock),
        token_ttl,
        Duration::from_millis(config.auth.max_clock_skew_ms),
    );
    let cache = PermissionCache::new(token_ttl, clock).with_counters(
        metrics.metrics.permission_cache_hits.clone(),
        metrics.metrics.permission_cache_misses.clone(),
    );
    let gate = AccessGate::new(
        Arc::new(cache),
        resolver,
        QuotaGate::new(&config.quota),
        config.git.project_root.clone(),
    )
    .with_metrics(Arc::clone(&metrics.metrics));

    Ok(AppState {
        git: Arc::new(HttpBackend::new(&config.git)),
        gate: Arc::new(gate),
        authority,
        metrics,
        config,
    })
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting ledgergit");

    if !config.git.project_root.is_dir() {
        tracing::warn!(
            project_root = %config.git.project_root.display(),
            "git project root does not exist yet"
        );
    }

    // ---- App state ----
    let state = build_state(config)?;

    // ---- Serve until shutdown ----
    run_http_server(state).await?;

    tracing::info!("ledgergit shut down cleanly");
    Ok(())
}
