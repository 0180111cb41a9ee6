//! Service entry point: configuration, component wiring, and the axum
//! server hosting the rate-limiting pipeline.

mod abuse;
mod config;
mod directory;
mod engine;
mod health;
mod policy;
mod server;
mod store;
mod types;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LimiterConfig;
use crate::store::{SharedStore, StoreClient};
use crate::types::AppState;

/// How often the background probe pings the store.
const STORE_PING_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Configuration comes from the first CLI argument, the RATEGATE_CONFIG
    // environment variable, or falls back to the built-in demo tables.
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var("RATEGATE_CONFIG").ok().map(PathBuf::from));

    let config = LimiterConfig::load(config_path.as_deref())?;
    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.listen))?;

    let store = Arc::new(StoreClient::connect(&config.store)?);
    spawn_store_monitor(store.clone());

    let state = Arc::new(AppState::new(&config, store.clone(), config_path));
    let router = server::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "rate limiter listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    store.close();
    info!("shutdown complete");
    Ok(())
}

/// Periodic store liveness probe.
///
/// Also serves as the recovery probe: once an open circuit breaker's reset
/// timeout lapses, the next ping is the half-open trial call that closes it
/// again on success.
fn spawn_store_monitor(store: Arc<StoreClient>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORE_PING_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(err) = store.ping().await {
                warn!(error = %err, "store health check failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
