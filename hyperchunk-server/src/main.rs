//! HyperChunk Server - HTTP API for hypertable partitioning

mod api;
mod protocol;

use anyhow::Context;
use hyperchunk_core::catalog::{Catalog, CatalogConfig};
use hyperchunk_core::hypertable::EngineConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Catalog journal directory; in-memory catalog when unset
    pub data_dir: Option<PathBuf>,
    /// Boundary cache entries per hypertable
    pub cache_capacity: usize,
    /// Hypertable lock wait in milliseconds
    pub lock_timeout_ms: u64,
    /// Emit JSON log lines
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 7432)),
            data_dir: Some(PathBuf::from("data")),
            cache_capacity: hyperchunk_core::config::DEFAULT_CACHE_CAPACITY,
            lock_timeout_ms: hyperchunk_core::config::LOCK_TIMEOUT_MS,
            json_logs: false,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `HYPERCHUNK_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("HYPERCHUNK_HTTP_ADDR") {
            config.http_addr = addr
                .parse()
                .with_context(|| format!("invalid HYPERCHUNK_HTTP_ADDR {:?}", addr))?;
        }
        if let Ok(dir) = std::env::var("HYPERCHUNK_DATA_DIR") {
            config.data_dir = if dir.is_empty() { None } else { Some(PathBuf::from(dir)) };
        }
        if let Ok(capacity) = std::env::var("HYPERCHUNK_CACHE_CAPACITY") {
            config.cache_capacity = capacity
                .parse()
                .with_context(|| format!("invalid HYPERCHUNK_CACHE_CAPACITY {:?}", capacity))?;
        }
        if let Ok(timeout) = std::env::var("HYPERCHUNK_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = timeout
                .parse()
                .with_context(|| format!("invalid HYPERCHUNK_LOCK_TIMEOUT_MS {:?}", timeout))?;
        }
        if let Ok(format) = std::env::var("HYPERCHUNK_LOG_FORMAT") {
            config.json_logs = format.eq_ignore_ascii_case("json");
        }
        Ok(config)
    }

    fn catalog_config(&self) -> CatalogConfig {
        CatalogConfig {
            dir: self.data_dir.clone(),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            ..Default::default()
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_capacity: self.cache_capacity,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    // Initialize logging, RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if config.json_logs {
        builder.json().init();
    } else {
        builder.pretty().init();
    }

    info!("Starting HyperChunk server...");
    info!("Catalog directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    // Open the catalog, replaying its journal
    let catalog = Catalog::open(config.catalog_config()).context("failed to open catalog")?;
    let catalog = Arc::new(catalog);
    let state = Arc::new(api::AppState::new(catalog.clone(), config.engine_config()));

    // Create router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HyperChunk server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    catalog.sync()?;
    info!("Catalog synced, shutting down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
}
