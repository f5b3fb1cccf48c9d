//! Elohim Files Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Main node with defaults
//! elohim-files
//!
//! # Main node with a cold tier
//! elohim-files --hot-dir /fast/files --cold-dir /bulk/files
//!
//! # Shard node pulling from the main node
//! elohim-files --main-url http://files-main:6200 --hot-dir /cache
//!
//! # Custom config
//! elohim-files --config /etc/elohim-files.toml
//! ```

use anyhow::Context;
use clap::Parser;
use elohim_files::catalog::Catalog;
use elohim_files::touch::spawn_remote_forwarder;
use elohim_files::{
    CachedFileProvider, CleanupConfig, CleanupEngine, Config, ContentStore, HttpOrigin, HttpServer,
    Metrics, NoOrigin, Origin, QueueConfig, RequestQueue, SledCatalog, TouchPropagator,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-files")]
#[command(about = "Tiered file distribution server for Elohim nodes")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ELOHIM_FILES_CONFIG")]
    config: Option<PathBuf>,

    /// Hot tier directory
    #[arg(long, env = "ELOHIM_FILES_HOT_DIR")]
    hot_dir: Option<PathBuf>,

    /// Cold tier directory (enables the cold tier)
    #[arg(long, env = "ELOHIM_FILES_COLD_DIR")]
    cold_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "ELOHIM_FILES_HTTP_PORT")]
    http_port: Option<u16>,

    /// Main file server URL (makes this node a shard)
    #[arg(long, env = "ELOHIM_FILES_MAIN_URL")]
    main_url: Option<String>,

    /// Shared secret for the internal API
    #[arg(long, env = "ELOHIM_FILES_INTERNAL_TOKEN", hide_env_values = true)]
    internal_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("elohim_files=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.hot_dir {
        config.hot_storage_dir = dir;
    }
    if let Some(dir) = args.cold_dir {
        config.cold_storage_dir = Some(dir);
        config.use_cold_storage = true;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if args.main_url.is_some() {
        config.main_url = args.main_url;
    }
    if args.internal_token.is_some() {
        config.internal_token = args.internal_token;
    }
    if config.use_cold_storage && config.cold_storage_dir.is_none() {
        anyhow::bail!("use_cold_storage is set but no cold_storage_dir is configured");
    }
    if config.hash_len == 0 {
        anyhow::bail!("hash_len must be at least 1");
    }

    info!(
        hot_dir = %config.hot_storage_dir.display(),
        cold_dir = ?config.cold_dir(),
        http_port = config.http_port,
        authoritative = config.is_authoritative(),
        "Starting elohim-files"
    );

    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let store = ContentStore::new(&config.hot_storage_dir, config.cold_dir(), config.hash_len).await?;

    // Only the main node reads and writes the catalog
    let catalog: Option<Arc<dyn Catalog>> = if config.is_authoritative() {
        let path = config.catalog_db_path();
        Some(Arc::new(SledCatalog::open(&path, config.hash_len)?) as Arc<dyn Catalog>)
    } else {
        None
    };

    let (origin, remote_touch) = match &config.main_url {
        Some(main_url) => {
            info!(main_url = %main_url, "Running as shard node");
            let origin = HttpOrigin::new(main_url.clone(), config.internal_token.clone())?;
            let forwarder = spawn_remote_forwarder(main_url, config.internal_token.clone(), shutdown.clone());
            (Arc::new(origin) as Arc<dyn Origin>, Some(forwarder))
        }
        None => (Arc::new(NoOrigin) as Arc<dyn Origin>, None),
    };

    let touch = Arc::new(TouchPropagator::new(
        store.cold().cloned(),
        remote_touch.as_ref().map(|handle| handle.sender.clone()),
        config.touch_debounce(),
        config.touch_sweep_every,
        metrics.clone(),
    ));

    let provider = Arc::new(CachedFileProvider::new(store.clone(), origin, touch.clone(), metrics.clone()));

    let queue = Arc::new(RequestQueue::new(
        QueueConfig {
            max_concurrent: config.max_concurrent_downloads,
            request_expiry: config.request_expiry(),
            active_timeout: config.active_timeout(),
            terminal_retention: config.terminal_retention(),
        },
        metrics.clone(),
    ));
    let sweeper = queue.spawn_sweeper(Duration::from_secs(5), shutdown.clone());

    let cleanup = Arc::new(CleanupEngine::new(
        store,
        catalog.clone(),
        CleanupConfig::from_config(&config),
        metrics.clone(),
    ));
    let cleanup_task = cleanup.spawn(shutdown.clone());

    let mut http_server = HttpServer::new(provider, queue, touch, metrics)
        .with_internal_token(config.internal_token.clone())
        .with_max_upload_bytes(config.max_upload_bytes);
    if let Some(catalog) = catalog {
        http_server = http_server.with_catalog(catalog);
    }
    let http_server = Arc::new(http_server);

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("HTTP API available at http://{}", http_addr);
    info!("Press Ctrl+C to stop.");

    tokio::select! {
        result = http_server.run(http_addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    shutdown.cancel();
    let _ = sweeper.await;
    let _ = cleanup_task.await;
    if let Some(handle) = remote_touch {
        drop(handle.sender);
        let _ = handle.task.await;
    }

    Ok(())
}
