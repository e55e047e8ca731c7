//! BlockDepot -- storage coordination server.
//!
//! The process holds no state of its own: everything durable lives in
//! the storage backend, so every startup is cold and shutdown only
//! stops accepting connections and drains in-flight requests.
//! Unfinished upload sessions survive restarts and are reclaimed by the
//! background sweep.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics::counter;
use tracing::{info, warn};

use blockdepot::coordinator::download::DownloadCoordinator;
use blockdepot::coordinator::manifest::ManifestService;
use blockdepot::coordinator::upload::UploadCoordinator;
use blockdepot::grants::GrantSigner;
use blockdepot::metrics::UPLOADS_REAPED_TOTAL;
use blockdepot::storage::adapter::StorageAdapter;

/// Command-line arguments for the BlockDepot server.
#[derive(Parser, Debug)]
#[command(name = "blockdepot", version, about = "Storage coordination server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "blockdepot.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings live in the config file, so load it first;
    // RUST_LOG still wins when set.
    let config = blockdepot::config::load_config(&cli.config)?;
    init_logging(&config.logging);
    info!("Configuration loaded from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Recorder before anything records; described once, at startup.
    if config.observability.metrics {
        blockdepot::metrics::init_metrics();
        blockdepot::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // HMAC signer for locally issued grant URLs.
    let grants = GrantSigner::new(&config.grants.secret, &config.server.public_base_url);

    let storage: Arc<dyn StorageAdapter> =
        blockdepot::storage::build_adapter(&config, grants.clone()).await?;

    // Coordinators share the adapter; TTLs come from the grant config.
    let uploads = UploadCoordinator::new(
        storage.clone(),
        Duration::from_secs(config.grants.upload_url_ttl_seconds),
    );
    let downloads = DownloadCoordinator::new(
        storage.clone(),
        Duration::from_secs(config.grants.download_url_ttl_seconds),
    );
    let manifests = ManifestService::new(storage.clone());

    let state = Arc::new(blockdepot::AppState {
        config: config.clone(),
        storage,
        grants,
        uploads,
        downloads,
        manifests,
    });

    spawn_upload_reaper(&state);

    let app = blockdepot::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("BlockDepot listening on {}", bind_addr);

    // SIGTERM/SIGINT stop the accept loop; in-flight requests drain.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("BlockDepot shut down");

    Ok(())
}

/// Initialize tracing.  `RUST_LOG` overrides the configured level; the
/// `json` format switches to structured output for log shippers.
fn init_logging(config: &blockdepot::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Periodically reclaim upload sessions older than the configured TTL.
/// A zero interval disables the sweep.
fn spawn_upload_reaper(state: &Arc<blockdepot::AppState>) {
    let interval = state.config.uploads.gc_interval_seconds;
    if interval == 0 {
        info!("Upload reaper disabled (gc_interval_seconds = 0)");
        return;
    }
    let session_ttl = Duration::from_secs(state.config.uploads.session_ttl_seconds);
    let storage = state.storage.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.reap_stale_uploads(session_ttl).await {
                Ok(0) => {}
                Ok(count) => {
                    info!("Reclaimed {} stale upload session(s)", count);
                    counter!(UPLOADS_REAPED_TOTAL).increment(count);
                }
                Err(err) => warn!("Upload reclamation sweep failed: {}", err),
            }
        }
    });
    info!(
        "Upload reaper scheduled: interval={}s session_ttl={}s",
        interval, session_ttl.as_secs()
    );
}

/// Resolve when SIGTERM or Ctrl+C arrives, starting the drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
