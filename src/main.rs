//! formstash -- multipart upload ingestion server.
//!
//! SIGTERM/SIGINT stop accepting connections and give in-flight uploads
//! `server.shutdown_timeout` seconds to finish before exiting.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use formstash::config::{Config, LoggingConfig};
use formstash::storage::backend::StorageBackend;
use formstash::upload::filter::{AcceptAll, FileFilter, RuleFilter};

/// Command-line arguments for the formstash server.
#[derive(Parser, Debug)]
#[command(
    name = "formstash",
    version,
    about = "Multipart upload ingestion server"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "formstash.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = formstash::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        formstash::metrics::init_metrics();
        formstash::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let storage = build_storage(&config)?;
    let filter = build_filter(&config)?;
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);

    let state = Arc::new(formstash::AppState {
        config,
        storage,
        filter,
    });
    let app = formstash::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("formstash listening on {}", bind_addr);

    let (stopping_tx, stopping_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = stopping_tx.send(());
    });

    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            if stopping_rx.await.is_ok() {
                tokio::time::sleep(shutdown_timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!(
                "In-flight requests still running after {}s, exiting",
                shutdown_timeout.as_secs()
            );
        }
    }

    info!("formstash shut down");
    Ok(())
}

/// Install the global subscriber.  `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage.backend.as_str() {
        "memory" => {
            let max = config.storage.memory.max_size_bytes;
            info!("Memory storage backend initialized (max_size_bytes={})", max);
            Ok(Arc::new(formstash::storage::memory::MemoryBackend::new(max)))
        }
        "disk" => {
            let root = &config.storage.disk.root_dir;
            let backend = formstash::storage::disk::DiskBackend::new(root)?;
            info!("Disk storage backend initialized at {}", root);
            Ok(Arc::new(backend))
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected disk or memory)"),
    }
}

fn build_filter(config: &Config) -> anyhow::Result<Arc<dyn FileFilter>> {
    let uploads = &config.uploads;
    if uploads.allowed_fields.is_empty() && uploads.allowed_types.is_empty() {
        return Ok(Arc::new(AcceptAll));
    }
    let filter = RuleFilter::new(uploads.allowed_fields.clone(), &uploads.allowed_types)?;
    info!(
        "Upload rules: fields={:?} types={:?}",
        uploads.allowed_fields, uploads.allowed_types
    );
    Ok(Arc::new(filter))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
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
