//! Deepfake detection upload service - main entry point
//!
//! Serves the upload page, accepts video uploads on POST /upload, runs the
//! configured classifier on each and returns the rendered verdict.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dfd_common::config::{ConfigOverrides, StorageNaming, VerdictMode};
use dfd_common::ServiceConfig;
use dfd_server::{build_router, pipeline::Pipeline, AppState};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for dfd-server
#[derive(Parser, Debug)]
#[command(name = "dfd-server")]
#[command(about = "Deepfake detection upload service")]
#[command(version)]
struct Args {
    /// TOML config file (default: <config dir>/dfd/config.toml when present)
    #[arg(short, long, env = "DFD_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(short, long, env = "DFD_BIND")]
    bind: Option<String>,

    /// Directory uploads are written to
    #[arg(long, env = "DFD_UPLOADS_DIR")]
    uploads_dir: Option<PathBuf>,

    /// Directory served for every path other than /upload and /health
    #[arg(long, env = "DFD_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Result page template
    #[arg(long, env = "DFD_TEMPLATE")]
    template: Option<PathBuf>,

    /// Maximum upload body size in bytes
    #[arg(long, env = "DFD_MAX_BODY_BYTES")]
    max_body_bytes: Option<usize>,

    /// Storage naming: unique or declared
    #[arg(long, env = "DFD_STORAGE_NAMING")]
    storage_naming: Option<StorageNaming>,

    /// Verdict mode: legacy or strict
    #[arg(long, env = "DFD_VERDICT_MODE")]
    verdict_mode: Option<VerdictMode>,

    /// Classifier executable
    #[arg(long, env = "DFD_CLASSIFIER_PROGRAM")]
    classifier_program: Option<String>,

    /// Leading classifier argument, repeatable; the upload path is appended last
    #[arg(long = "classifier-arg", env = "DFD_CLASSIFIER_ARGS", value_delimiter = ' ', allow_hyphen_values = true)]
    classifier_args: Vec<String>,

    /// Classifier deadline in seconds
    #[arg(long, env = "DFD_CLASSIFIER_TIMEOUT")]
    classifier_timeout: Option<u64>,

    /// Maximum classifier processes running at once
    #[arg(long, env = "DFD_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long, env = "DFD_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config,
            bind_addr: self.bind,
            uploads_dir: self.uploads_dir,
            static_dir: self.static_dir,
            template_path: self.template,
            max_body_bytes: self.max_body_bytes,
            storage_naming: self.storage_naming,
            verdict_mode: self.verdict_mode,
            classifier_program: self.classifier_program,
            classifier_args: (!self.classifier_args.is_empty()).then_some(self.classifier_args),
            classifier_timeout_secs: self.classifier_timeout,
            max_concurrent: self.max_concurrent,
            log_level: self.log_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(args.into_overrides()).context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting dfd-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE"),
    );
    match &config.config_file {
        Some(path) => info!("Configuration file: {}", path.display()),
        None => warn!("No configuration file found, using defaults"),
    }
    info!("Uploads directory: {}", config.uploads_dir.display());
    info!("Static directory: {}", config.static_dir.display());
    info!(
        program = %config.classifier.program,
        args = ?config.classifier.args,
        timeout_secs = config.classifier.timeout.as_secs(),
        max_concurrent = config.classifier.max_concurrent,
        "Classifier configured"
    );

    let bind_addr = config.bind_addr;
    let state = AppState::new(config);

    if state.config.retention.has_limits() {
        spawn_retention_sweeper(Arc::clone(&state.pipeline), state.config.retention.sweep_interval);
    }

    let app = build_router(state);

    info!("Starting HTTP server on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Periodically apply the retention policy to the uploads directory
fn spawn_retention_sweeper(pipeline: Arc<Pipeline>, every: std::time::Duration) {
    info!("Retention sweep every {}s", every.as_secs());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = pipeline.store().enforce_retention().await {
                warn!("Retention sweep failed: {}", e);
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
