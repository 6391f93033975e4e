// crates/server/src/main.rs
//! fetchd server binary.
//!
//! Loads configuration from the environment (flags override), checks the
//! download tool and directory, starts the expiry sweeper, and serves the API
//! until SIGINT/SIGTERM, at which point every unfinished job is cancelled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fetchd_core::FetchConfig;
use fetchd_server::logging::{init_logging, LogFormat};
use fetchd_server::{create_app, init_metrics, JobOrchestrator};

/// Default port for the server.
const DEFAULT_PORT: u16 = 5000;

/// Extra time given to running jobs after their kill grace during shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "fetchd", version, about = "Background media download service")]
struct Args {
    /// Port to listen on (default: FETCHD_PORT, then PORT, then 5000)
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: std::net::IpAddr,

    /// Managed download directory (overrides DOWNLOAD_DIR)
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Concurrent downloads (overrides MAX_CONCURRENT)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Download tool binary (overrides YTDLP_PATH)
    #[arg(long)]
    tool_path: Option<PathBuf>,

    /// Per-download time limit in seconds (overrides YTDLP_TIMEOUT)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

/// Get the server port from environment or use default.
fn get_port() -> u16 {
    std::env::var("FETCHD_PORT")
        .ok()
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn load_config(args: &Args) -> Result<FetchConfig> {
    let mut config = FetchConfig::from_env().context("invalid configuration")?;
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(n) = args.max_concurrent {
        anyhow::ensure!(n > 0, "--max-concurrent must be at least 1");
        config.max_concurrent = n;
    }
    if let Some(path) = &args.tool_path {
        config.tool_path = path.clone();
    }
    if let Some(secs) = args.timeout_secs {
        anyhow::ensure!(secs > 0, "--timeout-secs must be at least 1");
        config.job_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

/// Log what the service depends on. A missing tool is loud but not fatal:
/// `/api/health` reports it as degraded.
async fn startup_checks(orchestrator: &JobOrchestrator) {
    let config = orchestrator.config();
    tracing::info!(
        download_dir = %orchestrator.store().root().display(),
        max_concurrent = config.max_concurrent,
        queue_capacity = ?config.queue_capacity,
        retention_hours = config.retention.as_secs() / 3600,
        timeout_secs = config.job_timeout.as_secs(),
        "fetchd starting"
    );

    let probe = orchestrator.tool().probe().await;
    match probe.version {
        Some(version) if probe.available => {
            tracing::info!(binary = %orchestrator.tool().binary().display(), %version, "download tool found");
        }
        _ => {
            tracing::error!(
                binary = %orchestrator.tool().binary().display(),
                "download tool not installed or not executable"
            );
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env());
    let args = Args::parse();

    init_metrics();

    let config = load_config(&args)?;
    let orchestrator = Arc::new(JobOrchestrator::new(config)?);
    startup_checks(&orchestrator).await;

    let sweeper = orchestrator.spawn_sweeper();
    let app = create_app(Arc::clone(&orchestrator));

    let port = args.port.unwrap_or_else(get_port);
    let addr = SocketAddr::new(args.host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!("fetchd listening on http://{addr}");

    let grace = orchestrator.config().kill_grace + SHUTDOWN_SLACK;
    let draining = Arc::clone(&orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open progress streams end once their jobs are terminal.
            draining.shutdown(grace).await;
        })
        .await
        .context("server error")?;

    if let Err(e) = sweeper.await {
        tracing::debug!(error = %e, "sweeper task ended abnormally");
    }
    tracing::info!("fetchd stopped");
    Ok(())
}
