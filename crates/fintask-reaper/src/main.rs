//! fintask-reaperd — standalone liveness reaper process.
//!
//! Runs independently of any worker, periodically reclaiming jobs whose
//! owning worker has stopped heartbeating. A deployment may instead set
//! `reaper.embedded = true` in a worker's config and skip this binary
//! entirely; see `fintask_reaper::run` for the embeddable version.

mod backend_factory;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use fintask_core::{CancellationToken, Config, RetryParams};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fintask-reaperd", about = "FinTask liveness reaper")]
struct Cli {
    /// Path to the YAML configuration document shared with the workers.
    #[arg(long, short, default_value = "fintask.yaml", env = "FINTASK_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    let log_dir = PathBuf::from(&config.logging.file)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let _guard = match fintask_core::init_logging(
        &log_dir,
        "fintask-reaperd.log",
        config.logging.level,
        config.logging.max_bytes,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::from(2);
        }
    };

    let retry = RetryParams {
        base_backoff_secs: config.retry.base_backoff,
        max_backoff_secs: config.retry.max_backoff,
        jitter_fraction: config.retry.jitter_fraction,
    };

    let backend = match backend_factory::build_backend(&config.queue, retry).await {
        Ok(backend) => backend,
        Err(err) => {
            error!(error = %err, "failed to connect to queue backend");
            return ExitCode::from(2);
        }
    };

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    info!(
        stale_after_secs = config.reaper.stale_after,
        interval_secs = config.reaper.interval,
        "reaper started"
    );

    fintask_reaper::run(
        backend,
        Duration::from_secs(config.reaper.stale_after),
        Duration::from_secs(config.reaper.interval),
        shutdown,
    )
    .await;

    ExitCode::SUCCESS
}

/// Waits for SIGTERM or SIGINT/ctrl-c, whichever arrives first.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
