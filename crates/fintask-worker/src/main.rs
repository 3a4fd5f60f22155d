//! fintask-worker — claims, dispatches, and executes jobs against whichever
//! backend a config document names.

mod backend_factory;
mod handlers;
mod runtime;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fintask_core::{Config, ConfigError, HandlerRegistry};
use tracing::{error, info};

use runtime::WorkerRuntime;

#[derive(Parser)]
#[command(name = "fintask-worker", about = "FinTask distributed job worker")]
struct Cli {
    /// Path to the YAML configuration document.
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
            return exit_code_for_config_error(&err);
        }
    };

    let log_dir = PathBuf::from(&config.logging.file)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let log_file = PathBuf::from(&config.logging.file)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "fintask-worker.log".to_string());

    let _guard = match fintask_core::init_logging(
        &log_dir,
        &log_file,
        config.logging.level,
        config.logging.max_bytes,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::from(2);
        }
    };

    let mut registry = HandlerRegistry::new();
    handlers::register_builtin_handlers(&mut registry);

    for kind in &config.worker.kinds {
        if !registry.contains(kind) {
            error!(kind = %kind, "worker.kinds names a kind with no registered handler");
            return ExitCode::from(2);
        }
    }

    let retry = fintask_core::RetryParams {
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

    let shutdown = fintask_core::CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let runtime = WorkerRuntime::new(backend, registry, config.worker);
    if let Err(err) = runtime.run(shutdown).await {
        error!(error = %err, "worker exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Waits for SIGTERM (how the deployer stops a worker, see
/// `fintask-deployer`'s `RemoteTarget::stop`) or SIGINT/ctrl-c, whichever
/// arrives first.
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

fn exit_code_for_config_error(err: &ConfigError) -> ExitCode {
    match err {
        ConfigError::Read { .. } | ConfigError::Parse(_) | ConfigError::Invalid(_) | ConfigError::UnknownKeys(_) => {
            ExitCode::from(2)
        }
    }
}
