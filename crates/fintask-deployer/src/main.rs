//! fintask-deployer — ships, starts, stops, and inspects `fintask-worker`
//! processes on remote hosts over `ssh`/`scp`.
//!
//! This binary has no runtime role in the queue/worker core: it is
//! operator-facing glue that shells out to the host's own `ssh` client.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use fintask_core::Config;
use fintask_deployer::{resolve_target, RemoteOutput, RemoteTarget, SshRunner};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fintask-deployer", about = "FinTask worker fleet orchestrator")]
struct Cli {
    /// Path to the shared YAML configuration document (read for `hosts:`).
    #[arg(long, short, default_value = "fintask.yaml", env = "FINTASK_CONFIG")]
    config: PathBuf,

    /// Override the SSH user for this invocation.
    #[arg(long)]
    user: Option<String>,

    /// Override the SSH private key path for this invocation.
    #[arg(long)]
    key: Option<String>,

    /// Override the SSH port for this invocation.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the local environment for running a worker (directories, binary present).
    SetupLocal,

    /// Parse and validate the configuration document without contacting any host.
    TestConfig,

    /// Ship the worker binary and config to a host.
    Deploy {
        host: String,
        /// Path to the `fintask-worker` binary to upload.
        #[arg(long, default_value = "target/release/fintask-worker")]
        binary: PathBuf,
    },

    /// Start the worker process on a host.
    Start { host: String },

    /// Stop the worker process on a host.
    Stop { host: String },

    /// Restart the worker process on a host.
    Restart { host: String },

    /// Report whether the worker process on a host is running.
    Status { host: String },

    /// Tail the worker's log file on a host.
    Logs {
        host: String,
        #[arg(long, default_value_t = 200)]
        lines: u32,
    },

    /// Deploy to every host listed in `hosts:`.
    DeployAll {
        #[arg(long, default_value = "target/release/fintask-worker")]
        binary: PathBuf,
    },

    /// Start every host listed in `hosts:`.
    StartAll,

    /// Stop every host listed in `hosts:`.
    StopAll,

    /// Report status for every host listed in `hosts:`.
    StatusAll,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::TestConfig) {
        return match Config::load(&cli.config) {
            Ok(_) => {
                println!("{} is valid", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("configuration error: {err}");
                ExitCode::from(2)
            }
        };
    }

    if matches!(cli.command, Commands::SetupLocal) {
        return setup_local();
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::SetupLocal | Commands::TestConfig => unreachable!("handled above"),
        Commands::Deploy { host, binary } => {
            run_single(&config, &cli, &host, |target| {
                Box::pin(deploy(target, binary.clone(), cli.config.clone()))
            })
            .await
        }
        Commands::Start { host } => run_single(&config, &cli, &host, |target| Box::pin(async move { SshRunner::start(&target).await })).await,
        Commands::Stop { host } => run_single(&config, &cli, &host, |target| Box::pin(async move { SshRunner::stop(&target).await })).await,
        Commands::Restart { host } => run_single(&config, &cli, &host, |target| Box::pin(async move { SshRunner::restart(&target).await })).await,
        Commands::Status { host } => run_single(&config, &cli, &host, |target| Box::pin(async move { SshRunner::status(&target).await })).await,
        Commands::Logs { host, lines } => {
            run_single(&config, &cli, &host, move |target| Box::pin(async move { SshRunner::logs(&target, lines).await })).await
        }
        Commands::DeployAll { binary } => {
            run_all(&config, &cli, |target| Box::pin(deploy(target, binary.clone(), cli.config.clone()))).await
        }
        Commands::StartAll => run_all(&config, &cli, |target| Box::pin(async move { SshRunner::start(&target).await })).await,
        Commands::StopAll => run_all(&config, &cli, |target| Box::pin(async move { SshRunner::stop(&target).await })).await,
        Commands::StatusAll => run_all(&config, &cli, |target| Box::pin(async move { SshRunner::status(&target).await })).await,
    }
}

async fn deploy(target: RemoteTarget, binary: PathBuf, config_path: PathBuf) -> anyhow::Result<RemoteOutput> {
    SshRunner::deploy(
        &target,
        binary.to_str().expect("binary path must be valid UTF-8"),
        config_path.to_str().expect("config path must be valid UTF-8"),
    )
    .await
}

type RemoteFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<RemoteOutput>> + Send>>;

async fn run_single(config: &Config, cli: &Cli, host: &str, action: impl FnOnce(RemoteTarget) -> RemoteFuture) -> ExitCode {
    let target = match resolve_target(config, host, cli.user.as_deref(), cli.key.as_deref(), cli.port) {
        Ok(target) => target,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match action(target).await {
        Ok(output) => print_output(host, &output),
        Err(err) => {
            error!(host = %host, error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_all(config: &Config, cli: &Cli, action: impl Fn(RemoteTarget) -> RemoteFuture) -> ExitCode {
    if config.hosts.is_empty() {
        eprintln!("no hosts configured under hosts:");
        return ExitCode::FAILURE;
    }

    let mut any_failed = false;
    for host_entry in &config.hosts {
        let target = match resolve_target(config, &host_entry.host, cli.user.as_deref(), cli.key.as_deref(), cli.port) {
            Ok(target) => target,
            Err(err) => {
                eprintln!("{err}");
                any_failed = true;
                continue;
            }
        };
        let host = host_entry.host.clone();
        match action(target).await {
            Ok(output) => {
                if print_output(&host, &output) != ExitCode::SUCCESS {
                    any_failed = true;
                }
            }
            Err(err) => {
                error!(host = %host, error = %err, "command failed");
                any_failed = true;
            }
        }
    }

    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_output(host: &str, output: &RemoteOutput) -> ExitCode {
    if !output.stdout.trim().is_empty() {
        println!("[{host}] {}", output.stdout.trim());
    }
    if !output.success {
        if !output.stderr.trim().is_empty() {
            eprintln!("[{host}] {}", output.stderr.trim());
        }
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn setup_local() -> ExitCode {
    let dirs = ["target/release", "/tmp/fintask"];
    for dir in dirs {
        if let Err(err) = std::fs::create_dir_all(dir) {
            eprintln!("failed to prepare {dir}: {err}");
            return ExitCode::from(2);
        }
    }
    info!("local environment prepared");
    println!("local environment ready");
    ExitCode::SUCCESS
}
