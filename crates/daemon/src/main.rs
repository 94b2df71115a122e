//! Shellgate Daemon
//!
//! SSH server that runs a configured program on a PTY for every session.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::auth::policy_from_config;
use daemon::config::{default_config_path, Config};
use daemon::server::Server;
use daemon::session::ConfigProvisioner;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Shellgate - serves a program to SSH clients, one PTY per session.
#[derive(Parser, Debug)]
#[command(name = "shellgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the SSH server
    Serve {
        /// Address to bind
        #[arg(long)]
        address: Option<String>,

        /// Port to bind (0 picks a free port)
        #[arg(long, short)]
        port: Option<u16>,

        /// Seconds without traffic before a connection is dropped (0 = never)
        #[arg(long, value_name = "SECONDS")]
        idle_timeout: Option<u64>,

        /// Program launched for every session
        #[arg(long, short)]
        executable: Option<String>,

        /// Host private key (defaults to ~/.ssh/id_rsa)
        #[arg(long, value_name = "FILE")]
        host_key: Option<PathBuf>,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    apply_cli_overrides(&mut config, &cli.command);

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing(&config, cli.verbose)?;

    tracing::info!("Shellgate starting...");
    tracing::debug!("Using config file: {:?}", config_path);

    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => run_server(config).await,
        Commands::CheckConfig => check_config(&config, &config_path),
        Commands::Init { force } => init_config(&config_path, force),
    }
}

/// Overrides config values with the flags given on the command line.
fn apply_cli_overrides(config: &mut Config, command: &Commands) {
    if let Commands::Serve {
        address,
        port,
        idle_timeout,
        executable,
        host_key,
    } = command
    {
        if let Some(address) = address {
            config.server.address = address.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(idle_timeout) = idle_timeout {
            config.server.idle_timeout_secs = *idle_timeout;
        }
        if let Some(executable) = executable {
            config.server.executable = executable.clone();
        }
        if let Some(host_key) = host_key {
            config.server.host_key = Some(host_key.clone());
        }
    }
}

/// Initializes logging to stderr, or to a daily rotated file when
/// `daemon.log_dir` is set. `RUST_LOG` takes precedence over both.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "shellgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Runs the SSH server until SIGTERM or SIGINT.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let provisioner = match &config.session.config_dir {
        Some(dir) => ConfigProvisioner::in_dir(dir),
        None => ConfigProvisioner::new(),
    };

    let server = Server::new(config.server.clone())
        .with_auth_policy(policy_from_config(&config.auth))
        .with_provisioner(provisioner);

    let bound = server.bind().await?;
    let shutdown = bound.shutdown_token();
    let serve = tokio::spawn(bound.serve());

    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    serve.await.context("Accept loop panicked")?;

    tracing::info!("Shellgate stopped");
    Ok(())
}

/// Prints the effective configuration.
fn check_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    let executable = config.server.resolved_executable()?;
    let host_key = match &config.server.host_key {
        Some(path) => path.clone(),
        None => daemon::server::default_host_key_path()?,
    };

    println!("# Configuration file: {}", path.display());
    println!("# Executable: {}", executable.display());
    println!(
        "# Host key: {} ({})",
        host_key.display(),
        if host_key.exists() { "found" } else { "missing" }
    );
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Writes the default configuration to `path`.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
