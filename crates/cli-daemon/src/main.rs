//! CLI entry point for the Dolby Vision migration daemon
//!
//! Parses command line arguments, initialises logging and runs the daemon
//! until SIGINT or SIGTERM.

use clap::Parser;
use dovi_migrate::config::{LogFormat, LoggingConfig};
use dovi_migrate::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Converts Dolby Vision profile 7 files in a media library to profile 8.1
#[derive(Parser, Debug)]
#[command(name = "dovi-migrate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). A missing file means defaults.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip the external tool availability checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Probe and log intended actions without modifying any file.
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Run one full scan, process every candidate, then exit.
    #[arg(long, default_value = "false")]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if args.dry_run {
        config.policy.dry_run = true;
    }

    init_logging(&config.logging);
    info!(config = %args.config.display(), "dovi-migrate starting");

    let daemon = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(config)
    };
    let daemon = match daemon {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received; draining workers");
            shutdown.cancel();
        });
    }

    let result = if args.once {
        daemon.run_once(shutdown).await
    } else {
        daemon.run(shutdown).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Daemon error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// RUST_LOG wins over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let (pretty, json) = match logging.format {
        LogFormat::Pretty => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
