use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lockgate::config::LockgateConfig;
use lockgate::{DistributedLock, GateFactory, ThrottleConfiguration};

/// Drive a throttle or debounce from the command line.
#[derive(Debug, Parser)]
#[command(name = "lockgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fire a series of calls through a throttle
    Throttle {
        /// Coordination key
        #[arg(long)]
        key: String,
        /// Number of calls to make
        #[arg(long, default_value_t = 10)]
        calls: u32,
        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 100)]
        spacing_ms: u64,
        /// Executions per window, overriding the configured rule
        #[arg(long, requires = "interval_ms")]
        executions: Option<u64>,
        /// Window length in milliseconds, overriding the configured rule
        #[arg(long, requires = "executions")]
        interval_ms: Option<u64>,
    },
    /// Fire a series of calls through a debounce
    Debounce {
        /// Coordination key
        #[arg(long)]
        key: String,
        /// Number of calls to make
        #[arg(long, default_value_t = 5)]
        calls: u32,
        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 100)]
        spacing_ms: u64,
        /// Quiet period in milliseconds, overriding the configured rule
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    info!("Starting Lockgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => LockgateConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LockgateConfig::default(),
    };
    info!(
        namespace = %config.lock.namespace,
        throttles = config.throttles.len(),
        debounces = config.debounces.len(),
        "Configuration loaded"
    );

    let lock: Arc<dyn DistributedLock> = Arc::new(config.in_memory_lock());

    tokio::select! {
        result = run(cli.command, &config, lock) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Lockgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: Command, config: &LockgateConfig, lock: Arc<dyn DistributedLock>) -> anyhow::Result<()> {
    match command {
        Command::Throttle {
            key,
            calls,
            spacing_ms,
            executions,
            interval_ms,
        } => {
            let throttle_config = match (executions, interval_ms) {
                (Some(executions), Some(interval_ms)) => ThrottleConfiguration::new(executions, interval_ms),
                _ => config
                    .throttle_rule(&key)
                    .map(|rule| rule.configuration())
                    .ok_or_else(|| anyhow!("no throttle rule for key {key}"))?,
            };
            let throttle = lock.throttler(&key, throttle_config)?;
            info!(key = %key, config = %throttle_config, "Throttling calls");

            let mut permitted = 0;
            for call in 0..calls {
                let executed = throttle
                    .attempt(|| async move {
                        info!(call, "Executing call");
                        Ok::<(), anyhow::Error>(())
                    })
                    .await?;
                if executed {
                    permitted += 1;
                } else {
                    info!(call, "Call throttled");
                }
                tokio::time::sleep(Duration::from_millis(spacing_ms)).await;
            }

            info!(key = %key, calls, permitted, "Throttle run complete");
        }
        Command::Debounce {
            key,
            calls,
            spacing_ms,
            interval_ms,
        } => {
            let interval_ms = match interval_ms {
                Some(interval_ms) => interval_ms,
                None => config
                    .debounce_rule(&key)
                    .map(|rule| rule.interval_ms)
                    .ok_or_else(|| anyhow!("no debounce rule for key {key}"))?,
            };
            let debounce = lock.debouncer(&key, interval_ms)?;
            info!(key = %key, interval_ms, "Debouncing calls");

            for call in 0..calls {
                debounce
                    .schedule(move || async move {
                        info!(call, "Executing call");
                        Ok::<(), anyhow::Error>(())
                    })
                    .await;
                tokio::time::sleep(Duration::from_millis(spacing_ms)).await;
            }

            // Let the last call's check run before exiting.
            tokio::time::sleep(debounce.interval() + Duration::from_millis(100)).await;
            info!(key = %key, calls, "Debounce run complete");
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
