use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tierlimit::config::{LoggingConfig, TierlimitConfig};
use tierlimit::ratelimit::{Clock, Decision, LocalCache, RateLimiter, Sweeper, SystemClock};
use tierlimit::store;

/// Two-tier fixed-window rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tierlimit", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for a subject and print each decision as JSON
    Check {
        /// Identity being rate limited
        #[arg(short, long)]
        subject: String,

        /// Requests allowed per window (defaults to rate_limiting.default_limit)
        #[arg(short, long)]
        limit: Option<u64>,

        /// Number of consecutive checks
        #[arg(short = 'n', long, default_value_t = 1)]
        repeat: u32,

        /// Pause between checks, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Probe the configured counter store
    Ping,
}

/// One line of `check` output.
#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    subject: &'a str,
    #[serde(flatten)]
    decision: Decision,
    /// Wall-clock instant the window resets, RFC 3339
    reset_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct PingReport {
    backend: &'static str,
    latency_ms: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TierlimitConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = ?config.store.backend,
        window_secs = config.rate_limiting.window_secs,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let counter_store = store::connect(&config.store, clock.clone())
        .await
        .context("Failed to connect to counter store")?;

    match cli.command {
        Command::Ping => {
            let latency = counter_store.ping().await.context("Counter store ping failed")?;
            print_json(&PingReport {
                backend: counter_store.name(),
                latency_ms: latency.as_secs_f64() * 1000.0,
            })?;
        }
        Command::Check {
            subject,
            limit,
            repeat,
            interval_ms,
        } => {
            let limit = limit.unwrap_or(config.rate_limiting.default_limit);

            let cache = Arc::new(LocalCache::new(clock));
            let sweeper = Sweeper::spawn(cache.clone(), config.rate_limiting.sweep_interval());
            let limiter = RateLimiter::new(counter_store, cache, config.rate_limiting.window())
                .with_key_prefix(config.store.key_prefix.clone());
            info!(instance_id = limiter.instance_id(), "Rate limiter initialized");

            let result = tokio::select! {
                result = run_checks(&limiter, &subject, limit, repeat, Duration::from_millis(interval_ms)) => result,
                interrupt = interrupted() => interrupt.map(|name| info!(signal = name, "Interrupted, stopping checks")),
            };

            sweeper.shutdown().await;
            result?;
        }
    }

    Ok(())
}

async fn run_checks(
    limiter: &RateLimiter,
    subject: &str,
    limit: u64,
    repeat: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    for i in 0..repeat {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }

        let decision = limiter.check_and_consume(subject, limit).await?;
        let reset_at = chrono::Duration::from_std(decision.reset_in)
            .ok()
            .map(|d| (chrono::Utc::now() + d).to_rfc3339());

        print_json(&CheckReport {
            subject,
            decision,
            reset_at,
        })?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Logs go to stderr so stdout carries only JSON reports.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve with the name of the first interrupt received.
#[cfg(unix)]
async fn interrupted() -> anyhow::Result<&'static str> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = signal::ctrl_c() => result.map(|()| "SIGINT").context("Failed to listen for Ctrl+C"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn interrupted() -> anyhow::Result<&'static str> {
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    Ok("Ctrl+C")
}
