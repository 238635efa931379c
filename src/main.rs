use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Algorithm, CallOptions, Limiter, RequestKey};
use turnstile::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Rate limiting policy tool")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a policy file, then list its policies
    Validate {
        /// Path to the YAML configuration
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run a series of calls against an in-memory store
    Simulate {
        /// Path to the YAML configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Handle to throttle
        #[arg(long)]
        handle: String,
        /// Request key parts (repeatable)
        #[arg(long = "key")]
        key: Vec<String>,
        /// Number of calls
        #[arg(long, default_value_t = 10)]
        calls: usize,
        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 0)]
        pause_ms: u64,
        /// Fire all calls at once instead of one after another
        #[arg(long)]
        parallel: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Simulate {
            config,
            handle,
            key,
            calls,
            pause_ms,
            parallel,
        } => simulate(config, &handle, RequestKey::from(key), calls, pause_ms, parallel).await,
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = TurnstileConfig::from_file(&path)?;
    info!(policies = config.policies.len(), "Configuration is valid");

    for (handle, policy) in &config.policies {
        let strategy = match policy.algorithm() {
            Algorithm::FixedWindow => "fixed window".to_string(),
            Algorithm::LeakyBucket => {
                format!("leaky bucket, burst {}", policy.burst_rate.unwrap_or_default())
            }
        };
        println!(
            "{}: {} per {}s ({})",
            handle,
            policy.threshold,
            policy.interval.as_secs_f64(),
            strategy
        );
    }
    Ok(())
}

async fn simulate(
    path: PathBuf,
    handle: &str,
    key: RequestKey,
    calls: usize,
    pause_ms: u64,
    parallel: bool,
) -> anyhow::Result<()> {
    let config = TurnstileConfig::from_file(&path)?;
    let store = Arc::new(MemoryStore::new());
    let purger = store.spawn_purger(Duration::from_secs(config.limiter.purge_interval_secs));
    let limiter = Limiter::from_config(store, &config)?;

    limiter.on_before_throttle(|event| {
        warn!(
            handle = %event.handle,
            key = %event.key,
            threshold = event.threshold,
            interval_secs = event.interval.as_secs_f64(),
            "Throttling"
        );
    });

    let options = CallOptions::new();
    let decisions = if parallel {
        let checks = (0..calls).map(|_| limiter.throttle(handle, key.clone(), &options));
        join_all(checks)
            .await
            .into_iter()
            .collect::<Result<Vec<bool>, _>>()?
    } else {
        let mut decisions = Vec::with_capacity(calls);
        for i in 0..calls {
            if i > 0 && pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(pause_ms)).await;
            }
            decisions.push(limiter.throttle(handle, key.clone(), &options).await?);
        }
        decisions
    };

    for (i, throttled) in decisions.iter().enumerate() {
        println!(
            "call {:>4}: {}",
            i + 1,
            if *throttled { "throttled" } else { "allowed" }
        );
    }

    let allowed = decisions.iter().filter(|t| !**t).count();
    let count = limiter.count(handle, key, &options).await?;
    println!("allowed {} of {}, current count {:.3}", allowed, calls, count);

    purger.abort();
    Ok(())
}
