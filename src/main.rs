use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tempfile::TempDir;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiered_cache::{
    CacheCoordinator, CacheStrategy, CoordinatorConfig, DurableTier, RemoteTier, StrategyRegistry,
};

#[derive(Parser)]
#[command(name = "tiered-cache")]
#[command(about = "Tiered cache coordinator for costly generation work", long_about = None)]
struct Cli {
    /// YAML strategy table (defaults to the built-in table)
    #[arg(short, long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered strategies and their policies
    Strategies,

    /// Drive concurrent read-through load against a synthetic generator
    Simulate {
        /// Strategy to exercise
        #[arg(short, long, default_value = "search_autocomplete")]
        strategy: String,

        /// Number of distinct subkeys
        #[arg(short, long, default_value = "20")]
        keys: usize,

        /// Concurrent workers
        #[arg(short, long, default_value = "16")]
        concurrency: usize,

        /// Total requests across all workers
        #[arg(short = 'n', long, default_value = "500")]
        requests: usize,

        /// Simulated generator latency
        #[arg(long, default_value = "50")]
        generator_latency_ms: u64,

        /// Probability that a generator call fails (0.0 - 1.0)
        #[arg(long, default_value = "0.0")]
        fail_rate: f64,

        /// Simulated remote tier round trip
        #[arg(long, default_value = "2")]
        remote_latency_ms: u64,

        /// Directory for the durable tier (a temporary directory if omitted)
        #[arg(long)]
        durable_dir: Option<PathBuf>,

        /// Print the final stats snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tiered_cache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let registry = load_registry(&cli)?;

    match cli.command {
        Commands::Strategies => {
            println!(
                "{:<26} {:>8}  {:<24} {:<9} {}",
                "STRATEGY", "TTL", "TIERS", "COMPRESS", "PRIORITY"
            );
            for (strategy, policy) in registry.iter() {
                let tiers: Vec<String> = policy.tiers.iter().map(|t| t.to_string()).collect();
                println!(
                    "{:<26} {:>8}  {:<24} {:<9} {}",
                    strategy.as_str(),
                    format_ttl(policy.ttl),
                    tiers.join(" > "),
                    if policy.compress { "yes" } else { "no" },
                    policy.priority
                );
            }
        }

        Commands::Simulate {
            ref strategy,
            keys,
            concurrency,
            requests,
            generator_latency_ms,
            fail_rate,
            remote_latency_ms,
            ref durable_dir,
            json,
        } => {
            let strategy: CacheStrategy = strategy.parse()?;
            let settings = Simulation {
                strategy,
                keys: keys.max(1),
                concurrency: concurrency.max(1),
                requests,
                generator_latency: Duration::from_millis(generator_latency_ms),
                fail_rate: fail_rate.clamp(0.0, 1.0),
            };

            // The temporary directory goes away when this arm exits, errors included
            let (dir, _temporary) = durable_location(durable_dir.as_ref())?;

            let coordinator = CacheCoordinator::builder()
                .registry(registry)
                .config(CoordinatorConfig::from_env()?)
                .remote_tier(Arc::new(
                    RemoteTier::new().with_latency(Duration::from_millis(remote_latency_ms)),
                ))
                .durable_tier(Arc::new(DurableTier::open(&dir).await?))
                .build()?;
            let coordinator = Arc::new(coordinator);

            let maintenance = coordinator.spawn_maintenance();
            let report = run_simulation(coordinator.clone(), &settings).await?;
            if let Some(handle) = maintenance {
                handle.abort();
            }

            let stats = coordinator.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Simulation finished in {:.2?}", report.elapsed);
                println!("  Requests:          {}", settings.requests);
                println!("  Failed requests:   {}", report.failed);
                println!("  Generator runs:    {}", report.generator_runs);
                println!("  Collapsed callers: {}", stats.dedup_followers);
                println!(
                    "  Fast tier:         {} entries",
                    coordinator.fast_tier_stats().await.entries
                );
                println!("{}", stats);
            }
        }
    }

    Ok(())
}

/// Directory for the durable tier, with a guard when it is a temporary one
fn durable_location(dir: Option<&PathBuf>) -> Result<(PathBuf, Option<TempDir>)> {
    match dir {
        Some(dir) => Ok((dir.clone(), None)),
        None => {
            let tmp = tempfile::Builder::new()
                .prefix("tiered-cache-")
                .tempdir()
                .context("creating a temporary durable directory")?;
            Ok((tmp.path().to_path_buf(), Some(tmp)))
        }
    }
}

struct Simulation {
    strategy: CacheStrategy,
    keys: usize,
    concurrency: usize,
    requests: usize,
    generator_latency: Duration,
    fail_rate: f64,
}

struct SimulationReport {
    elapsed: Duration,
    failed: usize,
    generator_runs: u64,
}

async fn run_simulation(
    coordinator: Arc<CacheCoordinator>,
    settings: &Simulation,
) -> Result<SimulationReport> {
    info!(
        "Simulating {} requests over {} keys with {} workers",
        settings.requests, settings.keys, settings.concurrency
    );

    let issued = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let generator_runs = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let mut workers = Vec::with_capacity(settings.concurrency);
    for _ in 0..settings.concurrency {
        let coordinator = coordinator.clone();
        let issued = issued.clone();
        let failed = failed.clone();
        let generator_runs = generator_runs.clone();
        let strategy = settings.strategy.clone();
        let (keys, total, latency, fail_rate) = (
            settings.keys,
            settings.requests,
            settings.generator_latency,
            settings.fail_rate,
        );

        workers.push(tokio::spawn(async move {
            while issued.fetch_add(1, Ordering::Relaxed) < total {
                let subkey = format!("key-{}", rand::thread_rng().gen_range(0..keys));
                let should_fail = rand::thread_rng().gen_bool(fail_rate);
                let generator_runs = &generator_runs;
                let payload = format!("generated value for {}; ", subkey).repeat(8);

                let result = coordinator
                    .get(&strategy, &subkey, || async move {
                        generator_runs.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(latency).await;
                        if should_fail {
                            anyhow::bail!("synthetic generator failure");
                        }
                        Ok(payload)
                    })
                    .await;

                if result.is_err() {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for worker in workers {
        worker.await.context("simulation worker panicked")?;
    }

    Ok(SimulationReport {
        elapsed: started.elapsed(),
        failed: failed.load(Ordering::Relaxed),
        generator_runs: generator_runs.load(Ordering::Relaxed),
    })
}

fn load_registry(cli: &Cli) -> Result<StrategyRegistry> {
    match &cli.registry {
        Some(path) => StrategyRegistry::from_yaml_file(path)
            .with_context(|| format!("loading strategy table {}", path.display())),
        None => Ok(StrategyRegistry::default()),
    }
}

fn format_ttl(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
