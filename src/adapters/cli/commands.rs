//! CLI Command Handlers
//!
//! Implementation of all CLI commands for the Butters Scout pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapters::cache_store::CacheStore;
use crate::adapters::http::{HttpDiscoverySource, HttpProviderClient};
use crate::adapters::log_alert_sink::LogAlertSink;
use crate::adapters::rate_limiter::RateLimiter;
use crate::application::{AdaptiveScheduler, BatchRequestOrchestrator, ProgressiveFilterPipeline};
use crate::config::{load_config, Config};
use crate::domain::{
    estimate_savings, pack_partition, ChangeDetector, EndpointCost, KnownEntityRegistry,
    PartitionKey, ScoringEngine, SnapshotStore,
};

/// Butters Scout - cost-aware token discovery and scoring
#[derive(Parser, Debug)]
#[command(
    name = "butters-scout",
    version = env!("CARGO_PKG_VERSION"),
    about = "Cost-aware token discovery, filtering and scoring",
    long_about = "Butters Scout discovers candidate tokens, filters them through progressively \
                  more expensive gates and promotes the ones that score above threshold, \
                  batching and caching every provider call along the way."
)]
pub struct CliApp {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the discovery loop
    Run(RunCmd),

    /// Load and validate a configuration file
    CheckConfig(CheckConfigCmd),

    /// Show what batching saves for a given key count
    EstimateCost(EstimateCostCmd),

    /// Inspect persisted change-detection state
    State(StateCmd),
}

/// Start the discovery loop
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/scout.toml")]
    pub config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,
}

/// Validate configuration
#[derive(Parser, Debug)]
pub struct CheckConfigCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/scout.toml")]
    pub config: PathBuf,
}

/// Batch cost estimate
#[derive(Parser, Debug)]
pub struct EstimateCostCmd {
    /// Number of keys to fetch
    #[arg(long, value_name = "N")]
    pub keys: usize,

    /// Cost of a single-key call
    #[arg(long, value_name = "COST", default_value = "1.0")]
    pub base_cost: f64,

    /// Largest batch the endpoint accepts
    #[arg(long, value_name = "SIZE", default_value = "50")]
    pub max_batch: usize,
}

/// Inspect persisted state
#[derive(Parser, Debug)]
pub struct StateCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/scout.toml")]
    pub config: PathBuf,

    /// Number of top-scoring tokens to list
    #[arg(long, value_name = "N", default_value = "10")]
    pub top: usize,
}

/// Execute the CLI command
pub async fn execute(app: CliApp) -> Result<()> {
    match app.command {
        Command::Run(cmd) => {
            let config = load(&cmd.config)?;
            init_logging(app.verbose, app.debug, &config.logging.level);
            run_command(cmd, config).await
        }
        Command::CheckConfig(cmd) => {
            init_logging(app.verbose, app.debug, "warn");
            check_config_command(cmd)
        }
        Command::EstimateCost(cmd) => estimate_cost_command(cmd),
        Command::State(cmd) => {
            let config = load(&cmd.config)?;
            init_logging(app.verbose, app.debug, "warn");
            state_command(cmd, config)
        }
    }
}

fn load(path: &Path) -> Result<Config> {
    load_config(path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Initialize logging system. `RUST_LOG` wins over flags and config.
fn init_logging(verbose: bool, debug: bool, configured: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        configured
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A subscriber may already be installed by an embedding host
    if let Err(e) = fmt().with_env_filter(filter).with_target(false).try_init() {
        tracing::debug!(error = %e, "Global subscriber already set");
    }
}

/// Everything `run` needs, wired from config
pub struct Runtime {
    pub scheduler: AdaptiveScheduler,
    pub cache: Arc<CacheStore>,
    pub registry: Arc<KnownEntityRegistry>,
}

/// Build the full object graph from a validated config.
pub fn build_runtime(config: &Config) -> Result<Runtime> {
    let data_dir = config.persistence.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let store = SnapshotStore::new(&data_dir);

    let registry = match config.persistence.registry_path() {
        Some(path) => KnownEntityRegistry::from_file(path.clone())
            .with_context(|| format!("Failed to load registry from {}", path.display()))?,
        None => KnownEntityRegistry::default(),
    };
    let registry = Arc::new(registry);

    let limiter = Arc::new(RateLimiter::new(
        config
            .providers
            .iter()
            .map(|(name, p)| (name.clone(), p.rate_limit.clone())),
    ));
    let cache = Arc::new(CacheStore::load(
        &store.cache_path(),
        config.cache.ttl.clone(),
        config.cache.max_entries,
    ));

    let mut orchestrator =
        BatchRequestOrchestrator::new(limiter, Arc::clone(&cache), config.orchestrator.worker_pool);
    for (name, provider) in &config.providers {
        let client = HttpProviderClient::from_env(name.clone(), provider.http.clone())
            .with_context(|| format!("Failed to create provider client '{}'", name))?;
        orchestrator =
            orchestrator.with_provider(Arc::new(client), provider.retry.clone(), provider.max_concurrency);
    }

    let discovery = HttpDiscoverySource::from_env(config.discovery.source.clone())
        .context("Failed to create discovery source")?;
    let scoring = ScoringEngine::from_config(&config.scoring).context("Invalid scoring config")?;

    let pipeline = ProgressiveFilterPipeline::new(
        Arc::new(discovery),
        Arc::new(orchestrator),
        Arc::new(scoring),
        Arc::clone(&registry),
        Arc::new(LogAlertSink::new(config.alerts.log_breakdown)),
        ChangeDetector::new(config.change.thresholds.clone()),
        config.pipeline.clone(),
        config.discovery.filter.clone(),
        config.change.eviction_cycles,
    );
    let scheduler = AdaptiveScheduler::new(pipeline, config.scheduler.clone()).with_store(store);

    Ok(Runtime {
        scheduler,
        cache,
        registry,
    })
}

/// Handle run command
async fn run_command(cmd: RunCmd, config: Config) -> Result<()> {
    tracing::info!("Starting Butters Scout...");
    tracing::info!("Config: {}", cmd.config.display());

    let runtime = build_runtime(&config)?;
    let cancel = CancellationToken::new();

    if cmd.once {
        let outcome = runtime.scheduler.tick(&cancel).await;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    // Setup Ctrl+C handler
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    let sweeper = runtime.cache.spawn_sweeper(
        Duration::from_secs(config.cache.sweep_interval_secs),
        cancel.clone(),
    );

    if config.persistence.registry_path.is_some() {
        let registry = Arc::clone(&runtime.registry);
        let cancel = cancel.clone();
        let every = Duration::from_secs(config.persistence.registry_refresh_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        if let Err(e) = registry.refresh() {
                            tracing::warn!("Registry refresh failed, keeping current version: {}", e);
                        }
                    }
                }
            }
        });
    }

    runtime.scheduler.run(cancel).await;
    sweeper.await.ok();
    tracing::info!("Butters Scout stopped");
    Ok(())
}

/// Handle check-config command
fn check_config_command(cmd: CheckConfigCmd) -> Result<()> {
    let config = load(&cmd.config)?;

    println!("✓ {} is valid", cmd.config.display());
    println!(
        "  Gates: quick {:.0} / medium {:.0} / full {:.0}",
        config.pipeline.quick_threshold,
        config.pipeline.medium_threshold,
        config.pipeline.full_threshold
    );
    println!(
        "  Interval: {:.0}s - {:.0}s",
        config.scheduler.min_interval_secs, config.scheduler.max_interval_secs
    );
    for (name, provider) in &config.providers {
        println!(
            "  Provider {}: {} endpoints, {:.1} req/s (burst {:.0}), batch {}",
            name,
            provider.http.endpoints.len(),
            provider.rate_limit.refill_per_sec,
            provider.rate_limit.capacity,
            provider.http.max_batch_size
        );
    }
    let factors: Vec<String> = config
        .scoring
        .factors
        .iter()
        .map(|f| format!("{}={:.2}", f.name, f.weight))
        .collect();
    println!("  Factors: {}", factors.join(", "));
    Ok(())
}

/// Handle estimate-cost command
fn estimate_cost_command(cmd: EstimateCostCmd) -> Result<()> {
    anyhow::ensure!(cmd.max_batch > 0, "--max-batch must be > 0");
    anyhow::ensure!(cmd.base_cost > 0.0, "--base-cost must be > 0");

    let keys: Vec<String> = (0..cmd.keys).map(|i| format!("k{}", i)).collect();
    let pricing = EndpointCost::new(cmd.base_cost, cmd.max_batch);
    let batches = pack_partition(&PartitionKey::new("estimate", "estimate"), &keys, pricing);
    let savings = estimate_savings(&batches);

    println!("Keys:            {}", cmd.keys);
    println!("Batches:         {}", batches.len());
    for batch in &batches {
        println!("  {:>4} keys -> {:.0} units", batch.keys.len(), batch.cost);
    }
    println!("Batched cost:    {:.0}", savings.actual_cost);
    println!("Individual cost: {:.0}", savings.individual_cost);
    println!("Saved:           {:.0} ({:.1}%)", savings.saved(), savings.saved_pct());
    Ok(())
}

/// Handle state command
fn state_command(cmd: StateCmd, config: Config) -> Result<()> {
    let store = SnapshotStore::new(config.persistence.data_dir());
    let state = store.load_state();

    println!("State: {}", store.state_path().display());
    println!("  Cycles committed: {}", state.cycles_committed());
    println!("  Tracked:          {}", state.active_len());
    println!("  Retired:          {}", state.retired_len());

    let mut scored: Vec<_> = state
        .iter_tracked()
        .filter_map(|(key, tracked)| tracked.last_score.map(|score| (key, score, tracked)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    if !scored.is_empty() {
        println!("\nTop {}:", cmd.top.min(scored.len()));
        for (key, score, tracked) in scored.into_iter().take(cmd.top) {
            println!(
                "  {:<46} {:>6.1}  promoted {}x  idle {}",
                key, score, tracked.times_promoted, tracked.idle_cycles
            );
        }
    }

    let by_idle: BTreeMap<u32, usize> = state.iter_tracked().fold(BTreeMap::new(), |mut acc, (_, t)| {
        *acc.entry(t.idle_cycles).or_default() += 1;
        acc
    });
    if !by_idle.is_empty() {
        println!("\nIdle cycles histogram:");
        for (idle, count) in by_idle {
            println!("  {:>3}: {}", idle, count);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_once() {
        let app = CliApp::try_parse_from(["butters-scout", "run", "--config", "x.toml", "--once"]).unwrap();
        match app.command {
            Command::Run(cmd) => {
                assert!(cmd.once);
                assert_eq!(cmd.config, PathBuf::from("x.toml"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_estimate_cost() {
        let app = CliApp::try_parse_from([
            "butters-scout",
            "estimate-cost",
            "--keys",
            "120",
            "--base-cost",
            "15",
            "--max-batch",
            "50",
        ])
        .unwrap();
        match app.command {
            Command::EstimateCost(cmd) => {
                assert_eq!(cmd.keys, 120);
                assert_eq!(cmd.base_cost, 15.0);
                assert_eq!(cmd.max_batch, 50);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_estimate_cost_rejects_zero_batch() {
        let cmd = EstimateCostCmd {
            keys: 10,
            base_cost: 1.0,
            max_batch: 0,
        };
        assert!(estimate_cost_command(cmd).is_err());
    }

    #[test]
    fn test_global_flags() {
        let app = CliApp::try_parse_from(["butters-scout", "check-config", "--debug"]).unwrap();
        assert!(app.debug);
        assert!(matches!(app.command, Command::CheckConfig(_)));
    }
}
