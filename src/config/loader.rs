//! Configuration Loader
//!
//! Loads and validates configuration from TOML files matching config/scout.toml.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::adapters::cache_store::{CacheStore, TtlTable};
use crate::adapters::http::{HttpDiscoveryConfig, HttpProviderConfig};
use crate::adapters::rate_limiter::{RateLimitConfig, MIN_CAPACITY};
use crate::application::{FetchSpec, PipelineConfig, RetryPolicy};
use crate::domain::{FieldCategory, QuickFields, SchedulerConfig, ScoringConfig, ScoringEngine};
use crate::ports::DiscoveryFilter;

/// Main configuration structure matching config/scout.toml
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub change: ChangeSection,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
    #[serde(default)]
    pub alerts: AlertsSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Discovery feed and its base filter
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    #[serde(flatten)]
    pub source: HttpDiscoveryConfig,
    /// Base filter; relaxation multipliers scale it
    #[serde(default)]
    pub filter: DiscoveryFilter,
}

/// Cache configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// TTL per field category, in seconds
    #[serde(default)]
    pub ttl: TtlTable,
    /// How often expired entries are swept
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_entries() -> usize {
    CacheStore::DEFAULT_MAX_ENTRIES
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl: TtlTable::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entries: default_max_entries(),
        }
    }
}

/// Change detection section
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeSection {
    /// Relative change per tracked field that counts as a change (0.05 = 5%)
    #[serde(default = "default_change_thresholds")]
    pub thresholds: BTreeMap<String, f64>,
    /// Idle cycles before a tracked token is retired
    #[serde(default = "default_eviction_cycles")]
    pub eviction_cycles: u32,
}

fn default_change_thresholds() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("price_usd".to_string(), 0.05),
        ("liquidity_usd".to_string(), 0.10),
        ("volume_24h".to_string(), 0.20),
        ("holder_count".to_string(), 0.05),
    ])
}

fn default_eviction_cycles() -> u32 {
    10
}

impl Default for ChangeSection {
    fn default() -> Self {
        Self {
            thresholds: default_change_thresholds(),
            eviction_cycles: default_eviction_cycles(),
        }
    }
}

/// Orchestrator configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// Global cap on in-flight provider calls
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
}

fn default_worker_pool() -> usize {
    8
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            worker_pool: default_worker_pool(),
        }
    }
}

/// One `[providers.<name>]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    #[serde(flatten)]
    pub http: HttpProviderConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-provider cap on in-flight calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    4
}

/// Alerts configuration section (optional)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsSection {
    /// Log the per-factor breakdown with every promotion
    #[serde(default)]
    pub log_breakdown: bool,
}

/// Persistence configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    /// Directory for state and cache snapshots (`~` is expanded)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Known entity registry file (TOML)
    #[serde(default)]
    pub registry_path: Option<String>,
    /// How often the registry file is re-read
    #[serde(default = "default_registry_refresh_secs")]
    pub registry_refresh_secs: u64,
}

fn default_registry_refresh_secs() -> u64 {
    300
}

fn default_data_dir() -> String {
    "~/.butters-scout".to_string()
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            registry_path: None,
            registry_refresh_secs: default_registry_refresh_secs(),
        }
    }
}

impl PersistenceSection {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    pub fn registry_path(&self) -> Option<PathBuf> {
        self.registry_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::ValidationError(msg)
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_scheduler()?;

        if self.discovery.source.url.is_empty() {
            return Err(invalid("discovery.url cannot be empty".to_string()));
        }
        if self.discovery.filter.limit == 0 {
            return Err(invalid("discovery.filter.limit must be > 0".to_string()));
        }

        self.validate_pipeline()?;

        // Cache
        for category in FieldCategory::ALL {
            if self.cache.ttl.ttl_secs(category) == 0 {
                return Err(invalid(format!("cache.ttl.{} must be > 0", category)));
            }
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be > 0".to_string()));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs must be > 0".to_string()));
        }

        // Change detection
        for (field, threshold) in &self.change.thresholds {
            if !QuickFields::TRACKABLE.contains(&field.as_str()) {
                return Err(invalid(format!("change.thresholds: unknown field '{}'", field)));
            }
            if !threshold.is_finite() || *threshold < 0.0 {
                return Err(invalid(format!(
                    "change.thresholds.{} must be >= 0, got {}",
                    field, threshold
                )));
            }
        }
        if self.change.eviction_cycles == 0 {
            return Err(invalid("change.eviction_cycles must be > 0".to_string()));
        }

        // Scoring: weights, factor names, scales and grade bands
        ScoringEngine::from_config(&self.scoring)
            .map_err(|e| invalid(format!("scoring: {}", e)))?;

        if self.orchestrator.worker_pool == 0 {
            return Err(invalid("orchestrator.worker_pool must be > 0".to_string()));
        }

        for (name, provider) in &self.providers {
            Self::validate_provider(name, provider)?;
        }

        Ok(())
    }

    fn validate_scheduler(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.min_interval_secs <= 0.0 {
            return Err(invalid(format!(
                "scheduler.min_interval_secs must be > 0, got {}",
                s.min_interval_secs
            )));
        }
        if s.min_interval_secs > s.max_interval_secs {
            return Err(invalid(format!(
                "scheduler.min_interval_secs ({}) > max_interval_secs ({})",
                s.min_interval_secs, s.max_interval_secs
            )));
        }
        if s.ease_factor <= 0.0 || s.ease_factor > 1.0 {
            return Err(invalid(format!(
                "scheduler.ease_factor must be in (0, 1], got {}",
                s.ease_factor
            )));
        }
        if !(0.0..=1.0).contains(&s.hot_fraction) {
            return Err(invalid(format!(
                "scheduler.hot_fraction must be 0-1, got {}",
                s.hot_fraction
            )));
        }
        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        for (name, value) in [
            ("quick_threshold", p.quick_threshold),
            ("medium_threshold", p.medium_threshold),
            ("full_threshold", p.full_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid(format!("pipeline.{} must be 0-100, got {}", name, value)));
            }
        }
        for multiplier in &p.relaxation {
            if *multiplier <= 0.0 || *multiplier > 1.0 {
                return Err(invalid(format!(
                    "pipeline.relaxation multipliers must be in (0, 1], got {}",
                    multiplier
                )));
            }
        }
        for spec in p.medium_fetches.iter().chain(&p.full_fetches) {
            self.validate_fetch_spec(spec)?;
        }
        Ok(())
    }

    fn validate_fetch_spec(&self, spec: &FetchSpec) -> Result<(), ConfigError> {
        let provider = self.providers.get(&spec.provider).ok_or_else(|| {
            invalid(format!(
                "pipeline fetch references unknown provider '{}'",
                spec.provider
            ))
        })?;
        if !provider.http.endpoints.contains_key(&spec.endpoint) {
            return Err(invalid(format!(
                "pipeline fetch references unknown endpoint '{}.{}'",
                spec.provider, spec.endpoint
            )));
        }
        Ok(())
    }

    fn validate_provider(name: &str, provider: &ProviderSection) -> Result<(), ConfigError> {
        if provider.http.base_url.is_empty() {
            return Err(invalid(format!("providers.{}.base_url cannot be empty", name)));
        }
        if provider.rate_limit.capacity < MIN_CAPACITY {
            return Err(invalid(format!(
                "providers.{}.rate_limit.capacity must be >= {}, got {}",
                name, MIN_CAPACITY, provider.rate_limit.capacity
            )));
        }
        if provider.rate_limit.refill_per_sec <= 0.0 {
            return Err(invalid(format!(
                "providers.{}.rate_limit.refill_per_sec must be > 0",
                name
            )));
        }
        if provider.max_concurrency == 0 {
            return Err(invalid(format!("providers.{}.max_concurrency must be > 0", name)));
        }
        if provider.http.max_batch_size == 0 {
            return Err(invalid(format!("providers.{}.max_batch_size must be > 0", name)));
        }
        if provider.http.base_cost <= 0.0 {
            return Err(invalid(format!("providers.{}.base_cost must be > 0", name)));
        }
        for (endpoint, cfg) in &provider.http.endpoints {
            if cfg.max_batch_size == Some(0) {
                return Err(invalid(format!(
                    "providers.{}.endpoints.{}.max_batch_size must be > 0",
                    name, endpoint
                )));
            }
            if cfg.base_cost.map_or(false, |c| c <= 0.0) {
                return Err(invalid(format!(
                    "providers.{}.endpoints.{}.base_cost must be > 0",
                    name, endpoint
                )));
            }
        }
        Ok(())
    }
}
