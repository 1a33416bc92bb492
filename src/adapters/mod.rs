//! Adapters Layer - External System Implementations
//!
//! This module contains implementations of the port traits and the
//! infrastructure the application layer runs on:
//! - Rate limiter: token buckets per provider domain
//! - Cache store: TTL cache of fetched fields, with snapshots
//! - HTTP: batch provider client and discovery feed
//! - Log alert sink: promoted tokens as structured log lines
//! - CLI: Command-line interface handlers

pub mod rate_limiter;
pub mod cache_store;
pub mod http;
pub mod log_alert_sink;
pub mod cli;

pub use rate_limiter::{RateLimitConfig, RateLimitError, RateLimitStatus, RateLimiter};
pub use cache_store::{CacheStats, CacheStore, CachedField, CategoryStats, TtlTable};
pub use http::{HttpDiscoveryConfig, HttpDiscoverySource, HttpProviderClient, HttpProviderConfig};
pub use log_alert_sink::LogAlertSink;
pub use cli::CliApp;
