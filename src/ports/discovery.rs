use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::CandidateSeed;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("Discovery source unreachable: {0}")]
    Unreachable(String),

    #[error("Discovery rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid discovery response: {0}")]
    InvalidResponse(String),
}

/// Minimums a seed must meet to be returned by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryFilter {
    pub min_liquidity_usd: f64,
    pub min_volume_24h: f64,
    pub min_market_cap: f64,
    pub min_holders: u64,
    pub max_age_hours: Option<f64>,
    pub limit: usize,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            min_liquidity_usd: 50_000.0,
            min_volume_24h: 100_000.0,
            min_market_cap: 100_000.0,
            min_holders: 100,
            max_age_hours: None,
            limit: 200,
        }
    }
}

impl DiscoveryFilter {
    /// Scale every minimum by `multiplier` (0.8 = 20% looser)
    pub fn relaxed(&self, multiplier: f64) -> Self {
        Self {
            min_liquidity_usd: self.min_liquidity_usd * multiplier,
            min_volume_24h: self.min_volume_24h * multiplier,
            min_market_cap: self.min_market_cap * multiplier,
            min_holders: (self.min_holders as f64 * multiplier).floor() as u64,
            max_age_hours: self.max_age_hours,
            limit: self.limit,
        }
    }

    pub fn admits(&self, seed: &CandidateSeed) -> bool {
        let q = &seed.quick;
        q.liquidity_usd.unwrap_or(0.0) >= self.min_liquidity_usd
            && q.volume_24h.unwrap_or(0.0) >= self.min_volume_24h
            && q.market_cap.unwrap_or(0.0) >= self.min_market_cap
            && q.holder_count.unwrap_or(0) >= self.min_holders
            && self
                .max_age_hours
                .map_or(true, |max| q.age_hours.map_or(true, |age| age <= max))
    }
}

/// Yields candidate seeds
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self, filter: &DiscoveryFilter)
        -> Result<Vec<CandidateSeed>, DiscoveryError>;
}
