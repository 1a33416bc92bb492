//! HTTP Discovery Source
//!
//! Lists candidate tokens from a JSON endpoint. Filter minimums go out as query
//! parameters and are re-applied locally, since not every feed honours them.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::domain::{CandidateSeed, QuickFields};
use crate::ports::{DiscoveryError, DiscoveryFilter, DiscoverySource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpDiscoveryConfig {
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_key_header() -> String {
    "X-API-KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

impl HttpDiscoveryConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key_env: None,
            api_key_header: default_api_key_header(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDiscoverySource {
    config: HttpDiscoveryConfig,
    api_key: Option<String>,
    http: Client,
}

impl HttpDiscoverySource {
    pub fn new(config: HttpDiscoveryConfig, api_key: Option<String>) -> Result<Self, DiscoveryError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DiscoveryError::Unreachable(e.to_string()))?;
        Ok(Self { config, api_key, http })
    }

    pub fn from_env(config: HttpDiscoveryConfig) -> Result<Self, DiscoveryError> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self::new(config, api_key)
    }

    fn query(filter: &DiscoveryFilter) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("min_liquidity", filter.min_liquidity_usd.to_string()),
            ("min_volume_24h", filter.min_volume_24h.to_string()),
            ("min_market_cap", filter.min_market_cap.to_string()),
            ("min_holders", filter.min_holders.to_string()),
            ("limit", filter.limit.to_string()),
        ];
        if let Some(age) = filter.max_age_hours {
            query.push(("max_age_hours", age.to_string()));
        }
        query
    }
}

/// Accepts a bare array or an object wrapping it in `tokens` or `data`.
fn parse_seeds(body: &Value, source: &str) -> Result<Vec<CandidateSeed>, DiscoveryError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("tokens").or_else(|| obj.get("data")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(DiscoveryError::InvalidResponse(
                    "expected a token list".to_string(),
                ))
            }
        },
        _ => {
            return Err(DiscoveryError::InvalidResponse(
                "expected a token list".to_string(),
            ))
        }
    };

    let seeds = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let key = ["address", "mint", "key"]
                .iter()
                .find_map(|name| obj.get(*name)?.as_str())
                .filter(|key| !key.is_empty())?;
            let mut seed = CandidateSeed::new(key, source, QuickFields::from_json(obj));
            seed.symbol = obj.get("symbol").and_then(Value::as_str).map(str::to_string);
            seed.name = obj.get("name").and_then(Value::as_str).map(str::to_string);
            Some(seed)
        })
        .collect();
    Ok(seeds)
}

#[async_trait]
impl DiscoverySource for HttpDiscoverySource {
    fn name(&self) -> &str {
        &self.config.url
    }

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<CandidateSeed>, DiscoveryError> {
        let mut request = self.http.get(&self.config.url).query(&Self::query(filter));
        if let Some(key) = &self.api_key {
            request = request.header(self.config.api_key_header.as_str(), key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(DiscoveryError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(DiscoveryError::Unreachable(format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        let seeds = parse_seeds(&body, self.name())?;
        let returned = seeds.len();
        let admitted: Vec<CandidateSeed> = seeds
            .into_iter()
            .filter(|seed| filter.admits(seed))
            .take(filter.limit)
            .collect();

        tracing::debug!(
            returned,
            admitted = admitted.len(),
            "Discovery fetched"
        );
        Ok(admitted)
    }
}
