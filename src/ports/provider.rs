use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Call-level provider failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The whole call addressed something that does not exist (single-key 404)
    #[error("Not found")]
    NotFound,

    #[error("Fatal provider error: {0}")]
    Fatal(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

impl ProviderError {
    /// Whether the same call may succeed if retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

/// Per-key failure inside an otherwise successful batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key not found")]
    NotFound,

    #[error("malformed key: {0}")]
    Malformed(String),
}

pub type KeyResult = Result<Value, KeyError>;

/// Batch responses are keyed, never positional
pub type BatchResponse = HashMap<String, KeyResult>;

/// A rate-limited, cost-metered data provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name; also its rate-limit domain
    fn name(&self) -> &str;

    fn max_batch_size(&self, endpoint: &str) -> usize;

    fn base_cost(&self, endpoint: &str) -> f64;

    /// Fetch raw field objects for `keys`. Keys absent from the response are
    /// treated as not found by the caller.
    async fn fetch_batch(&self, endpoint: &str, keys: &[String])
        -> Result<BatchResponse, ProviderError>;
}
