use async_trait::async_trait;
use thiserror::Error;

use crate::domain::ScoreResult;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Alert delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Receives promoted results. Delivery failures never fail a cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, result: &ScoreResult) -> Result<(), AlertError>;
}
