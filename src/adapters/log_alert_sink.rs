//! Alert sink that writes promoted tokens to the log.

use async_trait::async_trait;

use crate::domain::ScoreResult;
use crate::ports::{AlertError, AlertSink};

#[derive(Debug, Clone, Default)]
pub struct LogAlertSink {
    /// Also log the per-factor breakdown at info level
    pub include_breakdown: bool,
}

impl LogAlertSink {
    pub fn new(include_breakdown: bool) -> Self {
        Self { include_breakdown }
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn publish(&self, result: &ScoreResult) -> Result<(), AlertError> {
        tracing::info!(
            target: "butters_scout::alerts",
            key = %result.candidate_key,
            symbol = result.symbol.as_deref().unwrap_or("?"),
            score = format!("{:.1}", result.composite_score),
            grade = %result.grade,
            adjustments = result.adjustments.len(),
            registry_version = result.registry_version,
            "PROMOTED"
        );
        if self.include_breakdown {
            for factor in &result.factor_breakdown {
                tracing::info!(
                    target: "butters_scout::alerts",
                    key = %result.candidate_key,
                    factor = %factor.name,
                    normalized = format!("{:.1}", factor.normalized),
                    weight = factor.weight,
                    missing = factor.missing,
                    "  factor"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Grade, ScoreResult};
    use std::collections::BTreeMap;

    #[test]
    fn test_publish_never_fails() {
        let result = ScoreResult {
            candidate_key: "Mint1".to_string(),
            symbol: Some("BONK".to_string()),
            stage_scores: BTreeMap::new(),
            composite_score: 72.0,
            factor_breakdown: Vec::new(),
            adjustments: Vec::new(),
            grade: Grade::B,
            registry_version: 1,
        };
        tokio_test::assert_ok!(tokio_test::block_on(LogAlertSink::new(true).publish(&result)));
    }
}
