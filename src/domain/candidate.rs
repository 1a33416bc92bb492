//! Candidate
//!
//! A discovered token under evaluation, and the forward-only stage machine it
//! moves through within one cycle:
//!
//! ```text
//! Discovered -> QuickPassed -> MediumPassed -> FullyScored -> Promoted
//!      \              \              \               \
//!       +--------------+--------------+---------------+--> Eliminated
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::change_detector::FieldSnapshot;
use super::fields::{FieldBag, FieldCategory, FieldRecord, QuickFields};

/// Score gate. Each gate has its own threshold and its own data requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Quick,
    Medium,
    Full,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Quick => f.write_str("quick"),
            Gate::Medium => f.write_str("medium"),
            Gate::Full => f.write_str("full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Discovered,
    QuickPassed,
    MediumPassed,
    FullyScored,
    Promoted,
    Eliminated,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Promoted | Stage::Eliminated)
    }

    /// The single stage that may follow `self` on success.
    fn next_on_pass(&self) -> Option<Stage> {
        match self {
            Stage::Discovered => Some(Stage::QuickPassed),
            Stage::QuickPassed => Some(Stage::MediumPassed),
            Stage::MediumPassed => Some(Stage::FullyScored),
            Stage::FullyScored => Some(Stage::Promoted),
            Stage::Promoted | Stage::Eliminated => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StageError {
    #[error("Illegal stage transition for {key}: {from:?} -> {to:?}")]
    IllegalTransition { key: String, from: Stage, to: Stage },
}

/// Why a candidate left the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EliminationReason {
    BelowThreshold { score: f64, threshold: f64 },
    NotFound { category: FieldCategory },
    FetchFailed { category: FieldCategory },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Elimination {
    pub gate: Gate,
    pub reason: EliminationReason,
}

/// What discovery hands the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSeed {
    /// Opaque key (a mint address for Solana tokens)
    pub key: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    /// Source that yielded the seed, for logging
    pub source: String,
    pub quick: QuickFields,
}

impl CandidateSeed {
    pub fn new(key: impl Into<String>, source: impl Into<String>, quick: QuickFields) -> Self {
        Self {
            key: key.into(),
            symbol: None,
            name: None,
            source: source.into(),
            quick,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub fields: FieldBag,
    pub stage: Stage,
    /// Every stage this candidate has occupied this cycle, in order
    pub history: Vec<Stage>,
    pub stage_scores: BTreeMap<Gate, f64>,
    pub elimination: Option<Elimination>,
    pub last_seen_snapshot: Option<FieldSnapshot>,
    pub last_analyzed_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn from_seed(seed: CandidateSeed) -> Self {
        Self {
            key: seed.key,
            symbol: seed.symbol,
            name: seed.name,
            fields: FieldBag::new(seed.quick),
            stage: Stage::Discovered,
            history: vec![Stage::Discovered],
            stage_scores: BTreeMap::new(),
            elimination: None,
            last_seen_snapshot: None,
            last_analyzed_at: None,
        }
    }

    pub fn label(&self) -> &str {
        self.symbol.as_deref().unwrap_or(&self.key)
    }

    pub fn is_active(&self) -> bool {
        !self.stage.is_terminal()
    }

    /// Move one step forward after passing the current gate.
    pub fn pass(&mut self) -> Result<Stage, StageError> {
        let next = self
            .stage
            .next_on_pass()
            .ok_or_else(|| StageError::IllegalTransition {
                key: self.key.clone(),
                from: self.stage,
                to: self.stage,
            })?;
        self.transition(next)?;
        Ok(next)
    }

    pub fn eliminate(&mut self, gate: Gate, reason: EliminationReason) -> Result<(), StageError> {
        self.transition(Stage::Eliminated)?;
        self.elimination = Some(Elimination { gate, reason });
        Ok(())
    }

    pub fn record_score(&mut self, gate: Gate, score: f64) {
        self.stage_scores.insert(gate, score);
    }

    pub fn attach(&mut self, record: FieldRecord) {
        self.fields.insert(record);
    }

    /// True if the stage history visited every stage in `required`, in order.
    pub fn visited_in_order(&self, required: &[Stage]) -> bool {
        let mut it = self.history.iter();
        required.iter().all(|stage| it.any(|s| s == stage))
    }

    fn transition(&mut self, to: Stage) -> Result<(), StageError> {
        let legal = match to {
            Stage::Eliminated => !self.stage.is_terminal(),
            other => self.stage.next_on_pass() == Some(other),
        };
        if !legal {
            return Err(StageError::IllegalTransition {
                key: self.key.clone(),
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        self.history.push(to);
        Ok(())
    }
}
