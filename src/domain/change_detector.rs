//! Change Detection
//!
//! Decides which previously seen tokens deserve another pass through the
//! pipeline. A token is re-analyzed only when one of its tracked discovery
//! fields moved by more than that field's relative threshold since the last
//! time it was processed.
//!
//! `StateCache` owns the snapshots. It is only mutated by `commit_cycle`, which
//! the pipeline calls once, single-threaded, at the end of each cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::fields::QuickFields;

/// Relative changes below this denominator are measured against it instead,
/// so a move from 0 to a tiny value does not read as an infinite change.
const MIN_DENOMINATOR: f64 = 1e-9;

/// Tracked discovery fields of a token, as of the last cycle it was processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub values: BTreeMap<String, f64>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeVerdict {
    /// Never processed before
    New,
    /// `field` moved by `relative` (fraction), at or above its threshold
    Changed { field: String, relative: f64 },
    /// A tracked field appeared or disappeared
    Presence { field: String },
    Unchanged,
}

impl ChangeVerdict {
    pub fn needs_analysis(&self) -> bool {
        !matches!(self, ChangeVerdict::Unchanged)
    }
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    /// field name -> minimum relative change (0.2 = 20%)
    thresholds: BTreeMap<String, f64>,
}

impl ChangeDetector {
    pub fn new(thresholds: BTreeMap<String, f64>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &BTreeMap<String, f64> {
        &self.thresholds
    }

    pub fn snapshot(&self, quick: &QuickFields, at: DateTime<Utc>) -> FieldSnapshot {
        let values = self
            .thresholds
            .keys()
            .filter_map(|field| quick.tracked_value(field).map(|v| (field.clone(), v)))
            .collect();
        FieldSnapshot {
            values,
            taken_at: at,
        }
    }

    pub fn compare(&self, previous: Option<&FieldSnapshot>, current: &QuickFields) -> ChangeVerdict {
        let Some(previous) = previous else {
            return ChangeVerdict::New;
        };

        for (field, threshold) in &self.thresholds {
            let before = previous.values.get(field).copied();
            let now = current.tracked_value(field);
            match (before, now) {
                (Some(before), Some(now)) => {
                    let relative = (now - before).abs() / before.abs().max(MIN_DENOMINATOR);
                    if relative > 0.0 && relative >= *threshold {
                        return ChangeVerdict::Changed {
                            field: field.clone(),
                            relative,
                        };
                    }
                }
                (None, Some(_)) | (Some(_), None) => {
                    return ChangeVerdict::Presence {
                        field: field.clone(),
                    };
                }
                (None, None) => {}
            }
        }
        ChangeVerdict::Unchanged
    }

    pub fn has_changed(&self, previous: Option<&FieldSnapshot>, current: &QuickFields) -> bool {
        self.compare(previous, current).needs_analysis()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedState {
    pub snapshot: FieldSnapshot,
    pub first_seen_at: DateTime<Utc>,
    pub last_analyzed_at: DateTime<Utc>,
    pub last_score: Option<f64>,
    pub times_promoted: u32,
    /// Consecutive cycles with neither a detected change nor a qualifying score
    pub idle_cycles: u32,
}

/// A token dropped from active tracking. Kept so history is never lost and a
/// rediscovered token is compared against its last known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredRecord {
    pub snapshot: FieldSnapshot,
    /// Absent in snapshots written before it was tracked
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
    pub retired_at: DateTime<Utc>,
    pub last_score: Option<f64>,
    pub times_promoted: u32,
}

/// Result of one analyzed candidate, handed to `commit_cycle`.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub key: String,
    pub snapshot: FieldSnapshot,
    /// Final or last stage score reached
    pub score: Option<f64>,
    pub promoted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub committed: usize,
    pub reactivated: usize,
    pub retired: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateCache {
    active: HashMap<String, TrackedState>,
    retired: HashMap<String, RetiredRecord>,
    cycles_committed: u64,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last snapshot for `key`, whether actively tracked or retired.
    pub fn previous(&self, key: &str) -> Option<&FieldSnapshot> {
        self.active
            .get(key)
            .map(|s| &s.snapshot)
            .or_else(|| self.retired.get(key).map(|r| &r.snapshot))
    }

    pub fn tracked(&self, key: &str) -> Option<&TrackedState> {
        self.active.get(key)
    }

    pub fn iter_tracked(&self) -> impl Iterator<Item = (&String, &TrackedState)> {
        self.active.iter()
    }

    pub fn is_retired(&self, key: &str) -> bool {
        self.retired.contains_key(key)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn cycles_committed(&self) -> u64 {
        self.cycles_committed
    }

    /// Reconcile one cycle.
    ///
    /// Every analyzed token gets its snapshot replaced, promoted or not. Active
    /// tokens that were not analyzed this cycle age by one idle cycle; once a
    /// token has been idle for `eviction_cycles` it moves to the retired set.
    pub fn commit_cycle(
        &mut self,
        outcomes: Vec<AnalysisOutcome>,
        eviction_cycles: u32,
        now: DateTime<Utc>,
    ) -> CommitSummary {
        let mut summary = CommitSummary::default();
        let mut analyzed: HashSet<String> = HashSet::with_capacity(outcomes.len());

        for outcome in outcomes {
            analyzed.insert(outcome.key.clone());
            summary.committed += 1;

            let retired = self.retired.remove(&outcome.key);
            if retired.is_some() {
                summary.reactivated += 1;
            }

            let promoted = u32::from(outcome.promoted);
            match self.active.get_mut(&outcome.key) {
                Some(state) => {
                    state.snapshot = outcome.snapshot;
                    state.last_analyzed_at = now;
                    state.last_score = outcome.score;
                    state.times_promoted += promoted;
                    state.idle_cycles = 0;
                }
                None => {
                    let prior_promotions = retired.as_ref().map_or(0, |r| r.times_promoted);
                    let first_seen_at = retired.and_then(|r| r.first_seen_at).unwrap_or(now);
                    self.active.insert(
                        outcome.key,
                        TrackedState {
                            snapshot: outcome.snapshot,
                            first_seen_at,
                            last_analyzed_at: now,
                            last_score: outcome.score,
                            times_promoted: prior_promotions + promoted,
                            idle_cycles: 0,
                        },
                    );
                }
            }
        }

        let mut to_retire = Vec::new();
        for (key, state) in self.active.iter_mut() {
            if analyzed.contains(key) {
                continue;
            }
            state.idle_cycles += 1;
            if eviction_cycles > 0 && state.idle_cycles >= eviction_cycles {
                to_retire.push(key.clone());
            }
        }

        for key in to_retire {
            if let Some(state) = self.active.remove(&key) {
                tracing::debug!(key = %key, idle_cycles = state.idle_cycles, "Retiring idle token");
                self.retired.insert(
                    key,
                    RetiredRecord {
                        snapshot: state.snapshot,
                        first_seen_at: Some(state.first_seen_at),
                        retired_at: now,
                        last_score: state.last_score,
                        times_promoted: state.times_promoted,
                    },
                );
                summary.retired += 1;
            }
        }

        self.cycles_committed += 1;
        summary.active = self.active.len();
        summary
    }
}
