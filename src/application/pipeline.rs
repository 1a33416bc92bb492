//! Progressive Filter Pipeline
//!
//! One discovery cycle, cheapest gate first:
//!
//! ```text
//! discover (relax if thin) -> change filter -> quick score (seed fields only)
//!   -> medium fetch + score -> full fetch + final composite -> promote
//! ```
//!
//! Each gate only fetches data for the candidates that survived the previous
//! one, so most tokens never cost a provider call. Candidates move strictly
//! forward through their stages. State is reconciled once, after the last
//! gate; a cancelled cycle commits nothing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::adapters::cache_store::CategoryStats;
use crate::application::batch_orchestrator::{BatchRequestOrchestrator, FetchReport, FetchRequest, KeyOutcome};
use crate::domain::{
    AnalysisOutcome, Candidate, CandidateSeed, ChangeDetector, CommitSummary, CycleSignals,
    Elimination, EliminationReason, FieldCategory, Gate, KnownEntityRegistry, RegistrySnapshot,
    ScoreResult, ScoringEngine, Stage, StageError, StateCache,
};
use crate::ports::{AlertSink, DiscoveryError, DiscoveryFilter, DiscoverySource};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl PipelineError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PipelineError::Discovery(DiscoveryError::RateLimited { .. }))
    }
}

/// Fields fetched for one gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub provider: String,
    pub endpoint: String,
    pub category: FieldCategory,
    /// Missing data does not eliminate the candidate
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub quick_threshold: f64,
    pub medium_threshold: f64,
    pub full_threshold: f64,
    /// Fewer seeds than this triggers discovery relaxation
    #[serde(default)]
    pub min_yield: usize,
    /// Multipliers applied to the base discovery filter, in order
    #[serde(default)]
    pub relaxation: Vec<f64>,
    #[serde(default)]
    pub medium_fetches: Vec<FetchSpec>,
    #[serde(default)]
    pub full_fetches: Vec<FetchSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quick_threshold: 40.0,
            medium_threshold: 50.0,
            full_threshold: 65.0,
            min_yield: 20,
            relaxation: vec![0.8, 0.65],
            medium_fetches: Vec::new(),
            full_fetches: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn threshold(&self, gate: Gate) -> f64 {
        match gate {
            Gate::Quick => self.quick_threshold,
            Gate::Medium => self.medium_threshold,
            Gate::Full => self.full_threshold,
        }
    }
}

/// Where one candidate ended up this cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateTrace {
    pub key: String,
    pub history: Vec<Stage>,
    pub stage_scores: BTreeMap<Gate, f64>,
    pub elimination: Option<Elimination>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub discovered: usize,
    pub relaxation_steps: usize,
    pub changed: usize,
    pub quick_passed: usize,
    pub medium_passed: usize,
    pub fully_scored: usize,
    pub promoted: Vec<ScoreResult>,
    pub eliminated: BTreeMap<Gate, usize>,
    pub fetch: FetchReport,
    pub cache: BTreeMap<FieldCategory, CategoryStats>,
    pub discovery_rate_limited: bool,
    pub cancelled: bool,
    pub commit: Option<CommitSummary>,
    pub traces: Vec<CandidateTrace>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    pub fn rate_limited(&self) -> bool {
        self.discovery_rate_limited || self.fetch.rate_limited > 0
    }

    pub fn cache_totals(&self) -> CategoryStats {
        self.cache
            .values()
            .fold(CategoryStats::default(), |acc, s| CategoryStats {
                hits: acc.hits + s.hits,
                misses: acc.misses + s.misses,
            })
    }

    pub fn signals(&self) -> CycleSignals {
        CycleSignals {
            discovered: self.discovered,
            changed: self.changed,
            promoted: self.promoted.len(),
            rate_limited: self.rate_limited(),
            failed: false,
        }
    }
}

pub struct ProgressiveFilterPipeline {
    discovery: Arc<dyn DiscoverySource>,
    orchestrator: Arc<BatchRequestOrchestrator>,
    scoring: Arc<ScoringEngine>,
    registry: Arc<KnownEntityRegistry>,
    alerts: Arc<dyn AlertSink>,
    detector: ChangeDetector,
    config: PipelineConfig,
    base_filter: DiscoveryFilter,
    eviction_cycles: u32,
}

impl ProgressiveFilterPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<dyn DiscoverySource>,
        orchestrator: Arc<BatchRequestOrchestrator>,
        scoring: Arc<ScoringEngine>,
        registry: Arc<KnownEntityRegistry>,
        alerts: Arc<dyn AlertSink>,
        detector: ChangeDetector,
        config: PipelineConfig,
        base_filter: DiscoveryFilter,
        eviction_cycles: u32,
    ) -> Self {
        Self {
            discovery,
            orchestrator,
            scoring,
            registry,
            alerts,
            detector,
            config,
            base_filter,
            eviction_cycles,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<BatchRequestOrchestrator> {
        &self.orchestrator
    }

    /// Run one full cycle and reconcile `state`.
    ///
    /// Discovery failure aborts the cycle with an error. Anything after
    /// discovery is recovered locally by eliminating the affected candidates.
    pub async fn run_cycle(
        &self,
        state: &mut StateCache,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, PipelineError> {
        let started = Instant::now();
        let cache_before = self.orchestrator.cache().stats();
        let registry = self.registry.snapshot();
        let mut report = CycleReport::default();

        let seeds = self.discover(cancel, &mut report).await?;
        report.discovered = seeds.len();

        let mut candidates: Vec<Candidate> = seeds
            .into_iter()
            .filter(|seed| {
                self.detector
                    .has_changed(state.previous(&seed.key), &seed.quick)
            })
            .map(|seed| {
                let previous = state.previous(&seed.key).cloned();
                let analyzed_at = state.tracked(&seed.key).map(|t| t.last_analyzed_at);
                let mut candidate = Candidate::from_seed(seed);
                candidate.last_seen_snapshot = previous;
                candidate.last_analyzed_at = analyzed_at;
                candidate
            })
            .collect();
        report.changed = candidates.len();
        tracing::debug!(
            discovered = report.discovered,
            changed = report.changed,
            "Change filter applied"
        );

        let completed = self
            .run_gates(&mut candidates, &registry, cancel, &mut report)
            .await?;

        report.cache = self.orchestrator.cache().stats().since(&cache_before);
        report.traces = candidates
            .iter()
            .map(|c| CandidateTrace {
                key: c.key.clone(),
                history: c.history.clone(),
                stage_scores: c.stage_scores.clone(),
                elimination: c.elimination.clone(),
            })
            .collect();

        if completed {
            self.publish_alerts(&report.promoted).await;
            report.commit = Some(self.commit(state, &candidates));
        } else {
            report.cancelled = true;
            tracing::info!("Cycle cancelled, state not committed");
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Discover with the base filter, relaxing it step by step while the yield
    /// stays below `min_yield`.
    async fn discover(
        &self,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<Vec<CandidateSeed>, PipelineError> {
        let mut seeds = match self.discovery.discover(&self.base_filter).await {
            Ok(seeds) => seeds,
            Err(e) => {
                report.discovery_rate_limited =
                    matches!(e, DiscoveryError::RateLimited { .. });
                return Err(e.into());
            }
        };

        for multiplier in &self.config.relaxation {
            if seeds.len() >= self.config.min_yield || cancel.is_cancelled() {
                break;
            }
            let relaxed = self.base_filter.relaxed(*multiplier);
            match self.discovery.discover(&relaxed).await {
                Ok(more) => {
                    report.relaxation_steps += 1;
                    tracing::info!(
                        multiplier,
                        before = seeds.len(),
                        after = more.len(),
                        "Discovery yield low, relaxed filter"
                    );
                    if more.len() >= seeds.len() {
                        seeds = more;
                    }
                }
                Err(e) => {
                    report.discovery_rate_limited |=
                        matches!(e, DiscoveryError::RateLimited { .. });
                    tracing::warn!(error = %e, multiplier, "Relaxed discovery failed, keeping current yield");
                    break;
                }
            }
        }

        let mut seen = HashSet::new();
        seeds.retain(|seed| seen.insert(seed.key.clone()));
        Ok(seeds)
    }

    /// Returns false if cancelled before the last gate finished.
    async fn run_gates(
        &self,
        candidates: &mut [Candidate],
        registry: &RegistrySnapshot,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<bool, PipelineError> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        self.score_gate(Gate::Quick, candidates, registry, report)?;
        report.quick_passed = count_at(candidates, Stage::QuickPassed);

        if cancel.is_cancelled() {
            return Ok(false);
        }
        self.fetch_gate(Gate::Medium, &self.config.medium_fetches, candidates, cancel, report)
            .await?;
        self.score_gate(Gate::Medium, candidates, registry, report)?;
        report.medium_passed = count_at(candidates, Stage::MediumPassed);

        if cancel.is_cancelled() {
            return Ok(false);
        }
        self.fetch_gate(Gate::Full, &self.config.full_fetches, candidates, cancel, report)
            .await?;
        if cancel.is_cancelled() {
            return Ok(false);
        }
        self.final_gate(candidates, registry, report)?;
        Ok(true)
    }

    /// Score active candidates at `gate`; pass or eliminate on its threshold.
    fn score_gate(
        &self,
        gate: Gate,
        candidates: &mut [Candidate],
        registry: &RegistrySnapshot,
        report: &mut CycleReport,
    ) -> Result<(), PipelineError> {
        let threshold = self.config.threshold(gate);
        for candidate in candidates.iter_mut().filter(|c| c.is_active()) {
            let stage = self
                .scoring
                .score_stage(gate, &candidate.key, &candidate.fields, registry);
            candidate.record_score(gate, stage.score);
            if stage.score >= threshold {
                candidate.pass()?;
            } else {
                eliminate(
                    candidate,
                    gate,
                    EliminationReason::BelowThreshold {
                        score: stage.score,
                        threshold,
                    },
                    report,
                )?;
            }
        }
        Ok(())
    }

    /// One coalesced fetch of every spec for every active candidate.
    async fn fetch_gate(
        &self,
        gate: Gate,
        specs: &[FetchSpec],
        candidates: &mut [Candidate],
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), PipelineError> {
        let keys: Vec<String> = candidates
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.key.clone())
            .collect();
        if keys.is_empty() || specs.is_empty() {
            return Ok(());
        }

        let requests: Vec<FetchRequest> = specs
            .iter()
            .map(|spec| FetchRequest {
                provider: spec.provider.clone(),
                endpoint: spec.endpoint.clone(),
                category: spec.category,
                keys: keys.clone(),
            })
            .collect();
        let mut output = self.orchestrator.fetch(&requests, cancel).await;
        report.fetch.merge(&output.report);
        tracing::debug!(
            %gate,
            candidates = keys.len(),
            calls = output.report.calls,
            cost = output.report.cost_spent,
            "Gate fetch complete"
        );

        for (spec, results) in specs.iter().zip(output.results.iter_mut()) {
            for candidate in candidates.iter_mut().filter(|c| c.is_active()) {
                let outcome = results
                    .remove(&candidate.key)
                    .unwrap_or(KeyOutcome::FetchFailed);
                let reason = match outcome {
                    KeyOutcome::Found(record) => {
                        candidate.attach(record);
                        continue;
                    }
                    KeyOutcome::NotFound => EliminationReason::NotFound {
                        category: spec.category,
                    },
                    KeyOutcome::FetchFailed => EliminationReason::FetchFailed {
                        category: spec.category,
                    },
                };
                if !spec.optional {
                    eliminate(candidate, gate, reason, report)?;
                }
            }
        }
        Ok(())
    }

    /// Final composite; every survivor becomes FullyScored, then Promoted or Eliminated.
    fn final_gate(
        &self,
        candidates: &mut [Candidate],
        registry: &RegistrySnapshot,
        report: &mut CycleReport,
    ) -> Result<(), PipelineError> {
        let threshold = self.config.full_threshold;
        for candidate in candidates.iter_mut().filter(|c| c.is_active()) {
            let result = self.scoring.finalize(candidate, registry);
            candidate.record_score(Gate::Full, result.composite_score);
            candidate.pass()?;
            report.fully_scored += 1;

            if result.composite_score >= threshold {
                candidate.pass()?;
                tracing::info!(
                    token = %candidate.label(),
                    key = %candidate.key,
                    score = format!("{:.1}", result.composite_score),
                    grade = %result.grade,
                    "Candidate promoted"
                );
                report.promoted.push(result);
            } else {
                eliminate(
                    candidate,
                    Gate::Full,
                    EliminationReason::BelowThreshold {
                        score: result.composite_score,
                        threshold,
                    },
                    report,
                )?;
            }
        }
        Ok(())
    }

    async fn publish_alerts(&self, promoted: &[ScoreResult]) {
        for result in promoted {
            if let Err(e) = self.alerts.publish(result).await {
                tracing::warn!(key = %result.candidate_key, error = %e, "Alert delivery failed");
            }
        }
    }

    /// Single-threaded end-of-cycle reconciliation.
    fn commit(&self, state: &mut StateCache, candidates: &[Candidate]) -> CommitSummary {
        let now = Utc::now();
        let outcomes = candidates
            .iter()
            .map(|c| AnalysisOutcome {
                key: c.key.clone(),
                snapshot: self.detector.snapshot(&c.fields.quick, now),
                score: c.stage_scores.values().next_back().copied(),
                promoted: c.stage == Stage::Promoted,
            })
            .collect();
        state.commit_cycle(outcomes, self.eviction_cycles, now)
    }
}

fn eliminate(
    candidate: &mut Candidate,
    gate: Gate,
    reason: EliminationReason,
    report: &mut CycleReport,
) -> Result<(), PipelineError> {
    tracing::debug!(key = %candidate.key, %gate, ?reason, "Candidate eliminated");
    candidate.eliminate(gate, reason)?;
    *report.eliminated.entry(gate).or_default() += 1;
    Ok(())
}

fn count_at(candidates: &[Candidate], stage: Stage) -> usize {
    candidates.iter().filter(|c| c.stage == stage).count()
}
