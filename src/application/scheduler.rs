//! Adaptive Scheduler
//!
//! Drives the pipeline on a loop. Each cycle's signals move the polling
//! interval: hot markets poll faster, quiet or failing ones back off, and a
//! rate-limit signal pins the interval at its maximum for a few cycles.
//!
//! State is committed by the pipeline and persisted here after every cycle,
//! so a restart resumes with the same change-detection baseline.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::pipeline::{CycleReport, ProgressiveFilterPipeline};
use crate::domain::{
    CycleSignals, IntervalDecision, SchedulerConfig, SchedulerState, SnapshotStore, StateCache,
};

/// Outcome of one scheduled cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub report: Option<CycleReport>,
    pub error: Option<String>,
    pub decision: IntervalDecision,
    pub next_interval_secs: f64,
}

/// Current scheduler status
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub cycles_run: u64,
    pub current_interval_secs: f64,
    pub consecutive_quiet_cycles: u32,
    pub consecutive_error_cycles: u32,
    pub in_fail_safe: bool,
    pub tracked_tokens: usize,
    pub retired_tokens: usize,
}

pub struct AdaptiveScheduler {
    pipeline: ProgressiveFilterPipeline,
    config: SchedulerConfig,
    store: Option<SnapshotStore>,
    state: Mutex<StateCache>,
    schedule: Mutex<SchedulerState>,
    cycles_run: AtomicU64,
}

impl AdaptiveScheduler {
    pub fn new(pipeline: ProgressiveFilterPipeline, config: SchedulerConfig) -> Self {
        let schedule = SchedulerState::new(&config);
        Self {
            pipeline,
            config,
            store: None,
            state: Mutex::new(StateCache::new()),
            schedule: Mutex::new(schedule),
            cycles_run: AtomicU64::new(0),
        }
    }

    /// Persist state to `store` after every cycle, resuming from what it holds.
    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        let state = store.load_state();
        tracing::info!(
            "Recovered state: {} tracked, {} retired, {} cycles",
            state.active_len(),
            state.retired_len(),
            state.cycles_committed()
        );
        self.state = Mutex::new(state);
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one cycle and fold its signals into the interval.
    pub async fn tick(&self, cancel: &CancellationToken) -> CycleOutcome {
        let cycle = self.cycles_run.fetch_add(1, Ordering::SeqCst) + 1;
        let result = {
            let mut state = self.state.lock().await;
            self.pipeline.run_cycle(&mut state, cancel).await
        };

        let (signals, report, error) = match result {
            Ok(report) => (report.signals(), Some(report), None),
            Err(e) => {
                tracing::error!("Cycle {} failed: {}", cycle, e);
                let signals = CycleSignals {
                    rate_limited: e.is_rate_limited(),
                    failed: true,
                    ..Default::default()
                };
                (signals, None, Some(e.to_string()))
            }
        };

        let (decision, next_interval) = {
            let mut schedule = self.schedule.lock().await;
            let decision = schedule.advance(&signals, &self.config);
            (decision, schedule.current_interval())
        };

        if let Some(report) = &report {
            log_summary(cycle, report, decision, next_interval);
            if !report.cancelled {
                self.persist().await;
            }
        }

        CycleOutcome {
            cycle,
            report,
            error,
            decision,
            next_interval_secs: next_interval.as_secs_f64(),
        }
    }

    /// Loop until `cancel` fires. The sleep between cycles is interruptible.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "Starting scheduler - interval {:.0}s (min {:.0}s, max {:.0}s)",
            self.schedule.lock().await.current_interval().as_secs_f64(),
            self.config.min_interval_secs,
            self.config.max_interval_secs
        );

        while !cancel.is_cancelled() {
            let outcome = self.tick(&cancel).await;
            let sleep = Duration::from_secs_f64(outcome.next_interval_secs);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        self.persist().await;
        tracing::info!("Scheduler stopped after {} cycles", self.cycles_run.load(Ordering::SeqCst));
    }

    pub async fn status(&self) -> SchedulerStatus {
        let schedule = self.schedule.lock().await.clone();
        let state = self.state.lock().await;
        SchedulerStatus {
            cycles_run: self.cycles_run.load(Ordering::SeqCst),
            current_interval_secs: schedule.current_interval().as_secs_f64(),
            consecutive_quiet_cycles: schedule.consecutive_quiet_cycles,
            consecutive_error_cycles: schedule.consecutive_error_cycles,
            in_fail_safe: schedule.in_fail_safe(),
            tracked_tokens: state.active_len(),
            retired_tokens: state.retired_len(),
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        {
            let state = self.state.lock().await;
            if let Err(e) = store.save_state(&state) {
                tracing::warn!("Failed to persist state: {}", e);
            }
        }
        match self.pipeline.orchestrator().cache().save(&store.cache_path()) {
            Ok(entries) => tracing::debug!("Persisted {} cache entries", entries),
            Err(e) => tracing::warn!("Failed to persist cache: {}", e),
        }
    }
}

fn log_summary(cycle: u64, report: &CycleReport, decision: IntervalDecision, next: Duration) {
    let cache = report.cache_totals();
    tracing::info!(
        cycle,
        discovered = report.discovered,
        changed = report.changed,
        quick = report.quick_passed,
        medium = report.medium_passed,
        full = report.fully_scored,
        promoted = report.promoted.len(),
        calls = report.fetch.calls,
        cost = format!("{:.1}", report.fetch.cost_spent),
        saved_pct = format!("{:.1}", report.fetch.savings.saved_pct()),
        cache_hit_ratio = format!("{:.2}", cache.hit_ratio()),
        ?decision,
        next_interval_secs = format!("{:.0}", next.as_secs_f64()),
        elapsed_ms = report.elapsed_ms,
        "Cycle complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cache_store::{CacheStore, TtlTable};
    use crate::adapters::rate_limiter::{RateLimitConfig, RateLimiter};
    use crate::application::batch_orchestrator::BatchRequestOrchestrator;
    use crate::application::pipeline::PipelineConfig;
    use crate::domain::{
        CandidateSeed, ChangeDetector, KnownEntityRegistry, QuickFields, ScoringConfig,
        ScoringEngine,
    };
    use crate::ports::mocks::{RecordingAlertSink, StaticDiscovery};
    use crate::ports::{DiscoveryError, DiscoveryFilter};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seeds(n: usize, liquidity: f64) -> Vec<CandidateSeed> {
        (0..n)
            .map(|i| {
                CandidateSeed::new(
                    format!("token{}", i),
                    "static",
                    QuickFields {
                        liquidity_usd: Some(liquidity),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn scheduler(discovery: Arc<StaticDiscovery>) -> AdaptiveScheduler {
        let limiter = Arc::new(RateLimiter::new([("p", RateLimitConfig::new(10.0, 10.0))]));
        let cache = Arc::new(CacheStore::new(TtlTable::default(), 100));
        let orchestrator = Arc::new(BatchRequestOrchestrator::new(limiter, cache, 2));
        let pipeline = ProgressiveFilterPipeline::new(
            discovery,
            orchestrator,
            Arc::new(ScoringEngine::from_config(&ScoringConfig::default()).unwrap()),
            Arc::new(KnownEntityRegistry::default()),
            Arc::new(RecordingAlertSink::new()),
            ChangeDetector::new(BTreeMap::from([("liquidity_usd".to_string(), 0.1)])),
            PipelineConfig {
                min_yield: 0,
                relaxation: Vec::new(),
                ..Default::default()
            },
            DiscoveryFilter {
                min_liquidity_usd: 0.0,
                min_volume_24h: 0.0,
                min_market_cap: 0.0,
                min_holders: 0,
                max_age_hours: None,
                limit: 100,
            },
            3,
        );
        let config = SchedulerConfig {
            min_interval_secs: 10.0,
            max_interval_secs: 100.0,
            initial_interval_secs: Some(50.0),
            quiet_cycles: 1,
            hot_fraction: 0.5,
            ease_factor: 0.5,
            fail_safe_cycles: 2,
            max_failed_cycles: 3,
        };
        AdaptiveScheduler::new(pipeline, config)
    }

    #[tokio::test]
    async fn test_new_tokens_speed_up_then_quiet_slows_down() {
        let scheduler = scheduler(Arc::new(StaticDiscovery::new(seeds(4, 1e6))));
        let cancel = CancellationToken::new();

        let first = scheduler.tick(&cancel).await;
        assert_eq!(first.decision, IntervalDecision::Hot);
        assert!(first.next_interval_secs < 50.0);

        let second = scheduler.tick(&cancel).await;
        assert_eq!(second.report.as_ref().unwrap().changed, 0);
        assert_eq!(second.decision, IntervalDecision::Quiet);
        assert!(second.next_interval_secs > first.next_interval_secs);
    }

    #[tokio::test]
    async fn test_rate_limited_discovery_enters_fail_safe() {
        let discovery = Arc::new(StaticDiscovery::new(seeds(2, 1e6)));
        discovery.fail_next(DiscoveryError::RateLimited { retry_after: None });
        let scheduler = scheduler(discovery);

        let outcome = scheduler.tick(&CancellationToken::new()).await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.decision, IntervalDecision::FailSafe);
        assert_eq!(outcome.next_interval_secs, 100.0);

        let status = scheduler.status().await;
        assert!(status.in_fail_safe);
        assert_eq!(status.consecutive_error_cycles, 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let discovery = Arc::new(StaticDiscovery::new(seeds(3, 1e6)));

        let first = scheduler(Arc::clone(&discovery)).with_store(SnapshotStore::new(dir.path()));
        first.tick(&CancellationToken::new()).await;
        assert_eq!(first.status().await.tracked_tokens, 3);

        let restarted = scheduler(discovery).with_store(SnapshotStore::new(dir.path()));
        assert_eq!(restarted.status().await.tracked_tokens, 3);
        let outcome = restarted.tick(&CancellationToken::new()).await;
        assert_eq!(outcome.report.unwrap().changed, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let scheduler = Arc::new(scheduler(Arc::new(StaticDiscovery::new(seeds(1, 1e6)))));
        let cancel = CancellationToken::new();
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(scheduler.status().await.cycles_run >= 1);
    }
}
