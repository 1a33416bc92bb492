//! Pipeline Integration Tests
//!
//! Drive full discovery cycles through the public API:
//! 1. Batching and cost accounting through the orchestrator
//! 2. Quick gate pruning what the medium gate fetches
//! 3. Per-key NotFound isolation inside a batch
//! 4. Rate limiter throughput under concurrent callers
//! 5. Change detection, eviction and relaxation across cycles
//!
//! All tests are deterministic (no real network calls) and use scripted providers.

use approx::assert_relative_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use butters_scout::adapters::cache_store::{CacheStore, TtlTable};
use butters_scout::adapters::rate_limiter::{RateLimitConfig, RateLimiter};
use butters_scout::application::{
    BatchRequestOrchestrator, FetchRequest, FetchSpec, PipelineConfig, ProgressiveFilterPipeline,
    RetryPolicy,
};
use butters_scout::domain::{
    CandidateSeed, ChangeDetector, EliminationReason, EndpointCost, FactorWeight, FieldCategory,
    Gate, KnownEntityRegistry, QuickFields, ScoringConfig, ScoringEngine, Stage, StateCache,
};
use butters_scout::ports::mocks::{RecordingAlertSink, ScriptedProvider, StaticDiscovery};
use butters_scout::ports::{DiscoveryFilter, KeyError};

// ============================================================================
// Test Fixtures
// ============================================================================

const PROVIDER: &str = "birdeye";

/// Liquidity-only scoring: 10^4 USD scores 0, 10^6 scores ~66.7, 10^7 scores 100.
fn liquidity_scoring() -> Arc<ScoringEngine> {
    let config = ScoringConfig {
        factors: vec![FactorWeight::new("liquidity", 1.0)],
        adjustments: Vec::new(),
        ..Default::default()
    };
    Arc::new(ScoringEngine::from_config(&config).unwrap())
}

fn seed(key: &str, liquidity: f64) -> CandidateSeed {
    CandidateSeed::new(
        key,
        "static",
        QuickFields {
            liquidity_usd: Some(liquidity),
            volume_24h: Some(1e6),
            market_cap: Some(1e6),
            holder_count: Some(500),
            ..Default::default()
        },
    )
}

fn open_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        min_liquidity_usd: 0.0,
        min_volume_24h: 0.0,
        min_market_cap: 0.0,
        min_holders: 0,
        max_age_hours: None,
        limit: 1_000,
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    }
}

fn orchestrator(provider: Arc<ScriptedProvider>) -> Arc<BatchRequestOrchestrator> {
    let limiter = Arc::new(RateLimiter::new([(PROVIDER, RateLimitConfig::new(1_000.0, 1_000.0))]));
    let cache = Arc::new(CacheStore::new(TtlTable::default(), 10_000));
    Arc::new(BatchRequestOrchestrator::new(limiter, cache, 8).with_provider(provider, no_retry(), 4))
}

fn pipeline_config(quick: f64) -> PipelineConfig {
    PipelineConfig {
        quick_threshold: quick,
        medium_threshold: 0.0,
        full_threshold: 0.0,
        min_yield: 0,
        relaxation: Vec::new(),
        medium_fetches: vec![FetchSpec {
            provider: PROVIDER.to_string(),
            endpoint: "trade_data".to_string(),
            category: FieldCategory::Volume,
            optional: false,
        }],
        full_fetches: Vec::new(),
    }
}

fn pipeline(
    discovery: Arc<StaticDiscovery>,
    provider: Arc<ScriptedProvider>,
    config: PipelineConfig,
    filter: DiscoveryFilter,
    eviction_cycles: u32,
) -> ProgressiveFilterPipeline {
    ProgressiveFilterPipeline::new(
        discovery,
        orchestrator(provider),
        liquidity_scoring(),
        Arc::new(KnownEntityRegistry::default()),
        Arc::new(RecordingAlertSink::new()),
        ChangeDetector::new(BTreeMap::from([("liquidity_usd".to_string(), 0.1)])),
        config,
        filter,
        eviction_cycles,
    )
}

fn trade_data_provider() -> ScriptedProvider {
    ScriptedProvider::new(PROVIDER)
        .with_default_batch_size(50)
        .with_default_record("trade_data", json!({"volume_24h": 2.5e6, "buys_1h": 60, "sells_1h": 40}))
}

// ============================================================================
// Orchestrator batching
// ============================================================================

mod batching {
    use super::*;

    #[tokio::test]
    async fn test_120_keys_pack_into_three_batches() {
        let provider = Arc::new(trade_data_provider().with_base_cost(5.0));
        let orchestrator = orchestrator(Arc::clone(&provider));
        let keys: Vec<String> = (0..120).map(|i| format!("k{}", i)).collect();

        let output = orchestrator
            .fetch(
                &[FetchRequest {
                    provider: PROVIDER.to_string(),
                    endpoint: "trade_data".to_string(),
                    category: FieldCategory::Volume,
                    keys: keys.clone(),
                }],
                &CancellationToken::new(),
            )
            .await;

        let mut sizes: Vec<usize> = provider.calls().iter().map(|(_, k)| k.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![20, 50, 50]);

        let pricing = EndpointCost::new(5.0, 50);
        let expected = pricing.cost(50) * 2.0 + pricing.cost(20);
        assert_relative_eq!(output.report.cost_spent, expected, epsilon = 1e-9);
        assert!(output.report.cost_spent < pricing.individual_cost(120));
        assert_eq!(output.report.found, 120);
    }

    #[tokio::test]
    async fn test_second_fetch_is_served_from_cache() {
        let provider = Arc::new(trade_data_provider());
        let orchestrator = orchestrator(Arc::clone(&provider));
        let request = FetchRequest {
            provider: PROVIDER.to_string(),
            endpoint: "trade_data".to_string(),
            category: FieldCategory::Volume,
            keys: vec!["a".to_string(), "b".to_string()],
        };
        let cancel = CancellationToken::new();

        orchestrator.fetch(std::slice::from_ref(&request), &cancel).await;
        let second = orchestrator.fetch(&[request], &cancel).await;

        assert_eq!(provider.call_count(), 1);
        assert_eq!(second.report.cache_hits, 2);
        assert_eq!(second.report.cost_spent, 0.0);
    }
}

// ============================================================================
// Progressive gates
// ============================================================================

mod gates {
    use super::*;

    #[tokio::test]
    async fn test_quick_gate_prunes_medium_fetch() {
        // 25 seeds score ~66.7, 75 score 0 against a quick threshold of 60
        let seeds: Vec<CandidateSeed> = (0..100)
            .map(|i| {
                let liquidity = if i % 4 == 0 { 1e6 } else { 1e4 };
                seed(&format!("token{}", i), liquidity)
            })
            .collect();
        let provider = Arc::new(trade_data_provider());
        let pipeline = pipeline(
            Arc::new(StaticDiscovery::new(seeds)),
            Arc::clone(&provider),
            pipeline_config(60.0),
            open_filter(),
            10,
        );

        let report = pipeline
            .run_cycle(&mut StateCache::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.discovered, 100);
        assert_eq!(report.quick_passed, 25);
        assert_eq!(report.eliminated[&Gate::Quick], 75);
        assert_eq!(provider.keys_requested("trade_data").len(), 25);
        assert_eq!(report.promoted.len(), 25);
    }

    #[tokio::test]
    async fn test_not_found_keys_are_isolated() {
        let seeds: Vec<CandidateSeed> = (0..20).map(|i| seed(&format!("token{}", i), 1e6)).collect();
        let provider = Arc::new(
            trade_data_provider()
                .with_key_error("trade_data", "token3", KeyError::NotFound)
                .with_key_error("trade_data", "token7", KeyError::NotFound)
                .with_key_error("trade_data", "token11", KeyError::NotFound),
        );
        let pipeline = pipeline(
            Arc::new(StaticDiscovery::new(seeds)),
            Arc::clone(&provider),
            pipeline_config(0.0),
            open_filter(),
            10,
        );

        let report = pipeline
            .run_cycle(&mut StateCache::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(report.fetch.found, 17);
        assert_eq!(report.fetch.not_found, 3);
        assert_eq!(report.eliminated[&Gate::Medium], 3);
        assert_eq!(report.promoted.len(), 17);

        for key in ["token3", "token7", "token11"] {
            let trace = report.traces.iter().find(|t| t.key == key).unwrap();
            let elimination = trace.elimination.as_ref().unwrap();
            assert_eq!(elimination.gate, Gate::Medium);
            assert_eq!(
                elimination.reason,
                EliminationReason::NotFound {
                    category: FieldCategory::Volume
                }
            );
        }
    }

    #[tokio::test]
    async fn test_stage_histories_only_move_forward() {
        let seeds: Vec<CandidateSeed> = (0..30)
            .map(|i| seed(&format!("token{}", i), 10f64.powf(4.0 + (i % 4) as f64)))
            .collect();
        let mut config = pipeline_config(30.0);
        config.medium_threshold = 50.0;
        config.full_threshold = 80.0;
        let pipeline = pipeline(
            Arc::new(StaticDiscovery::new(seeds)),
            Arc::new(trade_data_provider()),
            config,
            open_filter(),
            10,
        );

        let report = pipeline
            .run_cycle(&mut StateCache::new(), &CancellationToken::new())
            .await
            .unwrap();

        let order = |stage: &Stage| match stage {
            Stage::Discovered => 0,
            Stage::QuickPassed => 1,
            Stage::MediumPassed => 2,
            Stage::FullyScored => 3,
            Stage::Promoted => 4,
            Stage::Eliminated => 5,
        };
        for trace in &report.traces {
            assert_eq!(trace.history.first(), Some(&Stage::Discovered));
            for pair in trace.history.windows(2) {
                assert!(order(&pair[0]) < order(&pair[1]), "{:?}", trace.history);
            }
            let last = trace.history.last().unwrap();
            assert!(matches!(last, Stage::Promoted | Stage::Eliminated));
            assert_eq!(*last == Stage::Eliminated, trace.elimination.is_some());
        }
        assert!(!report.promoted.is_empty());
        assert!(report.eliminated.values().sum::<usize>() > 0);
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

mod rate_limiting {
    use super::*;

    #[tokio::test]
    async fn test_30_concurrent_acquires_at_15_per_second() {
        let limiter = Arc::new(RateLimiter::new([("p", RateLimitConfig::new(15.0, 15.0))]));
        let start = Instant::now();

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire("p").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let elapsed = start.elapsed();
        // 15 from the initial burst, 15 more at 15/s
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }
}

// ============================================================================
// Multi-cycle behaviour
// ============================================================================

mod cycles {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_tokens_cost_nothing_next_cycle() {
        let seeds: Vec<CandidateSeed> = (0..10).map(|i| seed(&format!("token{}", i), 1e6)).collect();
        let discovery = Arc::new(StaticDiscovery::new(seeds));
        let provider = Arc::new(trade_data_provider());
        let pipeline = pipeline(
            Arc::clone(&discovery),
            Arc::clone(&provider),
            pipeline_config(0.0),
            open_filter(),
            10,
        );
        let mut state = StateCache::new();
        let cancel = CancellationToken::new();

        let first = pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert_eq!(first.changed, 10);
        let calls_after_first = provider.call_count();

        let second = pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert_eq!(second.discovered, 10);
        assert_eq!(second.changed, 0);
        assert_eq!(provider.call_count(), calls_after_first);

        // One token moves past its threshold
        let mut moved: Vec<CandidateSeed> = (0..10).map(|i| seed(&format!("token{}", i), 1e6)).collect();
        moved[4].quick.liquidity_usd = Some(2e6);
        discovery.set_seeds(moved);
        let third = pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert_eq!(third.changed, 1);
        assert_eq!(third.traces[0].key, "token4");
    }

    #[tokio::test]
    async fn test_idle_tokens_retire_and_keep_their_baseline() {
        let seeds: Vec<CandidateSeed> = (0..3).map(|i| seed(&format!("token{}", i), 1e6)).collect();
        let discovery = Arc::new(StaticDiscovery::new(seeds.clone()));
        let pipeline = pipeline(
            Arc::clone(&discovery),
            Arc::new(trade_data_provider()),
            pipeline_config(0.0),
            open_filter(),
            2,
        );
        let mut state = StateCache::new();
        let cancel = CancellationToken::new();

        pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert_eq!(state.active_len(), 3);

        discovery.set_seeds(Vec::new());
        pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert_eq!(state.active_len(), 0);
        assert_eq!(state.retired_len(), 3);

        // Rediscovered unchanged: compared against the retired snapshot
        discovery.set_seeds(seeds);
        let report = pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert_eq!(report.changed, 0);
    }

    #[tokio::test]
    async fn test_thin_discovery_relaxes_filter() {
        let mut seeds: Vec<CandidateSeed> = (0..5).map(|i| seed(&format!("deep{}", i), 200_000.0)).collect();
        seeds.extend((0..10).map(|i| seed(&format!("thin{}", i), 70_000.0)));
        let discovery = Arc::new(StaticDiscovery::new(seeds));

        let mut config = pipeline_config(0.0);
        config.min_yield = 10;
        config.relaxation = vec![0.8, 0.65];
        let mut filter = open_filter();
        filter.min_liquidity_usd = 100_000.0;

        let pipeline = pipeline(
            Arc::clone(&discovery),
            Arc::new(trade_data_provider()),
            config,
            filter,
            10,
        );
        let report = pipeline
            .run_cycle(&mut StateCache::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.relaxation_steps, 2);
        assert_eq!(report.discovered, 15);
        let filters = discovery.filters_seen();
        assert_eq!(filters.len(), 3);
        assert!((filters[2].min_liquidity_usd - 65_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cancel_mid_fetch_commits_nothing() {
        let seeds: Vec<CandidateSeed> = (0..5).map(|i| seed(&format!("token{}", i), 1e6)).collect();
        let provider = Arc::new(trade_data_provider().with_latency(Duration::from_millis(200)));
        let pipeline = pipeline(
            Arc::new(StaticDiscovery::new(seeds)),
            provider,
            pipeline_config(0.0),
            open_filter(),
            10,
        );
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let mut state = StateCache::new();
        let report = pipeline.run_cycle(&mut state, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.commit.is_none());
        assert!(report.promoted.is_empty());
        assert_eq!(state.active_len(), 0);
        assert_eq!(state.cycles_committed(), 0);
    }
}
