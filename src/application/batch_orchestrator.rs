//! Batch Request Orchestrator
//!
//! Turns per-candidate field lookups into the cheapest set of provider calls:
//!
//! 1. Serve what the cache already has.
//! 2. Coalesce the misses by `(provider, endpoint)` and pack them into full
//!    batches with the cost model.
//! 3. Dispatch batches concurrently, bounded by a global worker pool and a
//!    per-provider concurrency limit, each call gated by the rate limiter.
//! 4. Retry transient failures with backoff; if a batch still fails, split it
//!    in half and try the halves before giving up on its keys.
//!
//! At most one request per `(provider, endpoint, category, key)` is in flight
//! at a time. A concurrent lookup of a key already being fetched waits for that
//! fetch. Requests for different categories on the same endpoint share one
//! call, and its payload is decoded and cached once per category.

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapters::cache_store::{CacheStore, CachedField};
use crate::adapters::rate_limiter::RateLimiter;
use crate::domain::cost_model::{
    estimate_savings, plan_batches, BatchRequest, EndpointCost, PartitionKey, SavingsEstimate,
};
use crate::domain::{FieldCategory, FieldRecord};
use crate::ports::{BatchResponse, KeyError, ProviderClient, ProviderError};

/// Transient-failure retry policy, configured per provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize each delay by ±25%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let ms = if self.jitter && exp > 0 {
            let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
            (exp as f64 * factor) as u64
        } else {
            exp
        };
        Duration::from_millis(ms)
    }
}

/// Lookups for one `(provider, endpoint)` in one field category
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub provider: String,
    pub endpoint: String,
    pub category: FieldCategory,
    pub keys: Vec<String>,
}

/// Final state of one key lookup
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Found(FieldRecord),
    /// Provider confirmed the key does not exist, or rejected it as malformed
    NotFound,
    /// Retries and splitting exhausted, or the cycle was cancelled first
    FetchFailed,
}

impl From<CachedField> for KeyOutcome {
    fn from(cached: CachedField) -> Self {
        match cached {
            CachedField::Found(record) => KeyOutcome::Found(record),
            CachedField::NotFound => KeyOutcome::NotFound,
        }
    }
}

/// Accounting for one `fetch` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchReport {
    pub cache_hits: usize,
    pub coalesced: usize,
    pub keys_dispatched: usize,
    pub batches_planned: usize,
    pub calls: usize,
    pub retries: usize,
    pub splits: usize,
    pub rate_limited: usize,
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Units spent, including retried and split calls
    pub cost_spent: f64,
    /// Planned cost against the single-key equivalent
    pub savings: SavingsEstimate,
}

impl FetchReport {
    pub fn merge(&mut self, other: &FetchReport) {
        self.cache_hits += other.cache_hits;
        self.coalesced += other.coalesced;
        self.keys_dispatched += other.keys_dispatched;
        self.batches_planned += other.batches_planned;
        self.calls += other.calls;
        self.retries += other.retries;
        self.splits += other.splits;
        self.rate_limited += other.rate_limited;
        self.found += other.found;
        self.not_found += other.not_found;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.cost_spent += other.cost_spent;
        self.savings.merge(other.savings);
    }

    fn count(&mut self, outcome: &KeyOutcome) {
        match outcome {
            KeyOutcome::Found(_) => self.found += 1,
            KeyOutcome::NotFound => self.not_found += 1,
            KeyOutcome::FetchFailed => self.failed += 1,
        }
    }
}

/// Results of a `fetch`, aligned with the requests by index
#[derive(Debug, Default)]
pub struct FetchOutput {
    pub results: Vec<HashMap<String, KeyOutcome>>,
    pub report: FetchReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    provider: String,
    endpoint: String,
    category: FieldCategory,
    key: String,
}

type InFlight = HashMap<FlightKey, watch::Receiver<Option<KeyOutcome>>>;

/// Removes this fetch's in-flight entries however the fetch ends. Dropping
/// the senders wakes any waiter with an error, which it reads as a failure.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<InFlight>,
    owned: HashMap<FlightKey, watch::Sender<Option<KeyOutcome>>>,
}

impl FlightGuard<'_> {
    fn publish(&mut self, flight: &FlightKey, outcome: &KeyOutcome) {
        if let Some(tx) = self.owned.get(flight) {
            tx.send_replace(Some(outcome.clone()));
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        for flight in self.owned.keys() {
            map.remove(flight);
        }
    }
}

struct ProviderHandle {
    client: Arc<dyn ProviderClient>,
    retry: RetryPolicy,
    concurrency: Semaphore,
}

pub struct BatchRequestOrchestrator {
    providers: HashMap<String, ProviderHandle>,
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheStore>,
    workers: Semaphore,
    in_flight: Mutex<InFlight>,
}

impl std::fmt::Debug for BatchRequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRequestOrchestrator")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("workers", &self.workers.available_permits())
            .finish()
    }
}

impl BatchRequestOrchestrator {
    pub fn new(limiter: Arc<RateLimiter>, cache: Arc<CacheStore>, worker_pool: usize) -> Self {
        Self {
            providers: HashMap::new(),
            limiter,
            cache,
            workers: Semaphore::new(worker_pool.max(1)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(
        mut self,
        client: Arc<dyn ProviderClient>,
        retry: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        let name = client.name().to_string();
        self.providers.insert(
            name,
            ProviderHandle {
                client,
                retry,
                concurrency: Semaphore::new(max_concurrency.max(1)),
            },
        );
        self
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pricing(&self, partition: &PartitionKey) -> EndpointCost {
        match self.providers.get(&partition.provider) {
            Some(handle) => EndpointCost::new(
                handle.client.base_cost(&partition.endpoint),
                handle.client.max_batch_size(&partition.endpoint),
            ),
            None => EndpointCost::new(1.0, 1),
        }
    }

    /// Resolve every key of every request. Never fails as a whole: keys that
    /// could not be fetched come back as `KeyOutcome::FetchFailed`.
    pub async fn fetch(&self, requests: &[FetchRequest], cancel: &CancellationToken) -> FetchOutput {
        let mut report = FetchReport::default();
        let mut resolved: HashMap<FlightKey, KeyOutcome> = HashMap::new();
        let mut categories: HashMap<PartitionKey, BTreeSet<FieldCategory>> = HashMap::new();
        let mut pending: BTreeMap<PartitionKey, Vec<String>> = BTreeMap::new();
        let mut waiting: Vec<(FlightKey, watch::Receiver<Option<KeyOutcome>>)> = Vec::new();
        let mut guard = FlightGuard {
            in_flight: &self.in_flight,
            owned: HashMap::new(),
        };

        for request in requests {
            let partition = PartitionKey::new(&request.provider, &request.endpoint);
            let category = request.category;
            categories.entry(partition.clone()).or_default().insert(category);

            if !self.providers.contains_key(&request.provider) {
                tracing::warn!(provider = %request.provider, "Fetch for unregistered provider");
                for key in &request.keys {
                    resolved.insert(flight_key(&partition, category, key), KeyOutcome::FetchFailed);
                }
                continue;
            }

            let (hits, misses) = self
                .cache
                .get_many(&request.provider, request.category, &request.keys);
            report.cache_hits += hits.len();
            for (key, cached) in hits {
                resolved.insert(flight_key(&partition, category, &key), cached.into());
            }

            let mut in_flight = self.in_flight();
            for key in misses {
                let flight = flight_key(&partition, category, &key);
                if resolved.contains_key(&flight) || guard.owned.contains_key(&flight) {
                    continue;
                }
                match in_flight.get(&flight) {
                    // A live fetch elsewhere owns this key
                    Some(rx) if rx.has_changed().is_ok() => {
                        report.coalesced += 1;
                        waiting.push((flight, rx.clone()));
                    }
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(flight.clone(), rx);
                        guard.owned.insert(flight, tx);
                        let keys = pending.entry(partition.clone()).or_default();
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
            }
        }

        let batches = plan_batches(&pending, |partition| self.pricing(partition));
        report.batches_planned = batches.len();
        report.keys_dispatched = batches.iter().map(|b| b.keys.len()).sum();
        report.savings = estimate_savings(&batches);

        let dispatches = batches.into_iter().map(|batch| {
            let partition = PartitionKey::new(&batch.provider, &batch.endpoint);
            let wanted: Vec<FieldCategory> = categories
                .get(&partition)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            self.dispatch(batch, wanted, cancel)
        });

        for (partition, outcomes, batch_report) in join_all(dispatches).await {
            report.merge(&batch_report);
            let mut to_cache: BTreeMap<FieldCategory, Vec<(String, CachedField)>> = BTreeMap::new();
            for (key, category, outcome) in outcomes {
                let flight = flight_key(&partition, category, &key);
                // Categories served from cache or by another fetch are not ours to settle
                if !guard.owned.contains_key(&flight) {
                    continue;
                }
                report.count(&outcome);
                let cached = match &outcome {
                    KeyOutcome::Found(record) => Some(CachedField::Found(record.clone())),
                    KeyOutcome::NotFound => Some(CachedField::NotFound),
                    KeyOutcome::FetchFailed => None,
                };
                if let Some(cached) = cached {
                    to_cache.entry(category).or_default().push((key, cached));
                }
                guard.publish(&flight, &outcome);
                resolved.insert(flight, outcome);
            }
            for (category, items) in to_cache {
                self.cache.set_many(&partition.provider, category, items);
            }
        }

        // Owned keys left unresolved cannot happen unless a batch was lost; fail them
        let unresolved: Vec<FlightKey> = guard
            .owned
            .keys()
            .filter(|flight| !resolved.contains_key(*flight))
            .cloned()
            .collect();
        for flight in unresolved {
            guard.publish(&flight, &KeyOutcome::FetchFailed);
            resolved.insert(flight, KeyOutcome::FetchFailed);
        }
        drop(guard);

        for (flight, mut rx) in waiting {
            let outcome = match rx.wait_for(|v| v.is_some()).await {
                Ok(value) => value.clone().unwrap_or(KeyOutcome::FetchFailed),
                Err(_) => KeyOutcome::FetchFailed,
            };
            resolved.insert(flight, outcome);
        }

        let results = requests
            .iter()
            .map(|request| {
                let partition = PartitionKey::new(&request.provider, &request.endpoint);
                request
                    .keys
                    .iter()
                    .map(|key| {
                        let outcome = resolved
                            .get(&flight_key(&partition, request.category, key))
                            .cloned()
                            .unwrap_or(KeyOutcome::FetchFailed);
                        (key.clone(), outcome)
                    })
                    .collect()
            })
            .collect();

        tracing::debug!(
            requests = requests.len(),
            cache_hits = report.cache_hits,
            coalesced = report.coalesced,
            batches = report.batches_planned,
            calls = report.calls,
            cost = report.cost_spent,
            "Fetch complete"
        );

        FetchOutput { results, report }
    }

    /// Run one planned batch to completion, splitting on persistent failure.
    ///
    /// Every key resolves once per requested category.
    async fn dispatch(
        &self,
        batch: BatchRequest,
        categories: Vec<FieldCategory>,
        cancel: &CancellationToken,
    ) -> (PartitionKey, Vec<(String, FieldCategory, KeyOutcome)>, FetchReport) {
        let partition = PartitionKey::new(&batch.provider, &batch.endpoint);
        let mut report = FetchReport::default();
        let mut outcomes = Vec::with_capacity(batch.keys.len() * categories.len());

        let Some(handle) = self.providers.get(&batch.provider) else {
            settle(&mut outcomes, batch.keys, &categories, KeyOutcome::FetchFailed);
            return (partition, outcomes, report);
        };

        if cancel.is_cancelled() {
            report.cancelled = batch.keys.len();
            settle(&mut outcomes, batch.keys, &categories, KeyOutcome::FetchFailed);
            return (partition, outcomes, report);
        }

        let permits = tokio::try_join!(self.workers.acquire(), handle.concurrency.acquire());
        let Ok(_permits) = permits else {
            settle(&mut outcomes, batch.keys, &categories, KeyOutcome::FetchFailed);
            return (partition, outcomes, report);
        };

        // Cancellation may have landed while this batch waited for a permit
        if cancel.is_cancelled() {
            report.cancelled = batch.keys.len();
            settle(&mut outcomes, batch.keys, &categories, KeyOutcome::FetchFailed);
            return (partition, outcomes, report);
        }

        let pricing = self.pricing(&partition);
        let mut queue: VecDeque<Vec<String>> = VecDeque::from([batch.keys]);
        while let Some(keys) = queue.pop_front() {
            let result = self
                .call_with_retry(handle, &batch.endpoint, &keys, pricing, &mut report)
                .await;
            match result {
                Ok(response) => {
                    for key in keys {
                        for category in &categories {
                            let outcome = resolve_key(&response, &key, *category);
                            outcomes.push((key.clone(), *category, outcome));
                        }
                    }
                }
                Err(ProviderError::NotFound) if keys.len() == 1 => {
                    settle(&mut outcomes, keys, &categories, KeyOutcome::NotFound);
                }
                Err(e) if keys.len() > 1 && (e.is_retryable() || e == ProviderError::NotFound) => {
                    report.splits += 1;
                    let mut left = keys;
                    let right = left.split_off(left.len() / 2);
                    tracing::debug!(
                        provider = %batch.provider,
                        endpoint = %batch.endpoint,
                        left = left.len(),
                        right = right.len(),
                        error = %e,
                        "Splitting failed batch"
                    );
                    queue.push_back(left);
                    queue.push_back(right);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %batch.provider,
                        endpoint = %batch.endpoint,
                        keys = keys.len(),
                        error = %e,
                        "Batch failed, keys marked FetchFailed"
                    );
                    settle(&mut outcomes, keys, &categories, KeyOutcome::FetchFailed);
                }
            }
        }

        (partition, outcomes, report)
    }

    /// One provider call with rate limiting and transient retries.
    async fn call_with_retry(
        &self,
        handle: &ProviderHandle,
        endpoint: &str,
        keys: &[String],
        pricing: EndpointCost,
        report: &mut FetchReport,
    ) -> Result<BatchResponse, ProviderError> {
        let provider = handle.client.name();
        let mut attempt = 0u32;
        loop {
            self.limiter
                .acquire(provider)
                .await
                .map_err(|e| ProviderError::Fatal(e.to_string()))?;

            report.calls += 1;
            report.cost_spent += pricing.cost(keys.len());

            let error = match handle.client.fetch_batch(endpoint, keys).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            let mut delay = handle.retry.delay_for(attempt);
            if let ProviderError::RateLimited { retry_after } = &error {
                report.rate_limited += 1;
                if let Err(e) = self.limiter.throttle(provider, *retry_after) {
                    tracing::warn!(error = %e, "Failed to apply throttle");
                }
                if let Some(after) = retry_after {
                    delay = delay.max(*after);
                }
            }

            if !error.is_retryable() || attempt >= handle.retry.max_retries {
                return Err(error);
            }

            tracing::debug!(
                provider,
                endpoint,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying provider call"
            );
            report.retries += 1;
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

fn flight_key(partition: &PartitionKey, category: FieldCategory, key: &str) -> FlightKey {
    FlightKey {
        provider: partition.provider.clone(),
        endpoint: partition.endpoint.clone(),
        category,
        key: key.to_string(),
    }
}

/// Resolve every key to the same outcome in every category.
fn settle(
    outcomes: &mut Vec<(String, FieldCategory, KeyOutcome)>,
    keys: Vec<String>,
    categories: &[FieldCategory],
    outcome: KeyOutcome,
) {
    for key in keys {
        for category in categories {
            outcomes.push((key.clone(), *category, outcome.clone()));
        }
    }
}

/// A key missing from the response is a confirmed miss; a payload that is not
/// an object cannot be decoded at all.
fn resolve_key(response: &BatchResponse, key: &str, category: FieldCategory) -> KeyOutcome {
    match response.get(key) {
        Some(Ok(raw)) => match FieldRecord::decode(category, raw) {
            Some(record) => KeyOutcome::Found(record),
            None => {
                tracing::debug!(key, %category, "Undecodable payload");
                KeyOutcome::FetchFailed
            }
        },
        Some(Err(KeyError::NotFound)) | Some(Err(KeyError::Malformed(_))) | None => {
            KeyOutcome::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::rate_limiter::RateLimitConfig;
    use crate::adapters::cache_store::TtlTable;
    use crate::ports::mocks::ScriptedProvider;
    use serde_json::json;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Mint{i}")).collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        }
    }

    fn orchestrator(provider: Arc<ScriptedProvider>) -> BatchRequestOrchestrator {
        let limiter = Arc::new(RateLimiter::new([(
            provider.name().to_string(),
            RateLimitConfig::new(1_000.0, 1_000.0),
        )]));
        let cache = Arc::new(CacheStore::new(TtlTable::default(), 10_000));
        BatchRequestOrchestrator::new(limiter, cache, 8).with_provider(provider, fast_retry(), 4)
    }

    fn request(keys: Vec<String>) -> FetchRequest {
        FetchRequest {
            provider: "birdeye".to_string(),
            endpoint: "trade_data".to_string(),
            category: FieldCategory::Volume,
            keys,
        }
    }

    fn volume_provider() -> ScriptedProvider {
        ScriptedProvider::new("birdeye")
            .with_batch_size("trade_data", 50)
            .with_default_record("trade_data", json!({"volume_24h": 1000.0}))
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_batches_misses_and_caches_results() {
        let provider = Arc::new(volume_provider());
        let orch = orchestrator(Arc::clone(&provider));
        let cancel = CancellationToken::new();

        let out = orch.fetch(&[request(keys(120))], &cancel).await;
        let sizes: Vec<usize> = provider.calls().iter().map(|(_, k)| k.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(out.results[0].len(), 120);
        assert!(out.results[0]
            .values()
            .all(|o| matches!(o, KeyOutcome::Found(_))));
        assert!(out.report.savings.actual_cost < out.report.savings.individual_cost);

        // Second fetch is served entirely from cache
        let again = orch.fetch(&[request(keys(120))], &cancel).await;
        assert_eq!(provider.call_count(), 3);
        assert_eq!(again.report.cache_hits, 120);
    }

    #[tokio::test]
    async fn test_not_found_keys_do_not_fail_batch() {
        let provider = Arc::new(
            volume_provider()
                .with_key_error("trade_data", "Mint1", KeyError::NotFound)
                .with_key_error("trade_data", "Mint2", KeyError::Malformed("bad".into())),
        );
        let orch = orchestrator(Arc::clone(&provider));

        let out = orch
            .fetch(&[request(keys(5))], &CancellationToken::new())
            .await;
        let results = &out.results[0];
        assert_eq!(results["Mint1"], KeyOutcome::NotFound);
        assert_eq!(results["Mint2"], KeyOutcome::NotFound);
        assert!(matches!(results["Mint0"], KeyOutcome::Found(_)));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_in_response_is_not_found() {
        let provider = Arc::new(
            ScriptedProvider::new("birdeye")
                .with_record("trade_data", "Mint0", json!({"volume_24h": 1.0})),
        );
        let orch = orchestrator(provider);
        let out = orch
            .fetch(&[request(keys(2))], &CancellationToken::new())
            .await;
        assert_eq!(out.results[0]["Mint1"], KeyOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let provider = Arc::new(volume_provider());
        provider.fail_next(ProviderError::Transient("503".into()));
        let orch = orchestrator(Arc::clone(&provider));

        let out = orch
            .fetch(&[request(keys(3))], &CancellationToken::new())
            .await;
        assert_eq!(out.report.retries, 1);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(out.report.found, 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_splits_and_isolates_bad_key() {
        let provider = Arc::new(volume_provider().with_poisoned_key("Mint3"));
        let orch = orchestrator(Arc::clone(&provider));

        let out = orch
            .fetch(&[request(keys(8))], &CancellationToken::new())
            .await;
        let results = &out.results[0];
        assert_eq!(results["Mint3"], KeyOutcome::FetchFailed);
        let found = results
            .values()
            .filter(|o| matches!(o, KeyOutcome::Found(_)))
            .count();
        assert_eq!(found, 7);
        assert!(out.report.splits >= 3);
    }

    #[tokio::test]
    async fn test_rate_limited_throttles_limiter() {
        let provider = Arc::new(volume_provider());
        provider.fail_next(ProviderError::RateLimited { retry_after: None });
        let orch = orchestrator(Arc::clone(&provider));

        let out = orch
            .fetch(&[request(keys(2))], &CancellationToken::new())
            .await;
        assert_eq!(out.report.rate_limited, 1);
        assert_eq!(out.report.found, 2);
        assert!(orch.limiter().status("birdeye").unwrap().throttled);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_dispatches_nothing() {
        let provider = Arc::new(volume_provider());
        let orch = orchestrator(Arc::clone(&provider));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = orch.fetch(&[request(keys(10))], &cancel).await;
        assert_eq!(provider.call_count(), 0);
        assert_eq!(out.report.cancelled, 10);
        assert!(out.results[0]
            .values()
            .all(|o| *o == KeyOutcome::FetchFailed));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_worker_skips_batch() {
        let provider = Arc::new(volume_provider().with_latency(Duration::from_millis(100)));
        let limiter = Arc::new(RateLimiter::new([(
            "birdeye".to_string(),
            RateLimitConfig::new(1_000.0, 1_000.0),
        )]));
        let cache = Arc::new(CacheStore::new(TtlTable::default(), 10_000));
        let orch = BatchRequestOrchestrator::new(limiter, cache, 1)
            .with_provider(Arc::clone(&provider) as Arc<dyn ProviderClient>, fast_retry(), 4);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let out = orch.fetch(&[request(keys(100))], &cancel).await;
        assert_eq!(provider.call_count(), 1);
        assert_eq!(out.report.cancelled, 50);
        let failed = out.results[0]
            .values()
            .filter(|o| **o == KeyOutcome::FetchFailed)
            .count();
        assert_eq!(failed, 50);
    }

    #[tokio::test]
    async fn test_categories_sharing_endpoint_each_resolve() {
        let provider = Arc::new(
            ScriptedProvider::new("birdeye")
                .with_batch_size("token_overview", 50)
                .with_default_record(
                    "token_overview",
                    json!({"volume_24h": 1000.0, "name": "Butter", "symbol": "BTR"}),
                ),
        );
        let orch = orchestrator(Arc::clone(&provider));
        let overview = |category| FetchRequest {
            provider: "birdeye".to_string(),
            endpoint: "token_overview".to_string(),
            category,
            keys: keys(3),
        };

        let out = orch
            .fetch(
                &[overview(FieldCategory::Volume), overview(FieldCategory::Metadata)],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(provider.call_count(), 1);
        assert!(matches!(
            out.results[0]["Mint0"],
            KeyOutcome::Found(FieldRecord::Volume(_))
        ));
        assert!(matches!(
            out.results[1]["Mint0"],
            KeyOutcome::Found(FieldRecord::Metadata(_))
        ));
        assert_eq!(out.report.found, 6);

        let cache = orch.cache();
        assert!(cache.get("birdeye", FieldCategory::Volume, "Mint2").is_some());
        assert!(cache.get("birdeye", FieldCategory::Metadata, "Mint2").is_some());

        // Both categories now come from cache
        let again = orch
            .fetch(
                &[overview(FieldCategory::Volume), overview(FieldCategory::Metadata)],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(provider.call_count(), 1);
        assert_eq!(again.report.cache_hits, 6);
    }

    #[tokio::test]
    async fn test_cached_category_not_recounted_when_sibling_misses() {
        let provider = Arc::new(
            ScriptedProvider::new("birdeye")
                .with_batch_size("token_overview", 50)
                .with_default_record("token_overview", json!({"volume_24h": 5.0, "name": "Butter"})),
        );
        let orch = orchestrator(Arc::clone(&provider));
        let overview = |category| FetchRequest {
            provider: "birdeye".to_string(),
            endpoint: "token_overview".to_string(),
            category,
            keys: keys(3),
        };
        let cancel = CancellationToken::new();

        orch.fetch(&[overview(FieldCategory::Volume)], &cancel).await;
        let out = orch
            .fetch(
                &[overview(FieldCategory::Volume), overview(FieldCategory::Metadata)],
                &cancel,
            )
            .await;
        assert_eq!(provider.call_count(), 2);
        assert_eq!(out.report.cache_hits, 3);
        assert_eq!(out.report.found, 3);
        assert!(matches!(
            out.results[1]["Mint1"],
            KeyOutcome::Found(FieldRecord::Metadata(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce_same_key() {
        let provider = Arc::new(volume_provider().with_latency(Duration::from_millis(50)));
        let orch = Arc::new(orchestrator(Arc::clone(&provider)));
        let cancel = CancellationToken::new();

        let a = {
            let orch = Arc::clone(&orch);
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.fetch(&[request(keys(4))], &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = {
            let orch = Arc::clone(&orch);
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.fetch(&[request(keys(4))], &cancel).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(provider.keys_requested("trade_data").len(), 4);
        assert_eq!(b.report.coalesced, 4);
        assert_eq!(a.results[0], b.results[0]);
    }

    #[tokio::test]
    async fn test_duplicate_keys_across_requests_fetched_once() {
        let provider = Arc::new(volume_provider());
        let orch = orchestrator(Arc::clone(&provider));
        let out = orch
            .fetch(
                &[request(keys(3)), request(keys(3))],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(provider.keys_requested("trade_data").len(), 3);
        assert_eq!(out.results[0], out.results[1]);
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_keys() {
        let orch = orchestrator(Arc::new(volume_provider()));
        let out = orch
            .fetch(
                &[FetchRequest {
                    provider: "nobody".to_string(),
                    endpoint: "x".to_string(),
                    category: FieldCategory::Price,
                    keys: keys(2),
                }],
                &CancellationToken::new(),
            )
            .await;
        assert!(out.results[0]
            .values()
            .all(|o| *o == KeyOutcome::FetchFailed));
    }
}
