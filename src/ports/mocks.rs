//! In-crate fakes for the ports, used by unit and integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::alerts::{AlertError, AlertSink};
use super::discovery::{DiscoveryError, DiscoveryFilter, DiscoverySource};
use super::provider::{BatchResponse, KeyError, KeyResult, ProviderClient, ProviderError};
use crate::domain::{CandidateSeed, ScoreResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Provider with scripted per-key results, injectable call failures and call recording
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    base_cost: f64,
    default_batch_size: usize,
    batch_sizes: HashMap<String, usize>,
    records: Mutex<HashMap<(String, String), KeyResult>>,
    defaults: Mutex<HashMap<String, Value>>,
    poisoned: Mutex<HashSet<String>>,
    failures: Mutex<VecDeque<ProviderError>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base_cost: 5.0,
            default_batch_size: 50,
            batch_sizes: HashMap::new(),
            records: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    pub fn with_base_cost(mut self, base_cost: f64) -> Self {
        self.base_cost = base_cost;
        self
    }

    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size;
        self
    }

    pub fn with_batch_size(mut self, endpoint: &str, size: usize) -> Self {
        self.batch_sizes.insert(endpoint.to_string(), size);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Value returned for `key` on `endpoint`
    pub fn with_record(self, endpoint: &str, key: &str, value: Value) -> Self {
        lock(&self.records).insert((endpoint.to_string(), key.to_string()), Ok(value));
        self
    }

    pub fn with_key_error(self, endpoint: &str, key: &str, error: KeyError) -> Self {
        lock(&self.records).insert((endpoint.to_string(), key.to_string()), Err(error));
        self
    }

    /// Value returned for any unscripted key on `endpoint`
    pub fn with_default_record(self, endpoint: &str, value: Value) -> Self {
        lock(&self.defaults).insert(endpoint.to_string(), value);
        self
    }

    /// Any call carrying `key` fails with a transient error
    pub fn with_poisoned_key(self, key: &str) -> Self {
        lock(&self.poisoned).insert(key.to_string());
        self
    }

    /// The next call fails with `error`; queued failures are consumed in order
    pub fn fail_next(&self, error: ProviderError) {
        lock(&self.failures).push_back(error);
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Every key sent to `endpoint`, in call order
    pub fn keys_requested(&self, endpoint: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|(e, _)| e == endpoint)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self, endpoint: &str) -> usize {
        self.batch_sizes
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_batch_size)
    }

    fn base_cost(&self, _endpoint: &str) -> f64 {
        self.base_cost
    }

    async fn fetch_batch(
        &self,
        endpoint: &str,
        keys: &[String],
    ) -> Result<BatchResponse, ProviderError> {
        lock(&self.calls).push((endpoint.to_string(), keys.to_vec()));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        if keys.iter().any(|k| lock(&self.poisoned).contains(k)) {
            return Err(ProviderError::Transient("poisoned key in batch".to_string()));
        }

        let records = lock(&self.records);
        let defaults = lock(&self.defaults);
        let mut response = BatchResponse::new();
        for key in keys {
            let scripted = records.get(&(endpoint.to_string(), key.clone())).cloned();
            let result = scripted.or_else(|| defaults.get(endpoint).cloned().map(Ok));
            if let Some(result) = result {
                response.insert(key.clone(), result);
            }
        }
        Ok(response)
    }
}

/// Discovery over a fixed seed list, honouring the filter minimums
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    seeds: Mutex<Vec<CandidateSeed>>,
    filters: Mutex<Vec<DiscoveryFilter>>,
    failures: Mutex<VecDeque<DiscoveryError>>,
}

impl StaticDiscovery {
    pub fn new(seeds: Vec<CandidateSeed>) -> Self {
        Self {
            seeds: Mutex::new(seeds),
            ..Default::default()
        }
    }

    pub fn set_seeds(&self, seeds: Vec<CandidateSeed>) {
        *lock(&self.seeds) = seeds;
    }

    pub fn fail_next(&self, error: DiscoveryError) {
        lock(&self.failures).push_back(error);
    }

    /// Filters passed to each `discover` call, in order
    pub fn filters_seen(&self) -> Vec<DiscoveryFilter> {
        lock(&self.filters).clone()
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<CandidateSeed>, DiscoveryError> {
        lock(&self.filters).push(filter.clone());
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.seeds)
            .iter()
            .filter(|seed| filter.admits(seed))
            .take(filter.limit)
            .cloned()
            .collect())
    }
}

/// Alert sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    published: Mutex<Vec<ScoreResult>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<ScoreResult> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn publish(&self, result: &ScoreResult) -> Result<(), AlertError> {
        lock(&self.published).push(result.clone());
        Ok(())
    }
}
