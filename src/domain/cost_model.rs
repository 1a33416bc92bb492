//! Batch Cost Model
//!
//! Providers meter batch endpoints sub-linearly: a call for N keys costs
//! `ceil(N^0.8 * base_cost)` units, a single-key call costs `base_cost`.
//! Grouping pending keys into full batches is therefore always cheaper than
//! issuing them one by one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Exponent of the batch cost curve
pub const BATCH_COST_EXPONENT: f64 = 0.8;

/// Declared pricing of one provider endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointCost {
    pub base_cost: f64,
    pub max_batch_size: usize,
}

impl EndpointCost {
    pub fn new(base_cost: f64, max_batch_size: usize) -> Self {
        Self {
            base_cost,
            max_batch_size,
        }
    }

    /// Cost of one call carrying `n` keys.
    pub fn cost(&self, n: usize) -> f64 {
        match n {
            0 => 0.0,
            1 => self.base_cost,
            n => ((n as f64).powf(BATCH_COST_EXPONENT) * self.base_cost).ceil(),
        }
    }

    /// Cost of fetching `n` keys with one call each.
    pub fn individual_cost(&self, n: usize) -> f64 {
        n as f64 * self.base_cost
    }
}

/// Partition a batch is planned within.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub provider: String,
    pub endpoint: String,
}

impl PartitionKey {
    pub fn new(provider: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// One provider call, ready to dispatch. `keys.len() <= max_batch_size` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub provider: String,
    pub endpoint: String,
    pub keys: Vec<String>,
    pub cost: f64,
    /// What the same keys would have cost as single-key calls
    pub individual_cost: f64,
}

/// `(actual, individual-equivalent)` cost of a set of planned batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingsEstimate {
    pub actual_cost: f64,
    pub individual_cost: f64,
}

impl SavingsEstimate {
    pub fn saved(&self) -> f64 {
        (self.individual_cost - self.actual_cost).max(0.0)
    }

    pub fn saved_pct(&self) -> f64 {
        if self.individual_cost <= 0.0 {
            0.0
        } else {
            self.saved() / self.individual_cost * 100.0
        }
    }

    pub fn merge(&mut self, other: SavingsEstimate) {
        self.actual_cost += other.actual_cost;
        self.individual_cost += other.individual_cost;
    }
}

/// Chunk the keys of one partition into batches, filling each batch fully before
/// opening the next. Duplicate keys are collapsed first.
pub fn pack_partition(
    partition: &PartitionKey,
    keys: &[String],
    pricing: EndpointCost,
) -> Vec<BatchRequest> {
    let mut seen = HashSet::with_capacity(keys.len());
    let unique: Vec<String> = keys
        .iter()
        .filter(|key| seen.insert(*key))
        .cloned()
        .collect();

    let size = pricing.max_batch_size.max(1);
    unique
        .chunks(size)
        .map(|chunk| BatchRequest {
            provider: partition.provider.clone(),
            endpoint: partition.endpoint.clone(),
            keys: chunk.to_vec(),
            cost: pricing.cost(chunk.len()),
            individual_cost: pricing.individual_cost(chunk.len()),
        })
        .collect()
}

/// Plan batches for every partition. `pricing` resolves a partition's declared cost.
///
/// Partitions are visited in key order so plans are reproducible.
pub fn plan_batches<F>(
    pending: &BTreeMap<PartitionKey, Vec<String>>,
    mut pricing: F,
) -> Vec<BatchRequest>
where
    F: FnMut(&PartitionKey) -> EndpointCost,
{
    pending
        .iter()
        .flat_map(|(partition, keys)| {
            let cost = pricing(partition);
            pack_partition(partition, keys, cost)
        })
        .collect()
}

pub fn estimate_savings(batches: &[BatchRequest]) -> SavingsEstimate {
    batches
        .iter()
        .fold(SavingsEstimate::default(), |mut acc, batch| {
            acc.actual_cost += batch.cost;
            acc.individual_cost += batch.individual_cost;
            acc
        })
}
