//! Field Cache
//!
//! TTL cache for decoded provider records, keyed by `(provider, category, key)`.
//! Freshness depends on the category: prices expire in seconds, security flags
//! in hours.
//! - Expired entries are never served; they are dropped lazily on read and by
//!   the periodic sweep
//! - Batched reads and writes take the lock once per batch
//! - Hit/miss counters are kept per category

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::persistence::{load_bincode, save_bincode, PersistError, RecoveryStatus};
use crate::domain::{FieldCategory, FieldRecord};

/// Per-category TTLs, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlTable {
    pub price: u64,
    pub volume: u64,
    pub holders: u64,
    pub metadata: u64,
    pub security: u64,
}

impl Default for TtlTable {
    fn default() -> Self {
        Self {
            price: 30,
            volume: 300,
            holders: 900,
            metadata: 21_600,
            security: 86_400,
        }
    }
}

impl TtlTable {
    pub fn ttl_secs(&self, category: FieldCategory) -> u64 {
        match category {
            FieldCategory::Price => self.price,
            FieldCategory::Volume => self.volume,
            FieldCategory::Holders => self.holders,
            FieldCategory::Metadata => self.metadata,
            FieldCategory::Security => self.security,
        }
    }

    pub fn ttl(&self, category: FieldCategory) -> Duration {
        Duration::from_secs(self.ttl_secs(category))
    }
}

/// A cached lookup result. Confirmed misses are cached too, so a token the
/// provider does not know is not asked about again until the TTL lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedField {
    Found(FieldRecord),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub provider: String,
    pub category: FieldCategory,
    pub key: String,
}

impl CacheKey {
    pub fn new(provider: &str, category: FieldCategory, key: &str) -> Self {
        Self {
            provider: provider.to_string(),
            category,
            key: key.to_string(),
        }
    }
}

/// Cache entry with wall-clock expiry, so it survives a snapshot round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedField,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: CachedField, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500));
        Self {
            value,
            inserted_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub hits: u64,
    pub misses: u64,
}

impl CategoryStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Counters accumulated since `earlier`
    pub fn since(&self, earlier: &CategoryStats) -> CategoryStats {
        CategoryStats {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub per_category: BTreeMap<FieldCategory, CategoryStats>,
}

impl CacheStats {
    pub fn totals(&self) -> CategoryStats {
        self.per_category
            .values()
            .fold(CategoryStats::default(), |acc, s| CategoryStats {
                hits: acc.hits + s.hits,
                misses: acc.misses + s.misses,
            })
    }

    /// Per-category counters accumulated since `earlier`
    pub fn since(&self, earlier: &CacheStats) -> BTreeMap<FieldCategory, CategoryStats> {
        self.per_category
            .iter()
            .map(|(category, stats)| {
                let before = earlier.per_category.get(category).copied().unwrap_or_default();
                (*category, stats.since(&before))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    counters: BTreeMap<FieldCategory, CategoryStats>,
}

impl CacheInner {
    /// Lookup that drops the entry if it has expired.
    fn lookup(&mut self, key: &CacheKey, now: DateTime<Utc>) -> Option<CachedField> {
        let valid = self.entries.get(key).map(|e| e.is_valid_at(now));
        let result = match valid {
            Some(true) => self.entries.get(key).map(|e| e.value.clone()),
            Some(false) => {
                self.entries.remove(key);
                None
            }
            None => None,
        };
        let counter = self.counters.entry(key.category).or_default();
        if result.is_some() {
            counter.hits += 1;
        } else {
            counter.misses += 1;
        }
        result
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry, max_entries: usize, now: DateTime<Utc>) {
        if !self.entries.contains_key(&key) && self.entries.len() >= max_entries {
            self.cleanup(now);
            if self.entries.len() >= max_entries {
                self.remove_oldest();
            }
        }
        self.entries.insert(key, entry);
    }

    fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid_at(now));
        before - self.entries.len()
    }

    fn remove_oldest(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone())
        {
            self.entries.remove(&oldest);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    entries: Vec<(CacheKey, CacheEntry)>,
}

/// Thread-safe field cache shared by the orchestrator
#[derive(Debug)]
pub struct CacheStore {
    inner: Mutex<CacheInner>,
    ttls: TtlTable,
    max_entries: usize,
}

impl CacheStore {
    pub const DEFAULT_MAX_ENTRIES: usize = 50_000;

    pub fn new(ttls: TtlTable, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttls,
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ttls(&self) -> &TtlTable {
        &self.ttls
    }

    pub fn get(&self, provider: &str, category: FieldCategory, key: &str) -> Option<CachedField> {
        self.lock()
            .lookup(&CacheKey::new(provider, category, key), Utc::now())
    }

    /// Resolve a batch of keys under one lock. Returns hits and the keys that missed.
    pub fn get_many(
        &self,
        provider: &str,
        category: FieldCategory,
        keys: &[String],
    ) -> (HashMap<String, CachedField>, Vec<String>) {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for key in keys {
            match inner.lookup(&CacheKey::new(provider, category, key), now) {
                Some(value) => {
                    hits.insert(key.clone(), value);
                }
                None => misses.push(key.clone()),
            }
        }
        (hits, misses)
    }

    /// Insert with an explicit TTL.
    pub fn set(&self, provider: &str, category: FieldCategory, key: &str, value: CachedField, ttl: Duration) {
        let now = Utc::now();
        let entry = CacheEntry::new(value, ttl, now);
        self.lock().insert(
            CacheKey::new(provider, category, key),
            entry,
            self.max_entries,
            now,
        );
    }

    /// Insert using the TTL configured for `category`.
    pub fn set_with_category_ttl(&self, provider: &str, key: &str, value: CachedField, category: FieldCategory) {
        self.set(provider, category, key, value, self.ttls.ttl(category));
    }

    pub fn set_many(&self, provider: &str, category: FieldCategory, items: Vec<(String, CachedField)>) {
        let now = Utc::now();
        let ttl = self.ttls.ttl(category);
        let mut inner = self.lock();
        for (key, value) in items {
            inner.insert(
                CacheKey::new(provider, category, &key),
                CacheEntry::new(value, ttl, now),
                self.max_entries,
                now,
            );
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep(&self) -> usize {
        self.lock().cleanup(Utc::now())
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let inner = self.lock();
        let total = inner.entries.len();
        let valid = inner.entries.values().filter(|e| e.is_valid_at(now)).count();
        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
            per_category: inner.counters.clone(),
        }
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = store.len(), "Cache sweep");
                        }
                    }
                }
            }
        })
    }

    /// Write unexpired entries to `path`.
    pub fn save(&self, path: &Path) -> Result<usize, PersistError> {
        let now = Utc::now();
        let snapshot = {
            let inner = self.lock();
            CacheSnapshot {
                entries: inner
                    .entries
                    .iter()
                    .filter(|(_, e)| e.is_valid_at(now))
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect(),
            }
        };
        save_bincode(path, &snapshot)?;
        Ok(snapshot.entries.len())
    }

    /// Load a snapshot written by `save`, skipping entries that expired meanwhile.
    /// A missing or corrupt snapshot yields an empty cache.
    pub fn load(path: &Path, ttls: TtlTable, max_entries: usize) -> Self {
        let store = Self::new(ttls, max_entries);
        match load_bincode::<CacheSnapshot>(path) {
            RecoveryStatus::Recovered(snapshot) => {
                let now = Utc::now();
                let mut inner = store.lock();
                for (key, entry) in snapshot.entries {
                    if entry.is_valid_at(now) {
                        inner.insert(key, entry, store.max_entries, now);
                    }
                }
                tracing::info!(entries = inner.entries.len(), "Field cache snapshot loaded");
            }
            RecoveryStatus::Missing => {}
            RecoveryStatus::Corrupted(reason) => {
                tracing::warn!(%reason, path = %path.display(), "Field cache snapshot corrupted, starting empty");
            }
        }
        store
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(TtlTable::default(), Self::DEFAULT_MAX_ENTRIES)
    }
}
