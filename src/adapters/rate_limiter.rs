//! Token bucket rate limiter, one bucket per provider domain.
//!
//! Buckets start full and refill continuously. Callers of `acquire` queue on a
//! per-domain fair mutex, so waiters are served in arrival order and the
//! bucket lock is never held across a sleep.
//!
//! A provider throttle signal puts the domain in backoff: capacity and refill
//! rate are halved until the cooldown elapses. Capacity never drops below one
//! token, so a throttled domain still grants at its reduced rate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("No rate limit configured for domain: {0}")]
    UnknownDomain(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Backoff window after a throttle signal
    #[serde(default = "default_cooldown_secs")]
    pub throttle_cooldown_secs: f64,
}

fn default_cooldown_secs() -> f64 {
    30.0
}

impl RateLimitConfig {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            throttle_cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Snapshot of one domain's bucket
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub domain: String,
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens_available: f64,
    pub throttled: bool,
    pub throttle_events: u64,
}

/// Smallest bucket that can still hold a whole token
pub const MIN_CAPACITY: f64 = 1.0;

#[derive(Debug)]
struct TokenBucket {
    base_capacity: f64,
    base_refill: f64,
    cooldown: Duration,
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    throttled_until: Option<Instant>,
    throttle_events: u64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        // A bucket below one token could never grant a request
        let capacity = config.capacity.max(MIN_CAPACITY);
        Self {
            base_capacity: capacity,
            base_refill: config.refill_per_sec,
            cooldown: Duration::from_secs_f64(config.throttle_cooldown_secs.max(0.0)),
            capacity,
            refill_rate: config.refill_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
            throttled_until: None,
            throttle_events: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.throttled_until {
            if now >= until {
                // Tokens earned during the cooldown accrue at the reduced rate
                self.accrue(until);
                self.capacity = self.base_capacity;
                self.refill_rate = self.base_refill;
                self.throttled_until = None;
            }
        }
        self.accrue(now);
    }

    fn accrue(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).clamp(0.0, self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }

    fn throttle(&mut self, now: Instant, retry_after: Option<Duration>) {
        self.refill(now);
        let cooldown = retry_after.map_or(self.cooldown, |r| r.max(self.cooldown));
        self.capacity = (self.base_capacity / 2.0).max(MIN_CAPACITY);
        self.refill_rate = self.base_refill / 2.0;
        self.tokens = self.tokens.min(self.capacity);
        self.throttled_until = Some(now + cooldown);
        self.throttle_events += 1;
    }
}

#[derive(Debug)]
struct Domain {
    bucket: Mutex<TokenBucket>,
    /// Fair queue for waiting acquirers
    queue: tokio::sync::Mutex<()>,
}

impl Domain {
    fn bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pool of token buckets keyed by provider domain
#[derive(Debug, Default)]
pub struct RateLimiter {
    domains: HashMap<String, Arc<Domain>>,
}

impl RateLimiter {
    pub fn new<I, S>(configs: I) -> Self
    where
        I: IntoIterator<Item = (S, RateLimitConfig)>,
        S: Into<String>,
    {
        let domains = configs
            .into_iter()
            .map(|(name, config)| {
                let domain = Domain {
                    bucket: Mutex::new(TokenBucket::new(&config)),
                    queue: tokio::sync::Mutex::new(()),
                };
                (name.into(), Arc::new(domain))
            })
            .collect();
        Self { domains }
    }

    fn domain(&self, name: &str) -> Result<&Arc<Domain>, RateLimitError> {
        self.domains
            .get(name)
            .ok_or_else(|| RateLimitError::UnknownDomain(name.to_string()))
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.domains.contains_key(name)
    }

    /// Wait for a token, then consume it.
    pub async fn acquire(&self, domain: &str) -> Result<(), RateLimitError> {
        let domain = self.domain(domain)?;
        let _turn = domain.queue.lock().await;
        loop {
            let wait = match domain.bucket().try_take(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now and nobody is queued.
    pub fn try_acquire(&self, domain: &str) -> Result<bool, RateLimitError> {
        let domain = self.domain(domain)?;
        let Ok(_turn) = domain.queue.try_lock() else {
            return Ok(false);
        };
        let taken = domain.bucket().try_take(Instant::now()).is_ok();
        Ok(taken)
    }

    /// Provider signalled throttling; back off for the cooldown or `retry_after`,
    /// whichever is longer.
    pub fn throttle(&self, domain: &str, retry_after: Option<Duration>) -> Result<(), RateLimitError> {
        let handle = self.domain(domain)?;
        let mut bucket = handle.bucket();
        bucket.throttle(Instant::now(), retry_after);
        tracing::warn!(
            domain,
            capacity = bucket.capacity,
            refill_rate = bucket.refill_rate,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Provider throttled, rate limit halved"
        );
        Ok(())
    }

    pub fn status(&self, domain: &str) -> Result<RateLimitStatus, RateLimitError> {
        let handle = self.domain(domain)?;
        let mut bucket = handle.bucket();
        let now = Instant::now();
        bucket.refill(now);
        Ok(RateLimitStatus {
            domain: domain.to_string(),
            capacity: bucket.capacity,
            refill_rate: bucket.refill_rate,
            tokens_available: bucket.tokens,
            throttled: bucket.throttled_until.map_or(false, |until| now < until),
            throttle_events: bucket.throttle_events,
        })
    }

    pub fn all_status(&self) -> Vec<RateLimitStatus> {
        let mut names: Vec<&String> = self.domains.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.status(name).ok())
            .collect()
    }
}
