//! Per-client token bucket rate limiting.
//!
//! Every client identity owns a bucket holding up to `capacity` permits that
//! refill continuously at `refill_per_minute`.  Buckets live in a `DashMap`, so
//! the refill-and-consume step for one identity runs under that key's shard
//! lock and concurrent requests from the same client never lose updates.
//!
//! The table is bounded.  Once it holds `max_clients` identities, a sweep drops
//! buckets that have been idle long enough to be full again.  If that is not
//! enough, the least recently active buckets are evicted down to 90% of the
//! bound, so a stream of new identities pays for one sweep per tenth of the
//! table rather than one per request.  State is local to
//! this process; each replica of a horizontally scaled deployment enforces its
//! own limit.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: f64 = 16.0;
pub const DEFAULT_REFILL_PER_MINUTE: f64 = 8.0;
pub const DEFAULT_MAX_CLIENTS: usize = 10_000;

/// Time source for the limiter.  Production uses [`SystemClock`]; tests drive
/// a [`ManualClock`] forward explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.base + offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum permits a bucket can hold (burst size).
    pub capacity: f64,
    /// Permits regenerated per minute.
    pub refill_per_minute: f64,
    /// Upper bound on tracked client identities.
    pub max_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_per_minute: DEFAULT_REFILL_PER_MINUTE,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

impl RateLimitConfig {
    /// Time after which an untouched bucket is guaranteed to be full again.
    fn full_refill_after(&self) -> Duration {
        if self.refill_per_minute <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(self.capacity / self.refill_per_minute * 60.0)
            .unwrap_or(Duration::MAX)
    }

    /// Table size a full sweep evicts down to.  Always leaves room for the
    /// identity that triggered it.
    fn low_water_mark(&self) -> usize {
        (self.max_clients - self.max_clients / 10).min(self.max_clients.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, cfg: &RateLimitConfig) {
        let minutes = now.saturating_duration_since(self.last_refill).as_secs_f64() / 60.0;
        self.tokens = (self.tokens + minutes * cfg.refill_per_minute).min(cfg.capacity);
        self.last_refill = now;
    }
}

pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
    sweeps: AtomicU64,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock,
            sweeps: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Refill the bucket for `identity` and try to take one permit from it.
    /// Returns `false` without consuming anything when the bucket is empty.
    pub fn allow(&self, identity: &str) -> bool {
        let now = self.clock.now();
        if self.buckets.len() >= self.config.max_clients && !self.buckets.contains_key(identity) {
            self.sweep_at(now);
        }
        let capacity = self.config.capacity;
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });
        bucket.refill(now, &self.config);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Evict idle buckets, then the least recently active ones if the table
    /// is still at its bound.  Returns the number of evicted identities.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let before = self.buckets.len();
        let idle_after = self.config.full_refill_after();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < idle_after);

        let len = self.buckets.len();
        if len >= self.config.max_clients {
            let mut by_age: Vec<(String, Instant)> = self
                .buckets
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().last_refill))
                .collect();
            by_age.sort_by_key(|(_, last)| *last);
            let excess = len - self.config.low_water_mark();
            for (key, _) in by_age.into_iter().take(excess) {
                self.buckets.remove(&key);
            }
        }
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "rate limiter sweep");
        }
        evicted
    }

    /// Number of sweeps run so far, periodic and on-demand.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Current permit count for `identity`, without refilling.
    pub fn tokens(&self, identity: &str) -> Option<f64> {
        self.buckets.get(identity).map(|b| b.tokens)
    }

    /// Number of tracked client identities.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
