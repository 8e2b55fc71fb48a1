//! Keyed token bucket rate limiting
//!
//! Each admission key (caller, tenant, API key...) owns an independent bucket.
//! Buckets accumulate tokens continuously at `refill_rate_per_second` up to
//! `capacity`; an admitted call spends `cost` tokens. Token counts are real
//! valued so slow refill rates are not quantized away.
//!
//! Every bucket sits behind its own mutex. The key map is only write-locked
//! when a key is seen for the first time (or evicted), so calls for distinct
//! keys never wait on each other's refill arithmetic.
//!
//! # Example
//!
//! ```
//! use sluice_core_resilience::rate_limiter::{RateLimiter, TokenBucketConfig};
//!
//! let limiter = RateLimiter::new(TokenBucketConfig {
//!     capacity: 2,
//!     refill_rate_per_second: 1.0,
//! })
//! .unwrap();
//!
//! assert!(limiter.allow("tenant-a", 1));
//! assert!(limiter.allow("tenant-a", 1));
//! assert!(!limiter.allow("tenant-a", 1)); // exhausted
//! assert!(limiter.allow("tenant-b", 1)); // independent key
//! ```

use crate::clock::{system_clock, SharedClock};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Shape of a single token bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum tokens the bucket can hold (burst size)
    pub capacity: u32,

    /// Tokens added per second of elapsed time
    pub refill_rate_per_second: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate_per_second: 10.0,
        }
    }
}

impl TokenBucketConfig {
    /// Reject capacities below 1 and non-positive or non-finite rates
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.capacity));
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(ConfigError::InvalidRefillRate(self.refill_rate_per_second));
        }
        Ok(())
    }
}

/// A single token bucket. Not synchronized on its own.
#[derive(Debug, Clone)]
pub struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_rate_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Create a full bucket
    pub fn new(config: TokenBucketConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_rate_per_second: config.refill_rate_per_second,
            last_refill: now,
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    ///
    /// An instant at or before the last refill credits nothing and leaves
    /// the refill point where it is.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        self.tokens = self.tokens_at(now);
        self.last_refill = now;
        self.check_invariant();
    }

    /// Tokens the bucket would hold at `now`, without refilling it
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate_per_second).min(self.capacity)
    }

    /// Refill, then spend `cost` tokens if available
    pub fn try_consume(&mut self, cost: u32, now: Instant) -> bool {
        self.refill(now);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            self.check_invariant();
            true
        } else {
            false
        }
    }

    /// Tokens currently held, as of the last refill
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    fn check_invariant(&self) {
        debug_assert!(
            self.tokens >= 0.0 && self.tokens <= self.capacity,
            "token count {} outside [0, {}]",
            self.tokens,
            self.capacity
        );
    }
}

/// Token bucket rate limiter with one bucket per admission key
#[derive(Debug)]
pub struct RateLimiter {
    default_config: TokenBucketConfig,
    overrides: HashMap<String, TokenBucketConfig>,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter using the system clock
    pub fn new(config: TokenBucketConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, system_clock())
    }

    /// Create a limiter reading time from `clock`
    pub fn with_clock(config: TokenBucketConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            default_config: config,
            overrides: HashMap::new(),
            buckets: RwLock::new(HashMap::new()),
            clock,
        })
    }

    /// Give `key` its own bucket shape instead of the default
    pub fn with_override(
        mut self,
        key: impl Into<String>,
        config: TokenBucketConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        self.overrides.insert(key.into(), config);
        Ok(self)
    }

    /// Decide whether a call for `key` costing `cost` tokens is admitted.
    ///
    /// A cost of 0 is charged as 1. Rejection leaves the token count as it
    /// was after refilling.
    pub fn allow(&self, key: &str, cost: u32) -> bool {
        let cost = cost.max(1);
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let admitted = bucket.try_consume(cost, now);
        if !admitted {
            debug!(
                key,
                cost,
                tokens = bucket.tokens(),
                "Rate limit exhausted"
            );
        }
        admitted
    }

    /// Tokens available to `key` right now, or `None` if the key was never seen.
    ///
    /// Read-only: the bucket's refill point does not move, so monitoring a
    /// key does not keep it from being evicted.
    pub fn available(&self, key: &str) -> Option<f64> {
        let bucket = {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            buckets.get(key).cloned()
        }?;
        let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        Some(bucket.tokens_at(self.clock.now()))
    }

    /// Drop buckets that are full and untouched for longer than `max_idle`.
    ///
    /// A full bucket is indistinguishable from a freshly created one, so
    /// eviction never changes an admission decision. Returns the number of
    /// buckets removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            let idle = now.saturating_duration_since(bucket.last_refill());
            !(bucket.tokens_at(now) >= bucket.capacity() && idle > max_idle)
        });
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "Evicted idle rate limit buckets");
        }
        evicted
    }

    /// Number of keys currently tracked
    pub fn bucket_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Bucket shape that applies to `key`
    pub fn config_for(&self, key: &str) -> TokenBucketConfig {
        self.overrides
            .get(key)
            .copied()
            .unwrap_or(self.default_config)
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }

        let config = self.config_for(key);
        let now = self.clock.now();
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(config, now)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(capacity: u32, rate: f64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            TokenBucketConfig {
                capacity,
                refill_rate_per_second: rate,
            },
            Arc::new(clock.clone()),
        )
        .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_config_validation() {
        assert!(TokenBucketConfig::default().validate().is_ok());

        let bad = TokenBucketConfig {
            capacity: 0,
            refill_rate_per_second: 1.0,
        };
        assert_eq!(bad.validate(), Err(ConfigError::InvalidCapacity(0)));

        for rate in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let bad = TokenBucketConfig {
                capacity: 1,
                refill_rate_per_second: rate,
            };
            assert!(bad.validate().is_err(), "rate {rate} should be rejected");
        }
    }

    #[test]
    fn test_burst_then_refill() {
        let (limiter, clock) = limiter(10, 1.0);

        let admitted: Vec<bool> = (0..15).map(|_| limiter.allow("k", 1)).collect();
        assert!(admitted[..10].iter().all(|a| *a));
        assert!(admitted[10..].iter().all(|a| !*a));

        clock.advance(Duration::from_secs(5));
        for _ in 0..5 {
            assert!(limiter.allow("k", 1));
        }
        assert!(!limiter.allow("k", 1));
    }

    #[test]
    fn test_rejection_does_not_consume() {
        let (limiter, clock) = limiter(5, 1.0);
        assert!(limiter.allow("k", 4));
        assert!(!limiter.allow("k", 3)); // only 1 left

        clock.advance(Duration::from_secs(2));
        // 1 + 2 refilled = 3, the failed call above spent nothing
        assert!(limiter.allow("k", 3));
    }

    #[test]
    fn test_cost_equal_to_tokens_is_admitted() {
        let (limiter, _clock) = limiter(3, 1.0);
        assert!(limiter.allow("k", 3));
        assert_eq!(limiter.available("k"), Some(0.0));
    }

    #[test]
    fn test_zero_cost_charged_as_one() {
        let (limiter, _clock) = limiter(1, 1.0);
        assert!(limiter.allow("k", 0));
        assert!(!limiter.allow("k", 0));
    }

    #[test]
    fn test_cost_above_capacity_never_admitted() {
        let (limiter, clock) = limiter(2, 100.0);
        clock.advance(Duration::from_secs(60));
        assert!(!limiter.allow("k", 3));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let (limiter, clock) = limiter(4, 10.0);
        assert!(limiter.allow("k", 4));
        clock.advance(Duration::from_secs(3600));
        assert_eq!(limiter.available("k"), Some(4.0));
    }

    #[test]
    fn test_tokens_stay_in_range() {
        let (limiter, clock) = limiter(7, 2.5);
        let costs = [1, 3, 2, 7, 1, 1, 5, 2, 8, 1];
        for (i, cost) in costs.iter().cycle().take(200).enumerate() {
            clock.advance(Duration::from_millis((i as u64 * 37) % 700));
            limiter.allow("k", *cost);
            let tokens = limiter.available("k").unwrap();
            assert!((0.0..=7.0).contains(&tokens), "tokens {tokens} out of range");
        }
    }

    #[test]
    fn test_split_refill_matches_single_refill() {
        let start = Instant::now();
        let config = TokenBucketConfig {
            capacity: 50,
            refill_rate_per_second: 0.37,
        };

        let mut single = Bucket::new(config, start);
        let mut split = single.clone();
        assert!(single.try_consume(40, start));
        assert!(split.try_consume(40, start));

        single.refill(start + Duration::from_millis(9_000));
        for step in 1..=9 {
            split.refill(start + Duration::from_millis(step * 1_000));
        }

        assert!((single.tokens() - split.tokens()).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_order_refill_credits_once() {
        let start = Instant::now();
        let config = TokenBucketConfig {
            capacity: 10,
            refill_rate_per_second: 1.0,
        };
        let mut bucket = Bucket::new(config, start);
        assert!(bucket.try_consume(10, start));

        let later = start + Duration::from_secs(1);
        bucket.refill(later);
        bucket.refill(start + Duration::from_millis(500));
        bucket.refill(later);

        assert!((bucket.tokens() - 1.0).abs() < 1e-9, "tokens {}", bucket.tokens());
        assert_eq!(bucket.last_refill(), later);

        // A stale instant cannot spend tokens it has not earned
        assert!(bucket.try_consume(1, start));
        assert!(!bucket.try_consume(1, start + Duration::from_millis(900)));
    }

    #[test]
    fn test_available_does_not_postpone_eviction() {
        let (limiter, clock) = limiter(10, 1.0);
        limiter.allow("watched", 1);

        for _ in 0..20 {
            clock.advance(Duration::from_secs(1));
            assert!(limiter.available("watched").is_some());
        }
        assert_eq!(limiter.available("watched"), Some(10.0));
        assert_eq!(limiter.evict_idle(Duration::from_secs(10)), 1);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(1, 1.0);
        assert!(limiter.allow("a", 1));
        assert!(!limiter.allow("a", 1));
        assert!(limiter.allow("b", 1));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_per_key_override() {
        let (limiter, _clock) = limiter(1, 1.0);
        let limiter = limiter
            .with_override(
                "premium",
                TokenBucketConfig {
                    capacity: 3,
                    refill_rate_per_second: 1.0,
                },
            )
            .unwrap();

        assert_eq!(limiter.config_for("premium").capacity, 3);
        assert!(limiter.allow("premium", 3));
        assert!(!limiter.allow("basic", 2));
    }

    #[test]
    fn test_evict_idle_only_removes_full_buckets() {
        let (limiter, clock) = limiter(10, 1.0);
        limiter.allow("idle", 1);
        limiter.allow("drained", 10);

        clock.advance(Duration::from_secs(5));
        // "idle" has refilled to capacity, "drained" holds 5 tokens
        assert_eq!(limiter.evict_idle(Duration::from_secs(2)), 1);
        assert_eq!(limiter.available("idle"), None);
        assert_eq!(limiter.available("drained"), Some(5.0));
    }

    #[test]
    fn test_concurrent_allow_never_over_admits() {
        let (limiter, _clock) = limiter(100, 1.0);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..50).filter(|_| limiter.allow("shared", 1)).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
