//! Token-bucket rate limiting.
//!
//! Tokens accrue continuously at `refill_rate_per_second` up to `capacity` and
//! each admitted request spends one. The refill is computed lazily on every
//! check from the time elapsed since the previous one, so the bucket is exact
//! however long a key sits idle, and a full bucket allows a burst of
//! `capacity` requests.

use std::time::{Duration, Instant};

use crate::error::{RateLimitError, Result, TurnstileError};

use super::limiter::RateLimiter;
use super::store::KeyedStore;
use super::time::ceil_millis;

/// Per-key token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    capacity: f64,
    refill_rate_per_second: f64,
    /// Always within `0.0..=capacity`
    available: f64,
    last_refill: Instant,
}

impl TokenBucketState {
    /// Create a full bucket.
    pub fn new(capacity: u64, refill_rate_per_second: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate_per_second,
            available: capacity as f64,
            last_refill: now,
        }
    }

    /// Try to spend one token at `now`.
    ///
    /// On rejection, returns how long until a whole token will be available.
    pub fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);

        if self.available >= 1.0 {
            self.available -= 1.0;
            return Ok(());
        }

        // Tiny rates can put the next token beyond what a Duration can hold
        let deficit = 1.0 - self.available;
        Err(Duration::try_from_secs_f64(deficit / self.refill_rate_per_second)
            .unwrap_or(Duration::MAX))
    }

    /// Resize the bucket. Tokens accrued so far are credited at the old rate
    /// and then clamped to the new capacity.
    pub fn resize(&mut self, capacity: u64, refill_rate_per_second: f64, now: Instant) {
        self.refill(now);
        self.capacity = capacity as f64;
        self.refill_rate_per_second = refill_rate_per_second;
        self.available = self.available.min(self.capacity);
    }

    /// Tokens currently in the bucket (as of the last refill).
    pub fn available(&self) -> f64 {
        self.available
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        // A caller that read the clock before a competing caller took the lock
        // may arrive with an older instant; it simply accrues nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let accrued = elapsed.as_secs_f64() * self.refill_rate_per_second;
        self.available = (self.available + accrued).min(self.capacity);
        self.last_refill = now;
    }
}

/// Token-bucket limiter keyed by `(service, operation)`.
pub struct TokenBucketRateLimiter {
    capacity: u64,
    refill_rate_per_second: f64,
    buckets: KeyedStore<TokenBucketState>,
}

impl TokenBucketRateLimiter {
    /// Create a limiter whose buckets hold `capacity` tokens and refill at
    /// `refill_rate_per_second`.
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::InvalidArgument(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
            return Err(TurnstileError::InvalidArgument(format!(
                "refill_rate_per_second must be positive, got {refill_rate_per_second}"
            )));
        }

        Ok(Self {
            capacity,
            refill_rate_per_second,
            buckets: KeyedStore::new(),
        })
    }

    /// Check the limit for `service_name.operation_name` as of `now`.
    pub fn check_at(
        &self,
        service_name: &str,
        operation_name: &str,
        now: Instant,
    ) -> std::result::Result<(), RateLimitError> {
        self.buckets
            .with_entry(
                service_name,
                operation_name,
                || TokenBucketState::new(self.capacity, self.refill_rate_per_second, now),
                |bucket| bucket.try_acquire(now),
            )
            .map_err(|wait| {
                RateLimitError::rate_limited(service_name, operation_name, ceil_millis(wait))
            })
    }

    /// Get the tokens left in a key's bucket.
    ///
    /// Returns `None` if the key has never been checked.
    pub fn available_tokens(&self, service_name: &str, operation_name: &str) -> Option<f64> {
        self.buckets.inspect(service_name, operation_name, |bucket| bucket.available())
    }

    /// Configured bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Configured refill rate.
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl RateLimiter for TokenBucketRateLimiter {
    fn check(&self, service_name: &str, operation_name: &str) -> std::result::Result<(), RateLimitError> {
        self.check_at(service_name, operation_name, Instant::now())
    }

    fn strategy(&self) -> &'static str {
        "token_bucket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionKind;
    use std::sync::Arc;
    use std::thread;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(TokenBucketRateLimiter::new(0, 1.0).is_err());
        assert!(TokenBucketRateLimiter::new(10, 0.0).is_err());
        assert!(TokenBucketRateLimiter::new(10, -2.0).is_err());
        assert!(TokenBucketRateLimiter::new(10, f64::NAN).is_err());
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let limiter = TokenBucketRateLimiter::new(10, 5.0).unwrap();
        let t0 = Instant::now();

        for _ in 0..10 {
            assert!(limiter.check_at("s3", "PutObject", t0).is_ok());
        }

        let err = limiter.check_at("s3", "PutObject", t0).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::RateLimited);
        // One token at 5/s takes 200ms
        assert_eq!(err.retry_after_ms(), 200);
    }

    #[test]
    fn test_partial_refill_shortens_retry_hint() {
        let limiter = TokenBucketRateLimiter::new(1, 2.0).unwrap();
        let t0 = Instant::now();

        limiter.check_at("s3", "GetObject", t0).unwrap();
        let err = limiter.check_at("s3", "GetObject", t0 + ms(100)).unwrap_err();
        assert_eq!(err.retry_after_ms(), 400);

        let retry_at = t0 + ms(100) + err.retry_after();
        assert!(limiter.check_at("s3", "GetObject", retry_at).is_ok());
    }

    #[test]
    fn test_refill_is_clamped_to_capacity() {
        let limiter = TokenBucketRateLimiter::new(3, 1.0).unwrap();
        let t0 = Instant::now();

        limiter.check_at("s3", "GetObject", t0).unwrap();
        limiter.check_at("s3", "GetObject", t0 + Duration::from_secs(3600)).unwrap();

        assert_eq!(limiter.available_tokens("s3", "GetObject"), Some(2.0));
    }

    #[test]
    fn test_exactly_capacity_admits_after_idle() {
        let limiter = TokenBucketRateLimiter::new(4, 2.0).unwrap();
        let t0 = Instant::now();

        // Drain, then idle for capacity / rate seconds
        while limiter.check_at("lambda", "Invoke", t0).is_ok() {}
        let later = t0 + Duration::from_secs(2);

        let admitted = (0..10)
            .take_while(|_| limiter.check_at("lambda", "Invoke", later).is_ok())
            .count();
        assert_eq!(admitted, 4);
    }

    #[test]
    fn test_tokens_never_negative() {
        let limiter = TokenBucketRateLimiter::new(2, 1.0).unwrap();
        let t0 = Instant::now();

        for _ in 0..20 {
            let _ = limiter.check_at("s3", "GetObject", t0);
        }

        let available = limiter.available_tokens("s3", "GetObject").unwrap();
        assert!((0.0..=2.0).contains(&available));
    }

    #[test]
    fn test_tiny_refill_rate_saturates_retry_hint() {
        let limiter = TokenBucketRateLimiter::new(1, 1e-20).unwrap();
        let t0 = Instant::now();

        assert!(limiter.check_at("s3", "GetObject", t0).is_ok());

        let err = limiter.check_at("s3", "GetObject", t0).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::RateLimited);
        assert_eq!(err.retry_after_ms(), u64::MAX);
    }

    #[test]
    fn test_stale_instant_does_not_rewind_bucket() {
        let mut bucket = TokenBucketState::new(1, 1.0, Instant::now());
        let t0 = bucket.last_refill;

        bucket.try_acquire(t0 + ms(500)).unwrap();
        assert!(bucket.try_acquire(t0).is_err());
        assert_eq!(bucket.last_refill, t0 + ms(500));
    }

    #[test]
    fn test_resize_clamps_tokens() {
        let t0 = Instant::now();
        let mut bucket = TokenBucketState::new(10, 10.0, t0);

        bucket.resize(5, 5.0, t0);
        assert_eq!(bucket.available(), 5.0);
        assert_eq!(bucket.capacity(), 5.0);

        bucket.resize(8, 8.0, t0);
        assert_eq!(bucket.available(), 5.0);
    }

    #[test]
    fn test_keys_do_not_share_tokens() {
        let limiter = TokenBucketRateLimiter::new(1, 1.0).unwrap();
        let t0 = Instant::now();

        assert!(limiter.check_at("a", "op1", t0).is_ok());
        assert!(limiter.check_at("a", "op1", t0).is_err());
        assert!(limiter.check_at("a", "op2", t0).is_ok());
        assert!(limiter.check_at("b", "op1", t0).is_ok());
    }

    #[test]
    fn test_concurrent_callers_never_overspend() {
        let limiter = Arc::new(TokenBucketRateLimiter::new(50, 0.001).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check("dynamodb", "PutItem").is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert!(limiter.available_tokens("dynamodb", "PutItem").unwrap() >= 0.0);
    }

    #[test]
    fn test_scenario_burst_then_refill() {
        let limiter = TokenBucketRateLimiter::new(10, 5.0).unwrap();

        for _ in 0..10 {
            assert!(limiter.check("s3", "GetObject").is_ok());
        }
        assert!(limiter.check("s3", "GetObject").is_err());

        thread::sleep(Duration::from_secs(1));

        for _ in 0..5 {
            assert!(limiter.check("s3", "GetObject").is_ok());
        }
    }
}
