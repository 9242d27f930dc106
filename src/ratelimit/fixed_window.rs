//! Fixed-window rate limiting.
//!
//! Requests are counted in discrete, non-overlapping windows. Windows are
//! aligned to the instant the key was first seen: when a window elapses the
//! start advances by a whole number of window lengths, so boundaries stay
//! periodic no matter how long the key sat idle.

use std::time::{Duration, Instant};

use crate::error::{RateLimitError, Result, TurnstileError};

use super::limiter::RateLimiter;
use super::store::KeyedStore;
use super::time::{ceil_millis, positive_secs};

/// Per-key counter for one fixed window.
#[derive(Debug, Clone)]
pub struct FixedWindowState {
    /// When the current window started
    window_start: Instant,
    /// Length of every window
    window: Duration,
    /// Maximum admits per window
    limit: u64,
    /// Admits recorded in the current window
    count: u64,
}

impl FixedWindowState {
    /// Create a counter whose first window starts at `now`.
    pub fn new(limit: u64, window: Duration, now: Instant) -> Self {
        Self {
            window_start: now,
            window,
            limit,
            count: 0,
        }
    }

    /// Try to admit one request at `now`.
    ///
    /// On rejection, returns the time left until the current window ends.
    pub fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.roll_window(now);

        if self.count < self.limit {
            self.count += 1;
            return Ok(());
        }

        match self.window_start.checked_add(self.window) {
            Some(window_end) => Err(window_end.saturating_duration_since(now)),
            // The window ends beyond anything an Instant can represent
            None => Err(Duration::MAX),
        }
    }

    /// Change the per-window limit. Admits already counted in this window stay.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Get the limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the count in the current window (as of the last roll).
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Reset the counter if the current window has elapsed.
    fn roll_window(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return;
        }

        let windows_passed = elapsed.as_nanos() / self.window.as_nanos();
        let advance = self.window.as_nanos() * windows_passed;
        self.window_start += Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
        self.count = 0;
    }
}

/// Fixed-window limiter keyed by `(service, operation)`.
///
/// A limit of zero is accepted and rejects every request.
pub struct FixedWindowRateLimiter {
    limit: u64,
    window: Duration,
    states: KeyedStore<FixedWindowState>,
}

impl FixedWindowRateLimiter {
    /// Create a limiter admitting `limit` requests per `window_seconds`.
    pub fn new(limit: u64, window_seconds: f64) -> Result<Self> {
        let window = positive_secs("window_seconds", window_seconds)?;
        Self::with_window(limit, window)
    }

    /// Create a limiter admitting `limit` requests per `window`.
    pub fn with_window(limit: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(TurnstileError::InvalidArgument(
                "window must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            limit,
            window,
            states: KeyedStore::new(),
        })
    }

    /// Check the limit for `service_name.operation_name` as of `now`.
    pub fn check_at(
        &self,
        service_name: &str,
        operation_name: &str,
        now: Instant,
    ) -> std::result::Result<(), RateLimitError> {
        self.states
            .with_entry(
                service_name,
                operation_name,
                || FixedWindowState::new(self.limit, self.window, now),
                |state| state.try_acquire(now),
            )
            .map_err(|wait| {
                RateLimitError::rate_limited(service_name, operation_name, ceil_millis(wait))
            })
    }

    /// Get the count in the current window for a key.
    ///
    /// Returns `None` if the key has never been checked.
    pub fn current_count(&self, service_name: &str, operation_name: &str) -> Option<u64> {
        self.states.inspect(service_name, operation_name, |state| state.count())
    }

    /// Configured per-window limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.states.len()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.states.clear();
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(&self, service_name: &str, operation_name: &str) -> std::result::Result<(), RateLimitError> {
        self.check_at(service_name, operation_name, Instant::now())
    }

    fn strategy(&self) -> &'static str {
        "fixed_window"
    }
}
