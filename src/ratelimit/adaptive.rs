//! Adaptive (AIMD) rate limiting.
//!
//! An [`AdaptiveRateLimiter`] runs a token bucket or fixed window per key at a
//! mutable `current_limit`. The hot path only counts rejections. A periodic
//! health check then adjusts every key:
//!
//! - any rejection since the previous pass halves the limit (never below
//!   `min_limit`),
//! - a quiet interval raises it by `increase_step` (never above `max_limit`).
//!
//! The health check runs on a Tokio task owned by the limiter. It is started
//! with [`AdaptiveRateLimiter::start`] and stopped, and joined, with
//! [`AdaptiveRateLimiter::stop`]. Each adjustment takes the same per-key lock
//! as `check`, so a caller always sees either the old or the new limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::error::{RateLimitError, Result, TurnstileError};

use super::fixed_window::FixedWindowState;
use super::limiter::RateLimiter;
use super::store::KeyedStore;
use super::time::ceil_millis;
use super::token_bucket::TokenBucketState;

/// Default health-check cadence.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Default floor for the adjusted limit.
pub const DEFAULT_MIN_LIMIT: u64 = 1;
/// Default additive increase per quiet interval.
pub const DEFAULT_INCREASE_STEP: u64 = 1;

/// The algorithm enforcing `current_limit` for each key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdaptiveBase {
    /// Bucket of `current_limit` tokens refilled at `current_limit` per second.
    TokenBucket,
    /// `current_limit` requests per window.
    FixedWindow {
        /// Window length
        window: Duration,
    },
}

/// Settings for an [`AdaptiveRateLimiter`].
#[derive(Debug, Clone)]
pub struct AdaptiveSettings {
    /// Limit every key starts at
    pub initial_limit: u64,
    /// Upper bound for increases
    pub max_limit: u64,
    /// Lower bound for decreases
    pub min_limit: u64,
    /// Amount added after an interval without rejections
    pub increase_step: u64,
    /// Time between health checks
    pub health_check_interval: Duration,
    /// Enforcement algorithm
    pub base: AdaptiveBase,
}

impl AdaptiveSettings {
    /// Settings with the default floor, step, interval and token-bucket base.
    pub fn new(initial_limit: u64, max_limit: u64) -> Self {
        Self {
            initial_limit,
            max_limit,
            min_limit: DEFAULT_MIN_LIMIT,
            increase_step: DEFAULT_INCREASE_STEP,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            base: AdaptiveBase::TokenBucket,
        }
    }

    pub fn with_min_limit(mut self, min_limit: u64) -> Self {
        self.min_limit = min_limit;
        self
    }

    pub fn with_increase_step(mut self, increase_step: u64) -> Self {
        self.increase_step = increase_step;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_base(mut self, base: AdaptiveBase) -> Self {
        self.base = base;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TurnstileError::InvalidArgument(msg));

        if self.initial_limit == 0 {
            return invalid("initial_limit must be greater than zero".to_string());
        }
        if self.min_limit == 0 {
            return invalid("min_limit must be greater than zero".to_string());
        }
        if self.min_limit > self.initial_limit {
            return invalid(format!(
                "min_limit ({}) must not exceed initial_limit ({})",
                self.min_limit, self.initial_limit
            ));
        }
        if self.max_limit < self.initial_limit {
            return invalid(format!(
                "max_limit ({}) must be at least initial_limit ({})",
                self.max_limit, self.initial_limit
            ));
        }
        if self.increase_step == 0 {
            return invalid("increase_step must be greater than zero".to_string());
        }
        if self.health_check_interval.is_zero() {
            return invalid("health_check_interval must be greater than zero".to_string());
        }
        if let AdaptiveBase::FixedWindow { window } = self.base {
            if window.is_zero() {
                return invalid("window must be greater than zero".to_string());
            }
        }
        Ok(())
    }
}

enum BaseState {
    TokenBucket(TokenBucketState),
    FixedWindow(FixedWindowState),
}

impl BaseState {
    fn new(base: AdaptiveBase, limit: u64, now: Instant) -> Self {
        match base {
            AdaptiveBase::TokenBucket => {
                BaseState::TokenBucket(TokenBucketState::new(limit, limit as f64, now))
            }
            AdaptiveBase::FixedWindow { window } => {
                BaseState::FixedWindow(FixedWindowState::new(limit, window, now))
            }
        }
    }

    fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        match self {
            BaseState::TokenBucket(bucket) => bucket.try_acquire(now),
            BaseState::FixedWindow(window) => window.try_acquire(now),
        }
    }

    fn set_limit(&mut self, limit: u64, now: Instant) {
        match self {
            BaseState::TokenBucket(bucket) => bucket.resize(limit, limit as f64, now),
            BaseState::FixedWindow(window) => window.set_limit(limit),
        }
    }
}

/// Per-key adaptive state.
pub struct AdaptiveState {
    current_limit: u64,
    throttle_events: u64,
    last_health_check: Instant,
    base: BaseState,
}

impl AdaptiveState {
    fn new(settings: &AdaptiveSettings, now: Instant) -> Self {
        Self {
            current_limit: settings.initial_limit,
            throttle_events: 0,
            last_health_check: now,
            base: BaseState::new(settings.base, settings.initial_limit, now),
        }
    }
}

/// Direction of one key's adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adjustment {
    Decreased,
    Increased,
    Unchanged,
}

/// Outcome counts of one health-check pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckSummary {
    /// Keys whose limit was halved
    pub decreased: usize,
    /// Keys whose limit was raised
    pub increased: usize,
    /// Keys left as they were
    pub unchanged: usize,
}

/// The AIMD policy, detached from the limiter so the background task can own
/// a copy.
#[derive(Debug, Clone, Copy)]
struct AimdPolicy {
    min_limit: u64,
    max_limit: u64,
    increase_step: u64,
}

impl AimdPolicy {
    fn from_settings(settings: &AdaptiveSettings) -> Self {
        Self {
            min_limit: settings.min_limit,
            max_limit: settings.max_limit,
            increase_step: settings.increase_step,
        }
    }

    fn next_limit(&self, current: u64, throttled: bool) -> u64 {
        if throttled {
            (current / 2).max(self.min_limit)
        } else {
            current.saturating_add(self.increase_step).min(self.max_limit)
        }
    }

    fn adjust_key(&self, state: &mut AdaptiveState, now: Instant) -> Adjustment {
        let previous = state.current_limit;
        let next = self.next_limit(previous, state.throttle_events > 0);

        state.throttle_events = 0;
        state.last_health_check = now;

        if next == previous {
            return Adjustment::Unchanged;
        }

        state.current_limit = next;
        state.base.set_limit(next, now);

        if next < previous {
            Adjustment::Decreased
        } else {
            Adjustment::Increased
        }
    }

    fn adjust_all(&self, states: &KeyedStore<AdaptiveState>, now: Instant) -> HealthCheckSummary {
        let mut summary = HealthCheckSummary::default();

        states.for_each_mut(|key, state| {
            let previous = state.current_limit;
            let throttle_events = state.throttle_events;

            match self.adjust_key(state, now) {
                Adjustment::Decreased => {
                    summary.decreased += 1;
                    debug!(
                        key = %key,
                        previous,
                        current = state.current_limit,
                        throttle_events,
                        "Decreased adaptive limit"
                    );
                }
                Adjustment::Increased => {
                    summary.increased += 1;
                    debug!(
                        key = %key,
                        previous,
                        current = state.current_limit,
                        "Increased adaptive limit"
                    );
                }
                Adjustment::Unchanged => summary.unchanged += 1,
            }
        });

        summary
    }
}

struct HealthCheckTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Adaptive limiter keyed by `(service, operation)`.
pub struct AdaptiveRateLimiter {
    settings: AdaptiveSettings,
    policy: AimdPolicy,
    states: Arc<KeyedStore<AdaptiveState>>,
    health_check: Mutex<Option<HealthCheckTask>>,
}

impl AdaptiveRateLimiter {
    /// Create a limiter starting at `initial_limit` and growing to at most
    /// `max_limit`, with default floor, step and interval.
    pub fn new(initial_limit: u64, max_limit: u64) -> Result<Self> {
        Self::with_settings(AdaptiveSettings::new(initial_limit, max_limit))
    }

    /// Create a limiter from explicit settings.
    pub fn with_settings(settings: AdaptiveSettings) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            policy: AimdPolicy::from_settings(&settings),
            settings,
            states: Arc::new(KeyedStore::new()),
            health_check: Mutex::new(None),
        })
    }

    /// Check the limit for `service_name.operation_name` as of `now`.
    ///
    /// A rejection is recorded as a throttle event for the key; the limit
    /// itself only moves during health checks.
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
                || AdaptiveState::new(&self.settings, now),
                |state| match state.base.try_acquire(now) {
                    Ok(()) => Ok(()),
                    Err(wait) => {
                        state.throttle_events += 1;
                        Err(wait)
                    }
                },
            )
            .map_err(|wait| {
                RateLimitError::rate_limited(service_name, operation_name, ceil_millis(wait))
            })
    }

    /// Run one health-check pass over every key now.
    pub fn run_health_check(&self) -> HealthCheckSummary {
        self.run_health_check_at(Instant::now())
    }

    /// Run one health-check pass over every key as of `now`.
    pub fn run_health_check_at(&self, now: Instant) -> HealthCheckSummary {
        self.policy.adjust_all(&self.states, now)
    }

    /// Start the periodic health check on the current Tokio runtime.
    ///
    /// Starting an already running limiter is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.health_check.lock();
        if slot.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TurnstileError::Runtime(format!("adaptive health check needs a Tokio runtime: {e}"))
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(run_health_checks(
            Arc::clone(&self.states),
            self.policy,
            self.settings.health_check_interval,
            shutdown_rx,
        ));

        info!(
            interval_ms = u64::try_from(self.settings.health_check_interval.as_millis())
                .unwrap_or(u64::MAX),
            min_limit = self.settings.min_limit,
            max_limit = self.settings.max_limit,
            "Adaptive health check started"
        );

        *slot = Some(HealthCheckTask { shutdown, handle });
        Ok(())
    }

    /// Stop the periodic health check and wait for it to finish.
    ///
    /// Once this returns no further adjustments happen. Stopping a limiter
    /// that is not running is a no-op.
    pub async fn stop(&self) {
        let task = self.health_check.lock().take();
        let Some(task) = task else {
            return;
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Adaptive health check task ended abnormally");
        }

        info!("Adaptive health check stopped");
    }

    /// Signal the periodic health check to stop without waiting for it.
    ///
    /// The task exits before its next pass. Use [`stop`](Self::stop) when the
    /// caller needs to know it has finished.
    pub fn halt(&self) {
        if let Some(task) = self.health_check.lock().take() {
            let _ = task.shutdown.send(true);
            info!("Adaptive health check halted");
        }
    }

    /// Whether the periodic health check is running.
    pub fn is_running(&self) -> bool {
        self.health_check.lock().is_some()
    }

    /// Get the current limit for a key.
    ///
    /// Returns `None` if the key has never been checked.
    pub fn current_limit(&self, service_name: &str, operation_name: &str) -> Option<u64> {
        self.states
            .inspect(service_name, operation_name, |state| state.current_limit)
    }

    /// Get the rejections recorded for a key since the last health check.
    pub fn throttle_events(&self, service_name: &str, operation_name: &str) -> Option<u64> {
        self.states
            .inspect(service_name, operation_name, |state| state.throttle_events)
    }

    /// When a key was last visited by a health check (or created).
    pub fn last_health_check(&self, service_name: &str, operation_name: &str) -> Option<Instant> {
        self.states
            .inspect(service_name, operation_name, |state| state.last_health_check)
    }

    /// Settings this limiter was built with.
    pub fn settings(&self) -> &AdaptiveSettings {
        &self.settings
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.states.len()
    }

    /// Clear all per-key state.
    pub fn clear(&self) {
        self.states.clear();
    }
}

impl RateLimiter for AdaptiveRateLimiter {
    fn check(&self, service_name: &str, operation_name: &str) -> std::result::Result<(), RateLimitError> {
        self.check_at(service_name, operation_name, Instant::now())
    }

    fn strategy(&self) -> &'static str {
        "adaptive"
    }
}

impl Drop for AdaptiveRateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.health_check.get_mut().take() {
            let _ = task.shutdown.send(true);
            task.handle.abort();
        }
    }
}

async fn run_health_checks(
    states: Arc<KeyedStore<AdaptiveState>>,
    policy: AimdPolicy,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                // Either a stop request or the limiter went away
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let summary = policy.adjust_all(&states, Instant::now());
                trace!(
                    decreased = summary.decreased,
                    increased = summary.increased,
                    unchanged = summary.unchanged,
                    "Adaptive health check pass"
                );
            }
        }
    }
}
