//! Explicit service-to-limiter registry.
//!
//! Built once at startup and passed by reference to whatever issues calls,
//! so there is no process-wide lookup table and tests get fresh instances.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{LimiterConfig, TurnstileConfig};
use crate::error::{RateLimitError, Result, TurnstileError};

use super::adaptive::AdaptiveRateLimiter;
use super::fixed_window::FixedWindowRateLimiter;
use super::limiter::RateLimiter;
use super::token_bucket::TokenBucketRateLimiter;

/// Retry hint returned for services with no registered limiter.
const UNKNOWN_SERVICE_RETRY_MS: u64 = 1000;

/// Maps service names to the limiter guarding them.
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<dyn RateLimiter>>,
    /// Adaptive limiters by service, kept separately so their health checks
    /// can be started and stopped together
    adaptive: HashMap<String, Arc<AdaptiveRateLimiter>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every limiter named in `config`.
    ///
    /// Any invalid limiter parameters fail the whole build.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let mut registry = Self::new();

        for (service, limiter_config) in &config.services {
            match limiter_config {
                LimiterConfig::FixedWindow {
                    limit,
                    window_seconds,
                } => {
                    let limiter = FixedWindowRateLimiter::new(*limit, *window_seconds)?;
                    registry.register(service, Arc::new(limiter));
                }
                LimiterConfig::TokenBucket {
                    capacity,
                    refill_rate_per_second,
                } => {
                    let limiter = TokenBucketRateLimiter::new(*capacity, *refill_rate_per_second)?;
                    registry.register(service, Arc::new(limiter));
                }
                LimiterConfig::Adaptive { .. } => {
                    let settings = limiter_config.adaptive_settings().ok_or_else(|| {
                        TurnstileError::Config(format!("{service}: missing adaptive settings"))
                    })??;
                    let limiter = AdaptiveRateLimiter::with_settings(settings)?;
                    registry.register_adaptive(service, Arc::new(limiter));
                }
            }

            debug!(
                service = %service,
                strategy = limiter_config.strategy(),
                "Registered rate limiter"
            );
        }

        Ok(registry)
    }

    /// Register (or replace) the limiter for `service`.
    ///
    /// A replaced adaptive limiter is no longer part of the health checks.
    pub fn register(&mut self, service: &str, limiter: Arc<dyn RateLimiter>) {
        self.adaptive.remove(service);
        self.limiters.insert(service.to_string(), limiter);
    }

    /// Register (or replace) an adaptive limiter for `service`, tracking its
    /// health check.
    pub fn register_adaptive(&mut self, service: &str, limiter: Arc<AdaptiveRateLimiter>) {
        self.adaptive.insert(service.to_string(), Arc::clone(&limiter));
        self.limiters.insert(service.to_string(), limiter);
    }

    /// Get the limiter for `service`.
    pub fn get(&self, service: &str) -> Option<Arc<dyn RateLimiter>> {
        self.limiters.get(service).cloned()
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut services: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        services.sort_unstable();
        services
    }

    /// Get the number of registered services.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Start the health check of every adaptive limiter.
    ///
    /// Either all of them are running afterwards or, on error, none are.
    pub fn start_health_checks(&self) -> Result<()> {
        for (service, limiter) in &self.adaptive {
            if let Err(e) = limiter.start() {
                warn!(service = %service, error = %e, "Failed to start adaptive health check");
                self.adaptive.values().for_each(|limiter| limiter.halt());
                return Err(e);
            }
        }
        info!(count = self.adaptive.len(), "Adaptive health checks running");
        Ok(())
    }

    /// Stop every adaptive health check and wait for all of them.
    pub async fn stop_health_checks(&self) {
        join_all(self.adaptive.values().map(|limiter| limiter.stop())).await;
    }
}

impl RateLimiter for LimiterRegistry {
    /// Route to the limiter registered for `service_name`.
    ///
    /// An unknown service cannot be reached, so it is reported as
    /// unavailable rather than admitted.
    fn check(&self, service_name: &str, operation_name: &str) -> std::result::Result<(), RateLimitError> {
        match self.limiters.get(service_name) {
            Some(limiter) => limiter.check(service_name, operation_name),
            None => Err(RateLimitError::service_unavailable(
                service_name,
                "no rate limiter registered",
                UNKNOWN_SERVICE_RETRY_MS,
            )),
        }
    }

    fn strategy(&self) -> &'static str {
        "registry"
    }
}
