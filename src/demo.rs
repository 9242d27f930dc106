//! Simulated multi-client workload driving a [`LimiterRegistry`].
//!
//! Each client repeatedly picks a service and an operation at random, runs a
//! [`GatedOperation`] against a [`SimulatedService`] and records how the call
//! ended. Rejections are ordinary outcomes here, so they are counted but not
//! logged above debug level.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::DemoConfig;
use crate::error::{RateLimitError, RejectionKind, Result, TurnstileError};
use crate::operation::{GatedOperation, Interrupt, RateLimitOperation};
use crate::ratelimit::{LimiterRegistry, RateLimiter};

/// Error code used when a simulated service throttles on its own.
pub const DOWNSTREAM_THROTTLE_CODE: &str = "ThrottlingException";

/// Retry hint attached to simulated downstream errors.
const DOWNSTREAM_RETRY_MS: u64 = 100;

/// How a single request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Throttled,
    Failed,
}

impl Outcome {
    /// Classify a request result.
    ///
    /// Local and downstream throttling both count as throttled.
    pub fn of<T>(result: &std::result::Result<T, RateLimitError>) -> Self {
        match result {
            Ok(_) => Outcome::Allowed,
            Err(err) => match err.kind() {
                RejectionKind::RateLimited | RejectionKind::Throttled => Outcome::Throttled,
                RejectionKind::ServiceUnavailable => Outcome::Failed,
            },
        }
    }
}

/// Running request counters shared by all clients.
#[derive(Debug, Default)]
pub struct RequestStats {
    successful: AtomicU64,
    throttled: AtomicU64,
    failed: AtomicU64,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Allowed => &self.successful,
            Outcome::Throttled => &self.throttled,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            successful: self.successful.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RequestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub successful: u64,
    pub throttled: u64,
    pub failed: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.successful + self.throttled + self.failed
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {} | Successful: {} | Throttled: {} | Failed: {}",
            self.total(),
            self.successful,
            self.throttled,
            self.failed
        )
    }
}

/// Stand-in for a remote service that can fail or throttle on its own.
#[derive(Debug, Clone)]
pub struct SimulatedService {
    name: String,
    failure_rate: f64,
    throttle_rate: f64,
}

impl SimulatedService {
    pub fn new(name: &str, failure_rate: f64, throttle_rate: f64) -> Self {
        Self {
            name: name.to_string(),
            failure_rate,
            throttle_rate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve one call after `latency`.
    ///
    /// `roll` is a uniform sample in `[0, 1)` deciding the result: below the
    /// failure rate the call fails, in the following throttle band it is
    /// throttled, and otherwise it succeeds.
    pub async fn call(
        &self,
        operation: &str,
        roll: f64,
        latency: Duration,
    ) -> std::result::Result<(), RateLimitError> {
        if !latency.is_zero() {
            sleep(latency).await;
        }

        if roll < self.failure_rate {
            Err(RateLimitError::service_unavailable(
                &self.name,
                "simulated failure",
                DOWNSTREAM_RETRY_MS,
            ))
        } else if roll < self.failure_rate + self.throttle_rate {
            Err(RateLimitError::throttled(
                &self.name,
                operation,
                DOWNSTREAM_THROTTLE_CODE,
                DOWNSTREAM_RETRY_MS,
            ))
        } else {
            Ok(())
        }
    }
}

/// A workload of concurrent clients sharing one registry.
pub struct Simulation {
    registry: Arc<LimiterRegistry>,
    services: Vec<Arc<SimulatedService>>,
    settings: Arc<DemoConfig>,
    stats: Arc<RequestStats>,
}

impl Simulation {
    /// Simulate one service per registry entry.
    pub fn new(registry: Arc<LimiterRegistry>, settings: DemoConfig) -> Self {
        let services = registry
            .services()
            .into_iter()
            .map(|name| {
                Arc::new(SimulatedService::new(
                    name,
                    settings.failure_rate,
                    settings.downstream_throttle_rate,
                ))
            })
            .collect();

        Self {
            registry,
            services,
            settings: Arc::new(settings),
            stats: Arc::new(RequestStats::new()),
        }
    }

    /// Current totals.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until `duration` elapses or `shutdown` resolves, whichever is first.
    ///
    /// Adaptive health checks run for the lifetime of the simulation. All
    /// clients are interrupted and joined before the final totals are taken.
    pub async fn run<S>(&self, duration: Duration, shutdown: S) -> Result<StatsSnapshot>
    where
        S: Future<Output = ()>,
    {
        if self.services.is_empty() {
            return Err(TurnstileError::Config("no services to simulate".to_string()));
        }
        if self.settings.operations.is_empty() {
            return Err(TurnstileError::Config("no operations to simulate".to_string()));
        }

        self.registry.start_health_checks()?;

        info!(
            clients = self.settings.clients,
            services = self.services.len(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Starting simulation"
        );

        let (handle, interrupt) = Interrupt::pair();
        let clients: Vec<JoinHandle<()>> = (1..=self.settings.clients)
            .map(|client_id| {
                let client = Client {
                    id: client_id,
                    registry: Arc::clone(&self.registry),
                    services: self.services.clone(),
                    settings: Arc::clone(&self.settings),
                    stats: Arc::clone(&self.stats),
                    interrupt: interrupt.clone(),
                };
                tokio::spawn(client.run())
            })
            .collect();

        let every = Duration::from_secs(self.settings.stats_interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + every, every);
        let deadline = sleep(duration);
        tokio::pin!(deadline);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("Simulation duration elapsed");
                    break;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping clients");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = self.stats.snapshot();
                    info!(
                        total = snapshot.total(),
                        successful = snapshot.successful,
                        throttled = snapshot.throttled,
                        failed = snapshot.failed,
                        "Current statistics"
                    );
                }
            }
        }

        handle.interrupt();
        for result in join_all(clients).await {
            if let Err(e) = result {
                warn!(error = %e, "Client task ended abnormally");
            }
        }

        self.registry.stop_health_checks().await;

        let snapshot = self.stats.snapshot();
        info!(total = snapshot.total(), "Simulation finished");
        Ok(snapshot)
    }
}

/// One simulated caller.
struct Client {
    id: usize,
    registry: Arc<LimiterRegistry>,
    services: Vec<Arc<SimulatedService>>,
    settings: Arc<DemoConfig>,
    stats: Arc<RequestStats>,
    interrupt: Interrupt,
}

impl Client {
    async fn run(self) {
        let mut rng = StdRng::from_entropy();
        debug!(client = self.id, "Client started");

        while !self.interrupt.is_interrupted() {
            let (Some(service), Some(operation)) = (
                self.services.choose(&mut rng),
                self.settings.operations.choose(&mut rng),
            ) else {
                break;
            };

            let roll: f64 = rng.gen();
            let latency = Duration::from_millis(rng.gen_range(1..=5));
            let result = self.request(Arc::clone(service), operation, roll, latency).await;

            // Work abandoned during shutdown is not a service failure
            if self.interrupt.is_interrupted() && result.is_err() {
                break;
            }
            self.stats.record(Outcome::of(&result));

            let think = Duration::from_millis(
                rng.gen_range(self.settings.min_think_ms..=self.settings.max_think_ms),
            );
            tokio::select! {
                _ = self.interrupt.interrupted() => break,
                _ = sleep(think) => {}
            }
        }

        debug!(client = self.id, "Client stopped");
    }

    #[instrument(skip(self, service, roll, latency), fields(client = self.id, service = %service.name()))]
    async fn request(
        &self,
        service: Arc<SimulatedService>,
        operation: &str,
        roll: f64,
        latency: Duration,
    ) -> std::result::Result<(), RateLimitError> {
        let limiter: Arc<dyn RateLimiter> = self.registry.clone();
        let target = Arc::clone(&service);
        let op_name = operation.to_string();

        let op = GatedOperation::new(limiter, service.name(), operation, move || {
            let target = Arc::clone(&target);
            let op_name = op_name.clone();
            async move { target.call(&op_name, roll, latency).await }
        })
        .with_interrupt(self.interrupt.clone());

        let result = op.execute().await;
        match &result {
            Ok(()) => debug!("Request allowed"),
            Err(e) => debug!(kind = ?e.kind(), retry_after_ms = e.retry_after_ms(), "Request rejected"),
        }
        result
    }
}
