//! Units of work gated by a rate limiter.
//!
//! A [`GatedOperation`] asks its limiter for admission and only then runs the
//! wrapped work. Rejections from the limiter are returned untouched. If the
//! caller is interrupted while the admitted work is still pending, the work
//! is abandoned and reported as [`RateLimitError::ServiceUnavailable`] for the
//! downstream service. That is a different condition from being throttled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::error::RateLimitError;
use crate::ratelimit::RateLimiter;

/// Retry hint attached to interruption failures unless overridden.
pub const DEFAULT_INTERRUPTED_RETRY_AFTER: Duration = Duration::from_millis(1000);

/// A unit of work identified by a service and operation name.
#[async_trait]
pub trait RateLimitOperation: Send + Sync {
    /// Value produced by the work.
    type Output: Send;

    /// The downstream service this operation calls.
    fn service_name(&self) -> &str;

    /// The operation invoked on the service.
    fn operation_name(&self) -> &str;

    /// Check the limiter, then run the work.
    async fn execute(&self) -> Result<Self::Output, RateLimitError>;
}

/// Sending side of an [`Interrupt`].
#[derive(Debug)]
pub struct InterruptHandle {
    tx: watch::Sender<bool>,
}

impl InterruptHandle {
    /// Raise the interrupt. It stays raised.
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }
}

/// Level-triggered interruption signal.
///
/// Observing the interrupt does not clear it, so every later check sees the
/// caller as still interrupted.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    /// Create a linked handle and signal.
    pub fn pair() -> (InterruptHandle, Interrupt) {
        let (tx, rx) = watch::channel(false);
        (InterruptHandle { tx }, Interrupt { rx })
    }

    /// Whether the interrupt has been raised.
    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the interrupt is raised. Never resolves if the handle is
    /// dropped without raising it.
    pub async fn interrupted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Rate-limited work built from an async closure.
pub struct GatedOperation<F> {
    limiter: Arc<dyn RateLimiter>,
    service_name: String,
    operation_name: String,
    work: F,
    interrupt: Option<Interrupt>,
    interrupted_retry_after: Duration,
}

impl<F> GatedOperation<F> {
    /// Gate `work` behind `limiter` under `service_name.operation_name`.
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        service_name: &str,
        operation_name: &str,
        work: F,
    ) -> Self {
        Self {
            limiter,
            service_name: service_name.to_string(),
            operation_name: operation_name.to_string(),
            work,
            interrupt: None,
            interrupted_retry_after: DEFAULT_INTERRUPTED_RETRY_AFTER,
        }
    }

    /// Abandon the work if `interrupt` is raised while it is pending.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Retry hint for interruption failures.
    pub fn with_interrupted_retry_after(mut self, retry_after: Duration) -> Self {
        self.interrupted_retry_after = retry_after;
        self
    }

    fn interrupted_error(&self) -> RateLimitError {
        RateLimitError::service_unavailable(
            &self.service_name,
            &format!("interrupted while awaiting {}", self.operation_name),
            u64::try_from(self.interrupted_retry_after.as_millis()).unwrap_or(u64::MAX),
        )
    }
}

#[async_trait]
impl<F, Fut, T> RateLimitOperation for GatedOperation<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, RateLimitError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn operation_name(&self) -> &str {
        &self.operation_name
    }

    async fn execute(&self) -> Result<T, RateLimitError> {
        self.limiter.check(&self.service_name, &self.operation_name)?;

        let Some(interrupt) = &self.interrupt else {
            return (self.work)().await;
        };

        tokio::select! {
            biased;

            _ = interrupt.interrupted() => {
                debug!(
                    service = %self.service_name,
                    operation = %self.operation_name,
                    "Admitted work interrupted"
                );
                Err(self.interrupted_error())
            }
            result = (self.work)() => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionKind;
    use crate::ratelimit::FixedWindowRateLimiter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn limiter(limit: u64) -> Arc<dyn RateLimiter> {
        Arc::new(FixedWindowRateLimiter::new(limit, 60.0).unwrap())
    }

    #[tokio::test]
    async fn test_admitted_work_returns_result() {
        let op = GatedOperation::new(limiter(1), "s3", "GetObject", || async {
            Ok::<_, RateLimitError>("object-bytes")
        });

        assert_eq!(op.service_name(), "s3");
        assert_eq!(op.operation_name(), "GetObject");
        assert_eq!(assert_ok!(op.execute().await), "object-bytes");
    }

    #[tokio::test]
    async fn test_rejection_propagates_without_running_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let op = GatedOperation::new(limiter(1), "s3", "GetObject", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RateLimitError>(())
            }
        });

        assert_ok!(op.execute().await);
        let err = assert_err!(op.execute().await);

        assert_eq!(err.kind(), RejectionKind::RateLimited);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_downstream_errors_pass_through() {
        let op = GatedOperation::new(limiter(5), "dynamodb", "Query", || async {
            Err::<(), _>(RateLimitError::throttled(
                "dynamodb",
                "Query",
                "ProvisionedThroughputExceeded",
                50,
            ))
        });

        let err = op.execute().await.unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Throttled);
        assert_eq!(err.error_code(), Some("ProvisionedThroughputExceeded"));
    }

    #[tokio::test]
    async fn test_interrupt_during_work_is_service_unavailable() {
        let (handle, interrupt) = Interrupt::pair();
        let op = GatedOperation::new(limiter(5), "lambda", "Invoke", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, RateLimitError>(())
        })
        .with_interrupt(interrupt.clone())
        .with_interrupted_retry_after(Duration::from_millis(250));

        let (result, _) = tokio::join!(op.execute(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.interrupt();
        });

        let err = result.unwrap_err();
        assert_eq!(err.kind(), RejectionKind::ServiceUnavailable);
        assert_eq!(err.service_name(), "lambda");
        assert_eq!(err.retry_after_ms(), 250);

        // Interrupted status is preserved
        assert!(interrupt.is_interrupted());
    }

    #[tokio::test]
    async fn test_oversized_retry_hint_saturates() {
        let (handle, interrupt) = Interrupt::pair();
        handle.interrupt();

        let op = GatedOperation::new(limiter(5), "lambda", "Invoke", || async {
            Ok::<_, RateLimitError>(())
        })
        .with_interrupt(interrupt)
        .with_interrupted_retry_after(Duration::MAX);

        let err = assert_err!(op.execute().await);
        assert_eq!(err.retry_after_ms(), u64::MAX);
    }

    #[tokio::test]
    async fn test_already_interrupted_caller_fails_fast() {
        let (handle, interrupt) = Interrupt::pair();
        handle.interrupt();

        let op = GatedOperation::new(limiter(5), "lambda", "Invoke", || async {
            Ok::<_, RateLimitError>(42)
        })
        .with_interrupt(interrupt);

        let err = op.execute().await.unwrap_err();
        assert_eq!(err.kind(), RejectionKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_dropped_handle_never_interrupts() {
        let (handle, interrupt) = Interrupt::pair();
        drop(handle);

        let op = GatedOperation::new(limiter(5), "lambda", "Invoke", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, RateLimitError>(7)
        })
        .with_interrupt(interrupt);

        assert_eq!(op.execute().await.unwrap(), 7);
    }
}
