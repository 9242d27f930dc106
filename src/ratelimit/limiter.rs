//! Rate limiter trait shared by every admission strategy.

use std::sync::Arc;

use crate::error::RateLimitError;

/// Trait for rate limiter implementations.
///
/// `check` is a fast admit/reject decision: it never sleeps or waits on I/O.
/// `Ok(())` admits the call and records it against the
/// `service_name.operation_name` key; `Err` rejects it with a retry hint.
/// Implementations must be safe to call from many threads at once, and calls
/// on the same key must be linearizable.
pub trait RateLimiter: Send + Sync {
    /// Decide whether one unit of work for `service_name.operation_name` may
    /// proceed now.
    fn check(&self, service_name: &str, operation_name: &str) -> Result<(), RateLimitError>;

    /// Short strategy name used in logs.
    fn strategy(&self) -> &'static str;
}

impl<T: RateLimiter + ?Sized> RateLimiter for Arc<T> {
    fn check(&self, service_name: &str, operation_name: &str) -> Result<(), RateLimitError> {
        (**self).check(service_name, operation_name)
    }

    fn strategy(&self) -> &'static str {
        (**self).strategy()
    }
}

impl<T: RateLimiter + ?Sized> RateLimiter for Box<T> {
    fn check(&self, service_name: &str, operation_name: &str) -> Result<(), RateLimitError> {
        (**self).check(service_name, operation_name)
    }

    fn strategy(&self) -> &'static str {
        (**self).strategy()
    }
}
