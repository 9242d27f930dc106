//! Error types for Turnstile.
//!
//! Two families live here. [`TurnstileError`] covers misconfiguration and
//! I/O, and is returned from constructors and configuration loading.
//! [`RateLimitError`] is the rejection taxonomy handed back from the hot
//! path: every refused unit of work reaches the caller as one of its variants.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile setup and configuration.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was constructed with parameters it cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Background work could not be scheduled
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile setup operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Discriminant of a [`RateLimitError`], for callers that only need to bucket
/// outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// The local limiter refused the call.
    RateLimited,
    /// The downstream service reported it is throttling.
    Throttled,
    /// The downstream service could not be reached, or the wait was interrupted.
    ServiceUnavailable,
}

/// A rejected unit of work.
///
/// Each variant carries a best-effort `retry_after_ms` hint. The engine never
/// retries on its own; callers decide whether and when to try again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The calling key exceeded its currently configured limit.
    #[error("Rate limit exceeded for {service_name}.{operation_name}, retry after {retry_after_ms}ms")]
    RateLimited {
        service_name: String,
        operation_name: String,
        retry_after_ms: u64,
    },

    /// The downstream service itself is throttling the caller.
    #[error("{service_name}.{operation_name} throttled by service ({error_code}), retry after {retry_after_ms}ms")]
    Throttled {
        service_name: String,
        operation_name: String,
        error_code: String,
        retry_after_ms: u64,
    },

    /// The downstream service is unreachable, or waiting on it was interrupted.
    #[error("Service {service_name} unavailable: {reason}, retry after {retry_after_ms}ms")]
    ServiceUnavailable {
        service_name: String,
        reason: String,
        retry_after_ms: u64,
    },
}

impl RateLimitError {
    /// Build a local rejection for `service.operation`.
    pub fn rate_limited(service_name: &str, operation_name: &str, retry_after_ms: u64) -> Self {
        RateLimitError::RateLimited {
            service_name: service_name.to_string(),
            operation_name: operation_name.to_string(),
            retry_after_ms,
        }
    }

    /// Build a downstream throttling rejection.
    pub fn throttled(
        service_name: &str,
        operation_name: &str,
        error_code: &str,
        retry_after_ms: u64,
    ) -> Self {
        RateLimitError::Throttled {
            service_name: service_name.to_string(),
            operation_name: operation_name.to_string(),
            error_code: error_code.to_string(),
            retry_after_ms,
        }
    }

    /// Build an unavailability failure for `service_name`.
    pub fn service_unavailable(service_name: &str, reason: &str, retry_after_ms: u64) -> Self {
        RateLimitError::ServiceUnavailable {
            service_name: service_name.to_string(),
            reason: reason.to_string(),
            retry_after_ms,
        }
    }

    /// The kind of rejection.
    pub fn kind(&self) -> RejectionKind {
        match self {
            RateLimitError::RateLimited { .. } => RejectionKind::RateLimited,
            RateLimitError::Throttled { .. } => RejectionKind::Throttled,
            RateLimitError::ServiceUnavailable { .. } => RejectionKind::ServiceUnavailable,
        }
    }

    /// Milliseconds the caller should wait before retrying.
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            RateLimitError::RateLimited { retry_after_ms, .. }
            | RateLimitError::Throttled { retry_after_ms, .. }
            | RateLimitError::ServiceUnavailable { retry_after_ms, .. } => *retry_after_ms,
        }
    }

    /// The retry hint as a [`Duration`].
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms())
    }

    /// The service the rejection refers to.
    pub fn service_name(&self) -> &str {
        match self {
            RateLimitError::RateLimited { service_name, .. }
            | RateLimitError::Throttled { service_name, .. }
            | RateLimitError::ServiceUnavailable { service_name, .. } => service_name,
        }
    }

    /// The operation the rejection refers to, when known.
    pub fn operation_name(&self) -> Option<&str> {
        match self {
            RateLimitError::RateLimited { operation_name, .. }
            | RateLimitError::Throttled { operation_name, .. } => Some(operation_name),
            RateLimitError::ServiceUnavailable { .. } => None,
        }
    }

    /// The downstream error code, for [`RateLimitError::Throttled`] only.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            RateLimitError::Throttled { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    /// Human-readable description.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_accessors() {
        let err = RateLimitError::rate_limited("s3", "GetObject", 250);

        assert_eq!(err.kind(), RejectionKind::RateLimited);
        assert_eq!(err.retry_after_ms(), 250);
        assert_eq!(err.retry_after(), Duration::from_millis(250));
        assert_eq!(err.service_name(), "s3");
        assert_eq!(err.operation_name(), Some("GetObject"));
        assert_eq!(err.error_code(), None);
        assert_eq!(
            err.message(),
            "Rate limit exceeded for s3.GetObject, retry after 250ms"
        );
    }

    #[test]
    fn test_throttled_carries_error_code() {
        let err = RateLimitError::throttled("dynamodb", "Query", "ProvisionedThroughputExceeded", 100);

        assert_eq!(err.kind(), RejectionKind::Throttled);
        assert_eq!(err.operation_name(), Some("Query"));
        assert_eq!(err.error_code(), Some("ProvisionedThroughputExceeded"));
    }

    #[test]
    fn test_service_unavailable_has_no_operation() {
        let err = RateLimitError::service_unavailable("lambda", "connection reset", 1000);

        assert_eq!(err.kind(), RejectionKind::ServiceUnavailable);
        assert_eq!(err.service_name(), "lambda");
        assert_eq!(err.operation_name(), None);
        assert!(err.message().contains("connection reset"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: TurnstileError = config::ConfigError::Message("bad value".to_string()).into();
        assert!(matches!(err, TurnstileError::Config(ref msg) if msg.contains("bad value")));
    }
}
