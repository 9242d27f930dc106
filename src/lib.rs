//! Turnstile - In-Process Rate Limiting and Admission Control
//!
//! This crate gates calls to downstream services behind per-key rate
//! limiters. It provides fixed-window, token-bucket and adaptive (AIMD)
//! strategies, a registry mapping services to limiters, and an operation
//! wrapper that checks admission before running work.

pub mod config;
pub mod demo;
pub mod error;
pub mod operation;
pub mod ratelimit;

pub use error::{RateLimitError, RejectionKind, Result, TurnstileError};
pub use operation::{GatedOperation, Interrupt, InterruptHandle, RateLimitOperation};
pub use ratelimit::{
    AdaptiveRateLimiter, FixedWindowRateLimiter, LimiterRegistry, RateLimiter,
    TokenBucketRateLimiter,
};
