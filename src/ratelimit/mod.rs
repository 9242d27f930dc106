//! Rate limiting strategies and per-key state management.

mod adaptive;
mod fixed_window;
mod key;
mod limiter;
mod registry;
mod store;
mod time;
mod token_bucket;

pub use adaptive::{
    AdaptiveBase, AdaptiveRateLimiter, AdaptiveSettings, AdaptiveState, HealthCheckSummary,
    DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_INCREASE_STEP, DEFAULT_MIN_LIMIT,
};
pub use fixed_window::{FixedWindowRateLimiter, FixedWindowState};
pub use key::ResourceKey;
pub use limiter::RateLimiter;
pub use registry::LimiterRegistry;
pub use store::KeyedStore;
pub use token_bucket::{TokenBucketRateLimiter, TokenBucketState};
