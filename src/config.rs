//! Configuration management for Turnstile.
//!
//! A configuration names the limiter guarding each service and tunes the
//! traffic simulation. It can be read from a file (any format the `config`
//! crate understands, with `TURNSTILE__*` environment overrides) or parsed
//! directly from YAML.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{AdaptiveBase, AdaptiveSettings};

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter per service name
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, LimiterConfig>,

    /// Traffic simulation settings
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            demo: DemoConfig::default(),
        }
    }
}

/// Strategy and parameters of one service's limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LimiterConfig {
    /// `limit` requests per `window_seconds`
    FixedWindow {
        limit: u64,
        #[serde(default = "default_window_seconds")]
        window_seconds: f64,
    },

    /// Bursts of up to `capacity`, refilled at `refill_rate_per_second`
    TokenBucket {
        capacity: u64,
        refill_rate_per_second: f64,
    },

    /// AIMD-adjusted limit between `min_limit` and `max_limit`
    Adaptive {
        initial_limit: u64,
        max_limit: u64,
        #[serde(default = "default_min_limit")]
        min_limit: u64,
        #[serde(default = "default_increase_step")]
        increase_step: u64,
        #[serde(default = "default_health_check_interval_ms")]
        health_check_interval_ms: u64,
        #[serde(default)]
        base: AdaptiveBaseKind,
        /// Only used with the fixed-window base
        #[serde(default = "default_window_seconds")]
        window_seconds: f64,
    },
}

/// Which algorithm an adaptive limiter runs underneath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveBaseKind {
    #[default]
    TokenBucket,
    FixedWindow,
}

impl LimiterConfig {
    /// Strategy name as written in configuration.
    pub fn strategy(&self) -> &'static str {
        match self {
            LimiterConfig::FixedWindow { .. } => "fixed_window",
            LimiterConfig::TokenBucket { .. } => "token_bucket",
            LimiterConfig::Adaptive { .. } => "adaptive",
        }
    }

    /// Adaptive settings, for the adaptive strategy only.
    pub fn adaptive_settings(&self) -> Option<Result<AdaptiveSettings>> {
        let LimiterConfig::Adaptive {
            initial_limit,
            max_limit,
            min_limit,
            increase_step,
            health_check_interval_ms,
            base,
            window_seconds,
        } = self
        else {
            return None;
        };

        let base = match base {
            AdaptiveBaseKind::TokenBucket => Ok(AdaptiveBase::TokenBucket),
            AdaptiveBaseKind::FixedWindow => Duration::try_from_secs_f64(*window_seconds)
                .map(|window| AdaptiveBase::FixedWindow { window })
                .map_err(|e| TurnstileError::Config(format!("window_seconds: {e}"))),
        };

        Some(base.map(|base| {
            AdaptiveSettings::new(*initial_limit, *max_limit)
                .with_min_limit(*min_limit)
                .with_increase_step(*increase_step)
                .with_health_check_interval(Duration::from_millis(*health_check_interval_ms))
                .with_base(base)
        }))
    }
}

/// Traffic simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of concurrent simulated clients
    #[serde(default = "default_clients")]
    pub clients: usize,

    /// How long the simulation runs
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// How often running statistics are printed
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Operation names clients pick from
    #[serde(default = "default_operations")]
    pub operations: Vec<String>,

    /// Probability that an admitted call fails as unavailable
    #[serde(default)]
    pub failure_rate: f64,

    /// Probability that an admitted call is throttled by the service itself
    #[serde(default)]
    pub downstream_throttle_rate: f64,

    /// Shortest pause between a client's calls
    #[serde(default = "default_min_think_ms")]
    pub min_think_ms: u64,

    /// Longest pause between a client's calls
    #[serde(default = "default_max_think_ms")]
    pub max_think_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            duration_secs: default_duration_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            operations: default_operations(),
            failure_rate: 0.0,
            downstream_throttle_rate: 0.0,
            min_think_ms: default_min_think_ms(),
            max_think_ms: default_max_think_ms(),
        }
    }
}

fn default_services() -> BTreeMap<String, LimiterConfig> {
    BTreeMap::from([
        (
            "s3".to_string(),
            LimiterConfig::TokenBucket {
                capacity: 2,
                refill_rate_per_second: 1.0,
            },
        ),
        (
            "dynamodb".to_string(),
            LimiterConfig::FixedWindow {
                limit: 3,
                window_seconds: 1.0,
            },
        ),
        (
            "lambda".to_string(),
            LimiterConfig::Adaptive {
                initial_limit: 2,
                max_limit: 6,
                min_limit: default_min_limit(),
                increase_step: default_increase_step(),
                health_check_interval_ms: default_health_check_interval_ms(),
                base: AdaptiveBaseKind::TokenBucket,
                window_seconds: default_window_seconds(),
            },
        ),
    ])
}

fn default_window_seconds() -> f64 {
    1.0
}

fn default_min_limit() -> u64 {
    1
}

fn default_increase_step() -> u64 {
    1
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_clients() -> usize {
    3
}

fn default_duration_secs() -> u64 {
    10
}

fn default_stats_interval_secs() -> u64 {
    2
}

fn default_operations() -> Vec<String> {
    [
        "GetObject",
        "PutObject",
        "Query",
        "Scan",
        "PutItem",
        "Invoke",
        "ListFunctions",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_min_think_ms() -> u64 {
    30
}

fn default_max_think_ms() -> u64 {
    80
}

impl TurnstileConfig {
    /// Load configuration from a file, with `TURNSTILE__*` environment
    /// overrides (e.g. `TURNSTILE__DEMO__CLIENTS=8`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: TurnstileConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that are not validated by limiter constructors.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(TurnstileError::Config("at least one service is required".to_string()));
        }

        let demo = &self.demo;
        if demo.clients == 0 {
            return Err(TurnstileError::Config("demo.clients must be at least 1".to_string()));
        }
        if demo.stats_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "demo.stats_interval_secs must be at least 1".to_string(),
            ));
        }
        if demo.operations.is_empty() {
            return Err(TurnstileError::Config("demo.operations must not be empty".to_string()));
        }
        if demo.min_think_ms > demo.max_think_ms {
            return Err(TurnstileError::Config(format!(
                "demo.min_think_ms ({}) exceeds demo.max_think_ms ({})",
                demo.min_think_ms, demo.max_think_ms
            )));
        }
        for (name, rate) in [
            ("failure_rate", demo.failure_rate),
            ("downstream_throttle_rate", demo.downstream_throttle_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(TurnstileError::Config(format!(
                    "demo.{name} must be between 0 and 1, got {rate}"
                )));
            }
        }
        if demo.failure_rate + demo.downstream_throttle_rate > 1.0 {
            return Err(TurnstileError::Config(
                "demo.failure_rate + demo.downstream_throttle_rate must not exceed 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_matches_demo_services() {
        let config = TurnstileConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.services.len(), 3);
        assert_eq!(config.services["s3"].strategy(), "token_bucket");
        assert_eq!(config.services["dynamodb"].strategy(), "fixed_window");
        assert_eq!(config.services["lambda"].strategy(), "adaptive");
        assert_eq!(config.demo.clients, 3);
        assert_eq!(config.demo.operations.len(), 7);
    }

    #[test]
    fn test_parse_yaml_services() {
        let yaml = r#"
services:
  payments:
    strategy: token_bucket
    capacity: 10
    refill_rate_per_second: 5
  search:
    strategy: fixed_window
    limit: 100
  inference:
    strategy: adaptive
    initial_limit: 10
    max_limit: 20
    health_check_interval_ms: 500
    base: fixed_window
    window_seconds: 2
demo:
  clients: 8
  duration_secs: 5
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(
            config.services["payments"],
            LimiterConfig::TokenBucket {
                capacity: 10,
                refill_rate_per_second: 5.0
            }
        );
        assert_eq!(
            config.services["search"],
            LimiterConfig::FixedWindow {
                limit: 100,
                window_seconds: 1.0
            }
        );

        let settings = config.services["inference"].adaptive_settings().unwrap().unwrap();
        assert_eq!(settings.initial_limit, 10);
        assert_eq!(settings.max_limit, 20);
        assert_eq!(settings.min_limit, 1);
        assert_eq!(settings.increase_step, 1);
        assert_eq!(settings.health_check_interval, Duration::from_millis(500));
        assert_eq!(
            settings.base,
            AdaptiveBase::FixedWindow {
                window: Duration::from_secs(2)
            }
        );

        assert_eq!(config.demo.clients, 8);
        assert_eq!(config.demo.duration_secs, 5);
        assert_eq!(config.demo.stats_interval_secs, 2);
    }

    #[test]
    fn test_adaptive_settings_only_for_adaptive() {
        let config = LimiterConfig::FixedWindow {
            limit: 1,
            window_seconds: 1.0,
        };
        assert!(config.adaptive_settings().is_none());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = r#"
services:
  s3:
    strategy: leaky_bucket
    capacity: 1
"#;
        let result = TurnstileConfig::from_yaml(yaml);
        assert!(matches!(result, Err(TurnstileError::Yaml(_))));
    }

    #[test]
    fn test_validate_demo_settings() {
        let mut config = TurnstileConfig::default();
        config.demo.clients = 0;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.demo.min_think_ms = 100;
        config.demo.max_think_ms = 10;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.demo.failure_rate = 0.7;
        config.demo.downstream_throttle_rate = 0.7;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.services.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-config-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "services:\n  s3:\n    strategy: fixed_window\n    limit: 7\n    window_seconds: 0.5\ndemo:\n  clients: 2"
        )
        .unwrap();

        let config = TurnstileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            config.services["s3"],
            LimiterConfig::FixedWindow {
                limit: 7,
                window_seconds: 0.5
            }
        );
        assert_eq!(config.demo.clients, 2);
    }
}
