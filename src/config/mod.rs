//! Engine configuration.
//!
//! Values resolve from (lowest to highest priority): built-in defaults,
//! builder overrides, then `CREDIT_ENGINE_*` environment variables applied
//! by [`EngineConfigBuilder::from_env`]. Environment variables are read
//! once at build time; they are treated as immutable at runtime.

use std::time::Duration;

/// Bounded retry for transfers that hit a write conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Tunable knobs of the credit engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineConfig {
    /// Fraction of a member allocation below which a deduction triggers
    /// low-balance notices. Edge-triggered on the crossing only.
    pub low_balance_threshold: f64,
    /// Days a monthly grant keeps its cycle open.
    pub billing_cycle_days: i64,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            low_balance_threshold: 0.2,
            billing_cycle_days: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    low_balance_threshold: Option<f64>,
    billing_cycle_days: Option<i64>,
    max_retries: Option<u32>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
}

impl EngineConfigBuilder {
    pub fn low_balance_threshold(mut self, fraction: f64) -> Self {
        self.low_balance_threshold = Some(fraction.clamp(0.0, 1.0));
        self
    }

    pub fn billing_cycle_days(mut self, days: i64) -> Self {
        self.billing_cycle_days = Some(days.max(1));
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Apply `CREDIT_ENGINE_LOW_BALANCE_THRESHOLD`,
    /// `CREDIT_ENGINE_BILLING_CYCLE_DAYS` and `CREDIT_ENGINE_MAX_RETRIES`
    /// when set; unparseable values are ignored.
    pub fn from_env(mut self) -> Self {
        if let Some(threshold) = env_parse::<f64>("CREDIT_ENGINE_LOW_BALANCE_THRESHOLD") {
            self.low_balance_threshold = Some(threshold.clamp(0.0, 1.0));
        }
        if let Some(days) = env_parse::<i64>("CREDIT_ENGINE_BILLING_CYCLE_DAYS") {
            self.billing_cycle_days = Some(days.max(1));
        }
        if let Some(retries) = env_parse::<u32>("CREDIT_ENGINE_MAX_RETRIES") {
            self.max_retries = Some(retries);
        }
        self
    }

    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            low_balance_threshold: self
                .low_balance_threshold
                .unwrap_or(default.low_balance_threshold),
            billing_cycle_days: self.billing_cycle_days.unwrap_or(default.billing_cycle_days),
            retry: RetryConfig {
                max_retries: self.max_retries.unwrap_or(default.retry.max_retries),
                initial_backoff: self
                    .initial_backoff
                    .unwrap_or(default.retry.initial_backoff),
                max_backoff: self.max_backoff.unwrap_or(default.retry.max_backoff),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}
