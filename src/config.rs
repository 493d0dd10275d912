//! Configuration loading from TOML files.
//!
//! The root [`Config`] mirrors the layer's components: an endpoint list plus
//! `[pool]`, `[health]`, `[limiter]`, and `[scheduler]` sections. Every field
//! has a default; `Config::load` reads a TOML file and validates it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, Result};

/// One configured remote endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Endpoint address.
    pub url: Url,
    /// Relative priority; only used as a stable ordering hint.
    #[serde(default)]
    pub priority: u32,
}

/// How the pool picks a connection handle among eligible ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    /// Monotonic counter modulo the eligible list length.
    #[default]
    RoundRobin,
    /// Minimum rolling latency; endpoints without a sample sort last.
    Fastest,
    /// Minimum in-flight request count.
    LeastLoaded,
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round-robin"),
            LoadBalanceStrategy::Fastest => write!(f, "fastest"),
            LoadBalanceStrategy::LeastLoaded => write!(f, "least-loaded"),
        }
    }
}

/// Connection-pool sizing and selection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Target number of connection handles.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Selection strategy.
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    /// Fraction of the assumed per-endpoint limit at which an endpoint is
    /// excluded from selection until its rolling window rolls over.
    #[serde(default = "default_rate_limit_buffer")]
    pub rate_limit_buffer: f64,
    /// Assumed per-endpoint request limit over the rolling 60s window.
    #[serde(default = "default_endpoint_requests_per_minute")]
    pub endpoint_requests_per_minute: u32,
    /// Minimum handle count (as a fraction of `size`) restored by the
    /// top-up pass after pruning.
    #[serde(default = "default_floor_pct")]
    pub floor_pct: f64,
}

const fn default_pool_size() -> usize {
    5
}

fn default_rate_limit_buffer() -> f64 {
    0.8
}

const fn default_endpoint_requests_per_minute() -> u32 {
    120
}

fn default_floor_pct() -> f64 {
    0.3
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            strategy: LoadBalanceStrategy::default(),
            rate_limit_buffer: default_rate_limit_buffer(),
            endpoint_requests_per_minute: default_endpoint_requests_per_minute(),
            floor_pct: default_floor_pct(),
        }
    }
}

impl PoolSettings {
    /// Handle count restored by the top-up pass.
    pub fn floor(&self) -> usize {
        ((self.size as f64) * self.floor_pct).ceil() as usize
    }
}

/// Health-probe settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    /// Interval between probe rounds in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Per-probe (and per-dial) timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// An endpoint is healthy while `errors / (errors + successes)` stays
    /// at or below this rate.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

const fn default_check_interval_ms() -> u64 {
    30_000
}

const fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_max_error_rate() -> f64 {
    0.5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

impl HealthSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Sliding-window rate-limiter settings, shared by every scope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterSettings {
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Requests admitted per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Extra admissions tolerated past the limit.
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance: u32,
    /// Base of the exponential backoff opened on denial, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff growth factor per consecutive failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Fixed penalty applied when the remote side signals over-limit,
    /// in milliseconds.
    #[serde(default = "default_throttle_penalty_ms")]
    pub throttle_penalty_ms: u64,
}

const fn default_window_ms() -> u64 {
    60_000
}

const fn default_max_requests() -> u32 {
    60
}

const fn default_burst_allowance() -> u32 {
    10
}

const fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    60_000
}

const fn default_throttle_penalty_ms() -> u64 {
    30_000
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            burst_allowance: default_burst_allowance(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            throttle_penalty_ms: default_throttle_penalty_ms(),
        }
    }
}

impl LimiterSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn throttle_penalty(&self) -> Duration {
        Duration::from_millis(self.throttle_penalty_ms)
    }
}

/// Request-scheduler settings. Defaults favor caution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    /// Maximum concurrently running operations.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Minimum spacing between admissions in milliseconds.
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: u64,
    /// Default retry budget for submitted operations.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Drain-loop sleep when idle or at the concurrency cap, in
    /// milliseconds.
    #[serde(default = "default_drain_idle_ms")]
    pub drain_idle_ms: u64,
    /// Requeue delay after a rate-limiter denial, in milliseconds.
    #[serde(default = "default_denied_requeue_ms")]
    pub denied_requeue_ms: u64,
    /// Fixed backoff ladder for transient failures, indexed by retry
    /// count and clamped at the last rung, in milliseconds.
    #[serde(default = "default_retry_ladder_ms")]
    pub retry_ladder_ms: Vec<u64>,
    /// Shutdown poll interval while waiting for in-flight operations.
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    /// Upper bound on the shutdown wait, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

const fn default_max_concurrent() -> usize {
    2
}

const fn default_spacing_ms() -> u64 {
    2_000
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_drain_idle_ms() -> u64 {
    100
}

const fn default_denied_requeue_ms() -> u64 {
    2_000
}

fn default_retry_ladder_ms() -> Vec<u64> {
    vec![5_000, 15_000, 30_000, 60_000]
}

const fn default_shutdown_poll_ms() -> u64 {
    100
}

const fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            spacing_ms: default_spacing_ms(),
            max_retries: default_max_retries(),
            drain_idle_ms: default_drain_idle_ms(),
            denied_requeue_ms: default_denied_requeue_ms(),
            retry_ladder_ms: default_retry_ladder_ms(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl SchedulerSettings {
    pub fn spacing(&self) -> Duration {
        Duration::from_millis(self.spacing_ms)
    }

    pub fn drain_idle(&self) -> Duration {
        Duration::from_millis(self.drain_idle_ms)
    }

    pub fn denied_requeue(&self) -> Duration {
        Duration::from_millis(self.denied_requeue_ms)
    }

    /// Ladder delay for the given 1-based retry count.
    pub fn ladder_delay(&self, retry_count: u32) -> Duration {
        let idx = (retry_count.saturating_sub(1) as usize).min(self.retry_ladder_ms.len() - 1);
        Duration::from_millis(self.retry_ladder_ms[idx])
    }
}

/// Root configuration for the connection layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Remote endpoints the pool may route work to.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub limiter: LimiterSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl Config {
    /// Load and validate a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &'static str, reason: &str| -> crate::error::Error {
            ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            }
            .into()
        };

        if self.endpoints.is_empty() {
            return Err(ConfigError::MissingField { field: "endpoints" }.into());
        }
        if self.pool.size == 0 {
            return Err(invalid("pool.size", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.pool.rate_limit_buffer) {
            return Err(invalid("pool.rate_limit_buffer", "must be within [0, 1]"));
        }
        if self.pool.endpoint_requests_per_minute == 0 {
            return Err(invalid("pool.endpoint_requests_per_minute", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.pool.floor_pct) {
            return Err(invalid("pool.floor_pct", "must be within [0, 1]"));
        }
        if self.health.check_interval_ms == 0 {
            return Err(invalid("health.check_interval_ms", "must be > 0"));
        }
        if self.health.connection_timeout_ms == 0 {
            return Err(invalid("health.connection_timeout_ms", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.health.max_error_rate) {
            return Err(invalid("health.max_error_rate", "must be within [0, 1]"));
        }
        if self.limiter.window_ms == 0 {
            return Err(invalid("limiter.window_ms", "must be > 0"));
        }
        if self.limiter.max_requests == 0 {
            return Err(invalid("limiter.max_requests", "must be > 0"));
        }
        if self.limiter.backoff_multiplier < 1.0 {
            return Err(invalid("limiter.backoff_multiplier", "must be >= 1.0"));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(invalid("scheduler.max_concurrent", "must be > 0"));
        }
        if self.scheduler.retry_ladder_ms.is_empty() {
            return Err(invalid("scheduler.retry_ladder_ms", "must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_endpoint() -> Config {
        Config {
            endpoints: vec![EndpointConfig {
                url: Url::parse("https://rpc.example.com").unwrap(),
                priority: 0,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_an_endpoint_exists() {
        assert!(config_with_endpoint().validate().is_ok());
    }

    #[test]
    fn rejects_empty_endpoint_list() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_pool_size() {
        let mut config = config_with_endpoint();
        config.pool.size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_error_rate() {
        let mut config = config_with_endpoint();
        config.health.max_error_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_retry_ladder() {
        let mut config = config_with_endpoint();
        config.scheduler.retry_ladder_ms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn ladder_delay_clamps_past_the_last_rung() {
        let scheduler = SchedulerSettings::default();
        assert_eq!(scheduler.ladder_delay(1), Duration::from_secs(5));
        assert_eq!(scheduler.ladder_delay(4), Duration::from_secs(60));
        assert_eq!(scheduler.ladder_delay(9), Duration::from_secs(60));
    }

    #[test]
    fn pool_floor_rounds_up() {
        let pool = PoolSettings {
            size: 10,
            floor_pct: 0.25,
            ..Default::default()
        };
        assert_eq!(pool.floor(), 3);
    }

    #[test]
    fn strategy_parses_kebab_case() {
        let parsed: LoadBalanceStrategy = serde_json::from_str("\"least-loaded\"").unwrap();
        assert_eq!(parsed, LoadBalanceStrategy::LeastLoaded);
        assert_eq!(parsed.to_string(), "least-loaded");
    }
}
