//! Configuration (spec §6).

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;

/// Top-level configuration for a [`crate::dispatcher::Dispatcher`]. Immutable
/// once passed to `Dispatcher::new` (spec §3: "Immutable after Dispatcher
/// construction").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub connection_string: String,
    #[serde(default = "default_max")]
    pub max: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub retry: Option<RetryConfigToml>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfigToml>,
    /// Best-effort grace period `shutdown()` waits for in-flight work to
    /// drain before terminating workers unconditionally (SPEC_FULL §C.3).
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
}

fn default_max() -> usize {
    10
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// TOML-friendly mirror of [`RetryConfig`] (durations as milliseconds).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfigToml {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

fn default_jitter() -> bool {
    true
}

impl From<&RetryConfigToml> for RetryConfig {
    fn from(c: &RetryConfigToml) -> Self {
        RetryConfig {
            max_attempts: c.max_attempts,
            initial_delay: std::time::Duration::from_millis(c.initial_delay_ms),
            max_delay: std::time::Duration::from_millis(c.max_delay_ms),
            backoff_factor: c.backoff_factor,
            jitter: c.jitter,
            deadline: c.deadline_ms.map(std::time::Duration::from_millis),
        }
    }
}

/// TOML-friendly mirror of [`CircuitBreakerConfig`] (durations as
/// milliseconds).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfigToml {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_max_calls: u32,
    pub half_open_successes_to_close: u32,
}

impl From<&CircuitBreakerConfigToml> for CircuitBreakerConfig {
    fn from(c: &CircuitBreakerConfigToml) -> Self {
        CircuitBreakerConfig {
            failure_threshold: c.failure_threshold,
            cooldown: std::time::Duration::from_millis(c.cooldown_ms),
            half_open_max_calls: c.half_open_max_calls,
            half_open_successes_to_close: c.half_open_successes_to_close,
        }
    }
}

impl Config {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Config {
            connection_string: connection_string.into(),
            max: default_max(),
            max_workers: default_max_workers(),
            retry: None,
            circuit_breaker: None,
            shutdown_timeout_ms: None,
        }
    }

    /// Load configuration from a TOML file, validating before returning.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
            .as_ref()
            .map(RetryConfig::from)
            .unwrap_or_default()
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        self.circuit_breaker
            .as_ref()
            .map(CircuitBreakerConfig::from)
            .unwrap_or_default()
    }

    /// Per-worker pool size `P` and local pool size `L` (spec §4.1, §8
    /// property 1: `L + W·P = M`, `L ≥ 1`, `W = 0 ⇒ P = 0`, `W > 0 ⇒ P ≥ 1`).
    pub fn pool_sizes(&self) -> (usize, usize) {
        let m = self.max;
        let w = self.max_workers;
        let p = if w > 0 { (m / (w + 1)).max(1) } else { 0 };
        let l = m.saturating_sub(w * p).max(1);
        (l, p)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_string.trim().is_empty() {
            anyhow::bail!("connection_string must not be empty");
        }
        if self.max == 0 {
            anyhow::bail!("max must be >= 1");
        }
        if let Some(ref retry) = self.retry {
            if retry.max_attempts == 0 {
                anyhow::bail!("retry.max_attempts must be >= 1");
            }
            if retry.backoff_factor < 1.0 {
                anyhow::bail!("retry.backoff_factor must be >= 1");
            }
            if retry.backoff_factor.is_nan() || retry.backoff_factor.is_infinite() {
                anyhow::bail!("retry.backoff_factor must be a finite number");
            }
        }
        if let Some(ref breaker) = self.circuit_breaker {
            if breaker.failure_threshold == 0 {
                anyhow::bail!("circuit_breaker.failure_threshold must be >= 1");
            }
            if breaker.half_open_max_calls == 0 {
                anyhow::bail!("circuit_breaker.half_open_max_calls must be >= 1");
            }
            if breaker.half_open_successes_to_close == 0 {
                anyhow::bail!("circuit_breaker.half_open_successes_to_close must be >= 1");
            }
        }
        Ok(())
    }
}
