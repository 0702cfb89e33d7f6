use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fraction of the nominal delay added or removed by jitter.
pub const JITTER_FRACTION: f64 = 0.25;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err("retry.exponential_base must be a finite number >= 1".to_string());
        }
        if self.call_timeout_ms == 0 {
            return Err("retry.call_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }
}

/// Exponential backoff with jitter and a per-attempt timeout.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            exponential_base,
            call_timeout,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.exponential_base,
            Duration::from_millis(config.call_timeout_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Whether another attempt may follow the failed attempt `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// `min(base * exponential_base^attempt, max_delay)` before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Nominal delay scaled by `1 + 0.25 * (2 * draw - 1)`, where `draw` is
    /// uniform in `[0, 1)`.
    pub fn next_delay(&self, attempt: u32, draw: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let factor = 1.0 + JITTER_FRACTION * (2.0 * draw.clamp(0.0, 1.0) - 1.0);
        Duration::try_from_secs_f64((nominal * factor).max(0.0)).unwrap_or(Duration::ZERO)
    }
}
