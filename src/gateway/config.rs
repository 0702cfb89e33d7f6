use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::admission::AdmissionConfig;
use super::circuit_breaker::CircuitBreakerConfig;
use super::context::ContextConfig;
use super::costing::TierTable;
use super::counter_store::CounterBackendConfig;
use super::guardrails::GuardrailsConfig;
use super::retry::RetryConfig;
use super::router::TierRatios;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Limits and routing applied to one subject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub tier_ratios: TierRatios,
    /// Skips admission entirely; used for operators and internal callers.
    #[serde(default)]
    pub is_privileged: bool,
}

fn default_max_per_minute() -> u32 {
    10
}

fn default_max_per_hour() -> u32 {
    100
}

fn default_cooldown_ms() -> u64 {
    3_000
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            max_per_minute: default_max_per_minute(),
            max_per_hour: default_max_per_hour(),
            cooldown_ms: default_cooldown_ms(),
            tier_ratios: TierRatios::default(),
            is_privileged: false,
        }
    }
}

impl Plan {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.tier_ratios.validate()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub default_plan: Plan,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub counter_backend: CounterBackendConfig,
    /// Breaker name guarding the model API.
    #[serde(default = "default_upstream_name")]
    pub upstream_name: String,
}

fn default_upstream_name() -> String {
    "model_api".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_plan: Plan::default(),
            admission: AdmissionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            context: ContextConfig::default(),
            guardrails: GuardrailsConfig::default(),
            tiers: TierTable::default(),
            counter_backend: CounterBackendConfig::default(),
            upstream_name: default_upstream_name(),
        }
    }
}

impl GatewayConfig {
    /// Read `path` as TOML, or as JSON when the extension is `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            self.default_plan
                .validate()
                .map_err(|err| format!("default_plan: {err}")),
            self.admission.validate(),
            self.circuit_breaker.validate(),
            self.retry.validate(),
            self.guardrails.validate(),
            self.tiers.validate(),
        ];
        for check in checks {
            check.map_err(ConfigError::Invalid)?;
        }
        if self.upstream_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
