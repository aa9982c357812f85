use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analytics::RetentionPolicy;
use crate::health::HealthConfig;
use crate::retry::RetryPolicy;

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Per-backend circuit breaker tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown after the first opening.
    pub cooldown_ms: u64,
    /// Upper bound for the cooldown when trial calls keep failing.
    pub max_cooldown_ms: u64,
    /// Growth factor applied each time a half-open trial fails.
    pub cooldown_multiplier: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            cooldown_multiplier: 2.0,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.max_cooldown_ms < self.cooldown_ms {
            return Err(ConfigError::invalid(
                "breaker.max_cooldown_ms",
                "must not be below breaker.cooldown_ms",
            ));
        }
        if !(self.cooldown_multiplier >= 1.0 && self.cooldown_multiplier.is_finite()) {
            return Err(ConfigError::invalid(
                "breaker.cooldown_multiplier",
                "must be a finite value >= 1.0",
            ));
        }
        Ok(())
    }
}

/// Everything a [`crate::ResilienceContext`] needs.
///
/// Loaded from the `[resilience]` table of the CLI config file; every field
/// has a default so partial tables work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    pub retention: RetentionPolicy,
    /// Per-attempt timeout. `None` leaves timing to the provider.
    pub call_timeout_ms: Option<u64>,
    /// Raise the retry budget to the health monitor's recommendation when
    /// the network looks degraded.
    pub adaptive_retries: bool,
}

impl ResilienceConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        self.retry.validate()?;
        self.health.validate()?;
        self.retention.validate()?;
        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("call_timeout_ms", "must be positive when set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ResilienceConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut config = ResilienceConfig::default();
        config.breaker.failure_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("breaker.failure_threshold"));
    }

    #[test]
    fn cooldown_bounds_checked() {
        let config = BreakerConfig {
            cooldown_ms: 10_000,
            max_cooldown_ms: 5_000,
            ..BreakerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ResilienceConfig =
            serde_json::from_str(r#"{"breaker": {"failure_threshold": 3}, "call_timeout_ms": 500}"#)
                .unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
