use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Exponential backoff with jitter for retryable remote failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retry.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the computed delay to randomise by, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::invalid("retry.multiplier", "must be a finite value >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be within [0, 1]"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must not be below retry.base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `retry` (zero-based), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * self.multiplier.powi(retry.min(64) as i32);
        let capped = exp.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff before retry number `retry`, jittered and capped at
    /// `max_delay_ms`.
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(retry).as_millis() as f64;
        if self.jitter == 0.0 || base == 0.0 {
            return Duration::from_millis(base as u64);
        }
        let spread = base * self.jitter;
        let jittered = rng.gen_range((base - spread)..=(base + spread));
        Duration::from_millis(jittered.clamp(0.0, self.max_delay_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_then_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.25,
            ..RetryPolicy::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = policy.delay_for(0, &mut rng).as_millis();
            assert!((750..=1_250).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 1_000,
            jitter: 1.0,
            ..RetryPolicy::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert!(policy.delay_for(5, &mut rng) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());
        policy.jitter = 1.5;
        assert!(policy.validate().is_err());
        policy.jitter = 0.1;
        policy.multiplier = 0.5;
        assert!(policy.validate().is_err());
        policy.multiplier = 2.0;
        policy.max_delay_ms = 10;
        assert!(policy.validate().is_err());
    }
}
