use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// One observed remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHealthSample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Advisory tuning derived from current health. Callers decide whether to
/// apply it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Recommendations {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub samples: usize,
    pub success_rate: f64,
    pub mean_latency_ms: u64,
    pub p95_latency_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Samples kept in the rolling window.
    pub window_size: usize,
    /// Below this many samples the network is reported healthy.
    pub min_samples: usize,
    pub degraded_success_rate: f64,
    pub unhealthy_success_rate: f64,
    pub degraded_latency_ms: u64,
    pub unhealthy_latency_ms: u64,
    pub base_batch_size: usize,
    pub base_concurrency: usize,
    pub base_retry_count: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_samples: 5,
            degraded_success_rate: 0.9,
            unhealthy_success_rate: 0.5,
            degraded_latency_ms: 2_000,
            unhealthy_latency_ms: 8_000,
            base_batch_size: 50,
            base_concurrency: 4,
            base_retry_count: 3,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::invalid("health.window_size", "must be at least 1"));
        }
        let rate_ok = |r: f64| (0.0..=1.0).contains(&r);
        if !rate_ok(self.degraded_success_rate) || !rate_ok(self.unhealthy_success_rate) {
            return Err(ConfigError::invalid("health.*_success_rate", "must be within [0, 1]"));
        }
        if self.unhealthy_success_rate > self.degraded_success_rate {
            return Err(ConfigError::invalid(
                "health.unhealthy_success_rate",
                "must not exceed health.degraded_success_rate",
            ));
        }
        if self.unhealthy_latency_ms < self.degraded_latency_ms {
            return Err(ConfigError::invalid(
                "health.unhealthy_latency_ms",
                "must not be below health.degraded_latency_ms",
            ));
        }
        if self.base_batch_size == 0 || self.base_concurrency == 0 {
            return Err(ConfigError::invalid(
                "health.base_batch_size",
                "batch size and concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Rolling window of call samples with a derived health status.
#[derive(Debug)]
pub struct NetworkHealthMonitor {
    config: HealthConfig,
    samples: Mutex<VecDeque<NetworkHealthSample>>,
}

impl NetworkHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let capacity = config.window_size;
        Self {
            config,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, sample: NetworkHealthSample) {
        let mut samples = self.samples.lock().expect("health lock poisoned");
        if samples.len() == self.config.window_size {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().expect("health lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_status(&self) -> HealthStatus {
        self.summary().status
    }

    pub fn summary(&self) -> HealthSummary {
        let samples = self.samples.lock().expect("health lock poisoned");
        let count = samples.len();
        if count == 0 {
            return HealthSummary {
                status: HealthStatus::Healthy,
                samples: 0,
                success_rate: 1.0,
                mean_latency_ms: 0,
                p95_latency_ms: 0,
            };
        }

        let successes = samples.iter().filter(|s| s.success).count();
        let success_rate = successes as f64 / count as f64;
        let mut latencies: Vec<u64> = samples.iter().map(|s| s.latency_ms).collect();
        drop(samples);

        latencies.sort_unstable();
        let mean_latency_ms = latencies.iter().sum::<u64>() / count as u64;
        // Nearest-rank percentile.
        let rank = ((count as f64) * 0.95).ceil() as usize;
        let p95_latency_ms = latencies[rank.clamp(1, count) - 1];

        let status = if count < self.config.min_samples {
            HealthStatus::Healthy
        } else if success_rate < self.config.unhealthy_success_rate
            || mean_latency_ms > self.config.unhealthy_latency_ms
        {
            HealthStatus::Unhealthy
        } else if success_rate < self.config.degraded_success_rate
            || mean_latency_ms > self.config.degraded_latency_ms
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSummary {
            status,
            samples: count,
            success_rate,
            mean_latency_ms,
            p95_latency_ms,
        }
    }

    /// Batch size, concurrency and retry count suited to the current status.
    pub fn recommendations(&self) -> Recommendations {
        let base = &self.config;
        match self.current_status() {
            HealthStatus::Healthy => Recommendations {
                batch_size: base.base_batch_size,
                concurrency: base.base_concurrency,
                retry_count: base.base_retry_count,
            },
            HealthStatus::Degraded => Recommendations {
                batch_size: (base.base_batch_size / 2).max(1),
                concurrency: (base.base_concurrency / 2).max(1),
                retry_count: base.base_retry_count + 2,
            },
            HealthStatus::Unhealthy => Recommendations {
                batch_size: (base.base_batch_size / 4).max(1),
                concurrency: 1,
                retry_count: base.base_retry_count + 4,
            },
        }
    }
}
