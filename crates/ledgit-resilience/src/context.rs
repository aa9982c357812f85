use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analytics::{FailureAnalytics, FailureCategory};
use crate::breaker::{Admission, BreakerRegistry, BreakerSnapshot, BreakerState};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ResilienceConfig};
use crate::error::{RemoteError, ResilienceError, ResilienceResult};
use crate::health::{NetworkHealthMonitor, NetworkHealthSample, Recommendations};

/// Identifies a remote call for breaker, health and analytics bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct CallTarget<'a> {
    /// Breaker key; one breaker per backend.
    pub backend: &'a str,
    /// Component name used in failure signatures.
    pub component: &'a str,
    pub operation: &'a str,
}

impl<'a> CallTarget<'a> {
    pub fn new(backend: &'a str, operation: &'a str) -> Self {
        Self {
            backend,
            component: backend,
            operation,
        }
    }
}

/// A breaker admission held by an attempt in flight.
///
/// Dropping it before an outcome is recorded (cancellation, or the caller
/// dropping the call future) releases a half-open trial slot.
struct AdmissionGuard<'a> {
    breakers: &'a BreakerRegistry,
    backend: &'a str,
    admission: Admission,
    settled: bool,
}

impl<'a> AdmissionGuard<'a> {
    fn admit(breakers: &'a BreakerRegistry, backend: &'a str, now: DateTime<Utc>) -> ResilienceResult<Self> {
        Ok(Self {
            admission: breakers.admit(backend, now)?,
            breakers,
            backend,
            settled: false,
        })
    }

    /// Hand the admission over for outcome reporting.
    fn settle(mut self) -> Admission {
        self.settled = true;
        self.admission
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.abandon(self.backend, self.admission);
        }
    }
}

/// Shared resilience state for one process.
///
/// Construct once and pass by `Arc` to every component that talks to a
/// remote backend.
#[derive(Debug)]
pub struct ResilienceContext {
    config: ResilienceConfig,
    clock: Arc<dyn Clock>,
    breakers: BreakerRegistry,
    health: NetworkHealthMonitor,
    analytics: FailureAnalytics,
}

impl ResilienceContext {
    pub fn new(config: ResilienceConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ResilienceConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            breakers: BreakerRegistry::new(config.breaker.clone()),
            health: NetworkHealthMonitor::new(config.health.clone()),
            analytics: FailureAnalytics::new(config.retention.clone(), clock.clone()),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn health(&self) -> &NetworkHealthMonitor {
        &self.health
    }

    pub fn analytics(&self) -> &FailureAnalytics {
        &self.analytics
    }

    pub fn recommendations(&self) -> Recommendations {
        self.health.recommendations()
    }

    pub fn breaker_state(&self, backend: &str) -> BreakerState {
        self.breakers.state(backend)
    }

    pub fn breaker(&self, backend: &str) -> BreakerSnapshot {
        self.breakers.snapshot(backend)
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Retries allowed for the next call.
    pub fn effective_retries(&self) -> u32 {
        let configured = self.config.retry.max_retries;
        if self.config.adaptive_retries {
            configured.max(self.health.recommendations().retry_count)
        } else {
            configured
        }
    }

    /// Run `op` under the backend's breaker, the retry policy and the
    /// optional per-attempt timeout.
    ///
    /// - An open breaker fails fast with [`ResilienceError::CircuitOpen`]
    ///   and `op` is not invoked.
    /// - Timeouts and transient errors are retried with backoff; when the
    ///   budget runs out the last error is wrapped in
    ///   [`ResilienceError::OperationFailed`].
    /// - Any other error is returned as [`ResilienceError::Rejected`] on
    ///   first occurrence.
    /// - Cancellation aborts an in-flight attempt or backoff sleep and
    ///   returns [`ResilienceError::Cancelled`].
    pub async fn call<T, F, Fut>(
        &self,
        target: CallTarget<'_>,
        cancel: &CancellationToken,
        mut op: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_retries = self.effective_retries();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            let guard = AdmissionGuard::admit(&self.breakers, target.backend, self.clock.now())?;
            attempts += 1;

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                res = self.attempt(&mut op) => res,
            };
            let admission = guard.settle();
            let latency_ms = started.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(value) => {
                    self.observe(target, admission, latency_ms, None)?;
                    return Ok(value);
                }
                Err(err) => err,
            };
            self.observe(target, admission, latency_ms, Some(&err))?;

            if !err.is_retryable() {
                return Err(ResilienceError::Rejected {
                    backend: target.backend.to_string(),
                    operation: target.operation.to_string(),
                    source: err,
                });
            }
            if attempts > max_retries {
                warn!(
                    backend = target.backend,
                    operation = target.operation,
                    attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Err(ResilienceError::OperationFailed {
                    backend: target.backend.to_string(),
                    operation: target.operation.to_string(),
                    attempts,
                    last: err,
                });
            }

            let delay = self.backoff(attempts - 1);
            debug!(
                backend = target.backend,
                operation = target.operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn backoff(&self, retry: u32) -> std::time::Duration {
        self.config.retry.delay_for(retry, &mut rand::thread_rng())
    }

    async fn attempt<T, F, Fut>(&self, op: &mut F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        match self.config.call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(res) => res,
                Err(_) => Err(RemoteError::Timeout(limit)),
            },
            None => op().await,
        }
    }

    /// Feed one attempt's outcome to the breaker, health monitor and
    /// failure log.
    fn observe(
        &self,
        target: CallTarget<'_>,
        admission: Admission,
        latency_ms: u64,
        err: Option<&RemoteError>,
    ) -> ResilienceResult<()> {
        let now = self.clock.now();
        let counted = err.is_some_and(RemoteError::trips_breaker);
        self.health.record(NetworkHealthSample {
            timestamp: now,
            latency_ms,
            success: !counted,
        });

        let transition = self.breakers.record(target.backend, admission, counted, now)?;

        if let Some(err) = err {
            if err.category() != FailureCategory::NotFound {
                self.analytics
                    .record(target.component, target.operation, err.class_name(), err.category());
            }
        }
        if transition.is_some_and(|t| t.opened()) {
            self.analytics.record(
                target.backend,
                target.operation,
                FailureCategory::CircuitOpen.as_str(),
                FailureCategory::CircuitOpen,
            );
        }
        Ok(())
    }
}
