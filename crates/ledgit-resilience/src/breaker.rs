use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{remaining, to_time_delta};
use crate::config::BreakerConfig;
use crate::error::{ResilienceError, ResilienceResult};

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through normally.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// A single trial call is probing the backend.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// How a call was let through. Handed back when reporting its outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Ordinary call while the circuit is closed.
    Pass,
    /// The one trial call allowed while half-open.
    Trial,
}

/// A state change caused by a reported outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

impl Transition {
    pub fn opened(&self) -> bool {
        self.to == BreakerState::Open
    }
}

/// Point-in-time view of one breaker, for health reports.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub backend: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub cooldown: Duration,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub times_opened: u64,
}

/// Breaker for one backend.
///
/// Counted failures while closed move it to open once
/// `failure_threshold` is reached. After the cooldown the next admission
/// becomes the single half-open trial: success closes the circuit and
/// resets the cooldown, failure reopens it with the cooldown grown by
/// `cooldown_multiplier` up to `max_cooldown`.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    backend: String,
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    base_cooldown: Duration,
    cooldown: Duration,
    max_cooldown: Duration,
    multiplier: f64,
    cooldown_until: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown: config.cooldown(),
            cooldown: config.cooldown(),
            max_cooldown: config.max_cooldown(),
            multiplier: config.cooldown_multiplier,
            cooldown_until: None,
            trial_in_flight: false,
            times_opened: 0,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Decide whether a call may proceed at `now`.
    pub fn admit(&mut self, now: DateTime<Utc>) -> ResilienceResult<Admission> {
        match self.state {
            BreakerState::Closed => Ok(Admission::Pass),
            BreakerState::Open => {
                let until = self.cooldown_until.ok_or_else(|| ResilienceError::InconsistentState {
                    backend: self.backend.clone(),
                    detail: "open circuit without a cooldown deadline".into(),
                })?;
                if now < until {
                    return Err(self.open_error(remaining(now, until)));
                }
                self.state = BreakerState::HalfOpen;
                self.trial_in_flight = true;
                info!(backend = %self.backend, "circuit half-open, admitting trial call");
                Ok(Admission::Trial)
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    return Err(self.open_error(Duration::ZERO));
                }
                // The previous trial was abandoned; this call takes its place.
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    /// Report the outcome of an admitted call.
    ///
    /// `counted` is true when the failure reflects backend health (timeouts,
    /// transient and fatal errors). Successes and non-counted failures are
    /// both passed as `counted = false`.
    pub fn record(
        &mut self,
        admission: Admission,
        counted: bool,
        now: DateTime<Utc>,
    ) -> ResilienceResult<Option<Transition>> {
        match admission {
            Admission::Trial => self.record_trial(counted, now),
            Admission::Pass => self.record_pass(counted, now),
        }
    }

    /// Release a trial slot whose call never reported an outcome.
    pub fn abandon(&mut self, admission: Admission) {
        if admission == Admission::Trial && self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            backend: self.backend.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            cooldown: self.cooldown,
            cooldown_until: self.cooldown_until,
            times_opened: self.times_opened,
        }
    }

    fn record_pass(&mut self, counted: bool, now: DateTime<Utc>) -> ResilienceResult<Option<Transition>> {
        // Late results from calls admitted before the circuit opened do not
        // move an open or half-open breaker.
        if self.state != BreakerState::Closed {
            return Ok(None);
        }
        if self.consecutive_failures >= self.failure_threshold {
            return Err(ResilienceError::InconsistentState {
                backend: self.backend.clone(),
                detail: format!(
                    "closed with {} consecutive failures (threshold {})",
                    self.consecutive_failures, self.failure_threshold
                ),
            });
        }
        if !counted {
            self.consecutive_failures = 0;
            return Ok(None);
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.failure_threshold {
            return Ok(None);
        }
        self.open(now);
        warn!(
            backend = %self.backend,
            failures = self.consecutive_failures,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "circuit opened"
        );
        Ok(Some(Transition {
            from: BreakerState::Closed,
            to: BreakerState::Open,
        }))
    }

    fn record_trial(&mut self, counted: bool, now: DateTime<Utc>) -> ResilienceResult<Option<Transition>> {
        if self.state != BreakerState::HalfOpen || !self.trial_in_flight {
            return Err(ResilienceError::InconsistentState {
                backend: self.backend.clone(),
                detail: format!("trial outcome reported while {}", self.state),
            });
        }
        self.trial_in_flight = false;
        if counted {
            let grown = self.cooldown.as_secs_f64() * self.multiplier;
            self.cooldown = Duration::from_secs_f64(grown.min(self.max_cooldown.as_secs_f64()));
            self.open(now);
            warn!(
                backend = %self.backend,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "trial call failed, circuit reopened"
            );
            Ok(Some(Transition {
                from: BreakerState::HalfOpen,
                to: BreakerState::Open,
            }))
        } else {
            self.state = BreakerState::Closed;
            self.consecutive_failures = 0;
            self.cooldown = self.base_cooldown;
            self.cooldown_until = None;
            info!(backend = %self.backend, "trial call succeeded, circuit closed");
            Ok(Some(Transition {
                from: BreakerState::HalfOpen,
                to: BreakerState::Closed,
            }))
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.cooldown_until = Some(now + to_time_delta(self.cooldown));
        self.times_opened += 1;
    }

    fn open_error(&self, remaining: Duration) -> ResilienceError {
        ResilienceError::CircuitOpen {
            backend: self.backend.clone(),
            remaining,
        }
    }
}

/// Breakers for every backend, created on first use.
///
/// A single mutex guards the map so admission and outcome updates for a
/// backend are serialized; it is never held across an await.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, backend: &str, now: DateTime<Utc>) -> ResilienceResult<Admission> {
        let mut map = self.breakers.lock().expect("breaker lock poisoned");
        map.entry(backend.to_string())
            .or_insert_with(|| CircuitBreaker::new(backend, &self.config))
            .admit(now)
    }

    pub fn record(
        &self,
        backend: &str,
        admission: Admission,
        counted: bool,
        now: DateTime<Utc>,
    ) -> ResilienceResult<Option<Transition>> {
        let mut map = self.breakers.lock().expect("breaker lock poisoned");
        match map.get_mut(backend) {
            Some(breaker) => breaker.record(admission, counted, now),
            None => Err(ResilienceError::InconsistentState {
                backend: backend.to_string(),
                detail: "outcome reported for a backend that was never admitted".into(),
            }),
        }
    }

    pub fn abandon(&self, backend: &str, admission: Admission) {
        let mut map = self.breakers.lock().expect("breaker lock poisoned");
        if let Some(breaker) = map.get_mut(backend) {
            breaker.abandon(admission);
        }
    }

    pub fn state(&self, backend: &str) -> BreakerState {
        let map = self.breakers.lock().expect("breaker lock poisoned");
        map.get(backend)
            .map(CircuitBreaker::state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, backend: &str) -> BreakerSnapshot {
        let map = self.breakers.lock().expect("breaker lock poisoned");
        map.get(backend)
            .map(CircuitBreaker::snapshot)
            .unwrap_or_else(|| CircuitBreaker::new(backend, &self.config).snapshot())
    }

    /// Snapshots for every known backend, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let map = self.breakers.lock().expect("breaker lock poisoned");
        let mut all: Vec<_> = map.values().map(CircuitBreaker::snapshot).collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }
}
