//! Resilience layer for Ledgit remote calls.
//!
//! Every call that leaves the machine goes through a [`ResilienceContext`],
//! which combines:
//!
//! - a per-backend [`CircuitBreaker`] (Closed -> Open -> HalfOpen) that fails
//!   fast while a backend is unhealthy,
//! - a [`RetryPolicy`] with exponential backoff and jitter for transient
//!   errors,
//! - a [`NetworkHealthMonitor`] that turns recent latency/success samples
//!   into advisory [`Recommendations`],
//! - [`FailureAnalytics`], an append-only failure log with trend and
//!   pattern detection.
//!
//! The context is an explicit object: construct it once and share it by
//! `Arc`. Nothing in this crate is reachable through global state.

pub mod analytics;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod retry;

pub use analytics::{
    FailureAnalytics, FailureCategory, FailurePattern, FailureRecord, FailureStats,
    RetentionPolicy, Trend,
};
pub use breaker::{Admission, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, ConfigError, ResilienceConfig};
pub use context::{CallTarget, ResilienceContext};
pub use error::{ErrorKind, RemoteError, ResilienceError, ResilienceResult};
pub use health::{HealthConfig, HealthStatus, HealthSummary, NetworkHealthMonitor, NetworkHealthSample, Recommendations};
pub use retry::RetryPolicy;
