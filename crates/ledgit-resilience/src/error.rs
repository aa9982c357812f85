use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analytics::FailureCategory;

/// Error kinds callers branch on, shared by every Ledgit storage crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Timeout or transient backend failure. Retried per policy.
    TransientNetwork,
    /// A circuit breaker refused the call without touching the network.
    CircuitOpen,
    /// Stored bytes do not hash to their id.
    Integrity,
    /// The backend refused the write for lack of space/quota. Never retried.
    QuotaExceeded,
    /// Retries were exhausted.
    OperationFailed,
    PermissionDenied,
    NotFound,
    /// Local persistence failure (disk I/O, serialization).
    Storage,
    Cancelled,
    /// Unrecoverable backend or local bug.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::TransientNetwork => "transient_network",
            Self::CircuitOpen => "circuit_open",
            Self::Integrity => "integrity",
            Self::QuotaExceeded => "quota_exceeded",
            Self::OperationFailed => "operation_failed",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Failure reported by a remote collaborator (storage provider, ledger).
///
/// Providers map their transport errors onto these variants; the resilience
/// layer decides from the variant whether to retry and whether the failure
/// counts against the backend's circuit breaker.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Timeouts and transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }

    /// Whether the failure says something about backend health.
    ///
    /// Quota, permission and not-found answers come from a backend that is
    /// up and responding, so they leave the breaker alone.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_) | Self::Fatal(_))
    }

    /// Stable short name used in failure signatures.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transient(_) => "transient",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Fatal(_) => "fatal",
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Timeout(_) => FailureCategory::Timeout,
            Self::Transient(_) => FailureCategory::Transient,
            Self::QuotaExceeded(_) => FailureCategory::QuotaExceeded,
            Self::PermissionDenied(_) => FailureCategory::PermissionDenied,
            Self::NotFound(_) => FailureCategory::NotFound,
            Self::Fatal(_) => FailureCategory::Fatal,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) | Self::Transient(_) => ErrorKind::TransientNetwork,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Errors surfaced by [`crate::ResilienceContext::call`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ResilienceError {
    /// The breaker for `backend` is open; no network attempt was made.
    #[error("circuit open for backend {backend}; next attempt allowed in {remaining:?}")]
    CircuitOpen { backend: String, remaining: Duration },

    /// Retryable failures persisted through every attempt.
    #[error("{operation} on {backend} failed after {attempts} attempt(s): {last}")]
    OperationFailed {
        backend: String,
        operation: String,
        attempts: u32,
        last: RemoteError,
    },

    /// A non-retryable failure, surfaced on first occurrence.
    #[error("{operation} on {backend} rejected: {source}")]
    Rejected {
        backend: String,
        operation: String,
        #[source]
        source: RemoteError,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Breaker bookkeeping contradicts itself. This is a local bug.
    #[error("inconsistent breaker state for {backend}: {detail}")]
    InconsistentState { backend: String, detail: String },
}

impl ResilienceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::OperationFailed { .. } => ErrorKind::OperationFailed,
            Self::Rejected { source, .. } => source.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InconsistentState { .. } => ErrorKind::Fatal,
        }
    }

    /// The remote error behind this failure, if there was one.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::OperationFailed { last, .. } => Some(last),
            Self::Rejected { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(RemoteError::Transient("503".into()).is_retryable());
        assert!(!RemoteError::QuotaExceeded("full".into()).is_retryable());
        assert!(!RemoteError::PermissionDenied("no".into()).is_retryable());
        assert!(!RemoteError::Fatal("boom".into()).is_retryable());
    }

    #[test]
    fn only_health_failures_trip_breaker() {
        assert!(RemoteError::Fatal("boom".into()).trips_breaker());
        assert!(!RemoteError::NotFound("x".into()).trips_breaker());
        assert!(!RemoteError::QuotaExceeded("x".into()).trips_breaker());
    }

    #[test]
    fn kinds_map_through_wrappers() {
        let rejected = ResilienceError::Rejected {
            backend: "arweave".into(),
            operation: "put".into(),
            source: RemoteError::QuotaExceeded("full".into()),
        };
        assert_eq!(rejected.kind(), ErrorKind::QuotaExceeded);

        let open = ResilienceError::CircuitOpen {
            backend: "arweave".into(),
            remaining: Duration::from_secs(3),
        };
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(open.remote_error().is_none());
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(ErrorKind::Integrity.to_string(), "integrity");
    }
}
