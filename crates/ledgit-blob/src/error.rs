use ledgit_resilience::{ErrorKind, ResilienceError};
use ledgit_store::StoreError;
use ledgit_types::ObjectId;

/// Errors from the blob store manager.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Bad input or an impossible request. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("blob not found: {0}")]
    NotFound(ObjectId),

    /// Bytes at some location do not re-derive the blob hash.
    #[error("integrity check failed for {hash}: {detail}")]
    Integrity { hash: ObjectId, detail: String },

    /// A stored frame could not be parsed or its checksum is wrong.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    pub(crate) fn integrity(hash: ObjectId, detail: impl Into<String>) -> Self {
        Self::Integrity {
            hash,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Integrity { .. } | Self::CorruptFrame(_) => ErrorKind::Integrity,
            Self::Compression(_) | Self::Serialization(_) | Self::Io(_) => ErrorKind::Storage,
            Self::Resilience(e) => e.kind(),
            Self::Store(e) => match e {
                StoreError::NotFound(_) => ErrorKind::NotFound,
                StoreError::Validation(_) | StoreError::NullObjectId => ErrorKind::Validation,
                StoreError::HashMismatch { .. } => ErrorKind::Integrity,
                StoreError::Serialization(_) | StoreError::Io(_) | StoreError::MissingRoot(_) => {
                    ErrorKind::Storage
                }
            },
        }
    }

    /// Whether a different location might still serve the blob.
    pub(crate) fn is_location_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Integrity | ErrorKind::NotFound
        )
    }
}

impl From<serde_json::Error> for BlobError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ledgit_resilience::RemoteError;

    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(BlobError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(BlobError::CorruptFrame("x".into()).kind(), ErrorKind::Integrity);
        assert_eq!(
            BlobError::Store(StoreError::MissingRoot("/nope".into())).kind(),
            ErrorKind::Storage
        );
        let open = ResilienceError::CircuitOpen {
            backend: "arweave".into(),
            remaining: Duration::from_secs(1),
        };
        assert_eq!(BlobError::from(open).kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn remote_not_found_is_a_location_failure() {
        let err = BlobError::from(ResilienceError::Rejected {
            backend: "arweave".into(),
            operation: "get".into(),
            source: RemoteError::NotFound("tx".into()),
        });
        assert!(err.is_location_failure());
        assert!(!BlobError::Validation("x".into()).is_location_failure());
    }
}
