use ledgit_blob::BlobError;
use ledgit_resilience::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync options: {0}")]
    InvalidOptions(String),

    /// Migration needs both a local and a remote store.
    #[error("no remote storage is configured")]
    NoRemote,

    #[error("ledger rejected update for {repository}: {reason}")]
    LedgerRejected { repository: String, reason: String },

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidOptions(_) | Self::NoRemote => ErrorKind::Validation,
            Self::LedgerRejected { .. } => ErrorKind::OperationFailed,
            Self::LedgerUnavailable(_) => ErrorKind::TransientNetwork,
            Self::Blob(e) => e.kind(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
