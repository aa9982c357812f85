use std::path::PathBuf;

use ledgit_types::ObjectId;

/// Errors from the object model and local object stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Malformed input: empty names, null hashes, missing author, ...
    #[error("validation failed: {0}")]
    Validation(String),

    /// Decoded bytes do not hash to the id they were stored under.
    #[error("hash mismatch for {id}: computed {computed}")]
    HashMismatch { id: ObjectId, computed: ObjectId },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store root does not exist; the store was never initialised.
    #[error("store directory missing: {}", .0.display())]
    MissingRoot(PathBuf),

    /// Attempted to write a null object ID.
    #[error("cannot store object with null ID")]
    NullObjectId,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
