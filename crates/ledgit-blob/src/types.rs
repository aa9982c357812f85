use ledgit_resilience::ErrorKind;
use ledgit_types::{LocationSet, ObjectId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::BlobError;
use crate::metadata::BlobMeta;

/// Where and how `put` should store content.
#[derive(Clone, Debug, Default)]
pub struct PutHints {
    pub content_type: Option<String>,
    /// `None` uses the store's default locations.
    pub locations: Option<LocationSet>,
}

impl PutHints {
    pub fn at(locations: LocationSet) -> Self {
        Self {
            content_type: None,
            locations: Some(locations),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Result of a `put`.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobRef {
    pub meta: BlobMeta,
    /// The blob already existed at every requested location; no I/O was done.
    pub deduplicated: bool,
}

impl BlobRef {
    pub fn hash(&self) -> ObjectId {
        self.meta.hash
    }
}

/// Which blobs a batch operation covers.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Targets {
    #[default]
    All,
    Only(Vec<ObjectId>),
}

/// A blob a batch operation could not handle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlobFailure {
    pub hash: ObjectId,
    pub kind: ErrorKind,
    pub message: String,
}

impl BlobFailure {
    pub fn new(hash: ObjectId, error: &BlobError) -> Self {
        Self {
            hash,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct VerifyOptions {
    /// Rewrite corrupt copies from a valid one.
    pub repair: bool,
    /// Populate configured locations that lack the blob.
    pub sync_missing: bool,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub verified: Vec<ObjectId>,
    pub repaired: Vec<ObjectId>,
    pub failed: Vec<BlobFailure>,
    pub skipped: Vec<ObjectId>,
}

#[derive(Clone, Debug, Default)]
pub struct OptimizeOptions {
    pub deduplicate: bool,
    pub recompress: bool,
    pub clean: bool,
    pub cancel: CancellationToken,
}

impl OptimizeOptions {
    pub fn all() -> Self {
        Self {
            deduplicate: true,
            recompress: true,
            clean: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OptimizeReport {
    /// Legacy keys collapsed onto their canonical hash.
    pub deduplicated: usize,
    /// Frames rewritten smaller.
    pub recompressed: usize,
    /// Local copies, orphan chunks and temp files removed.
    pub cleaned: usize,
    pub failed: Vec<BlobFailure>,
    /// Local bytes freed.
    pub savings: u64,
}

/// What `copy_to` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Bytes were transferred to the destination.
    Copied { bytes: u64 },
    /// The destination already held a verified copy.
    Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub unique_blobs: usize,
    pub total_references: u64,
    pub chunk_count: usize,
    pub alias_count: usize,
    pub local_blobs: usize,
    pub remote_blobs: usize,
    /// Sum of uncompressed blob sizes.
    pub logical_bytes: u64,
    /// Bytes held by the local object store.
    pub local_stored_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub blobs: usize,
    pub chunks: usize,
    /// Local locations dropped because the copy no longer exists.
    pub dropped: usize,
    /// Local objects that are neither blobs nor chunks.
    pub unrecognized: usize,
}
