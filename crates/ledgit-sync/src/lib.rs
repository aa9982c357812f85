//! Synchronization for Ledgit.
//!
//! [`SyncEngine::migrate`] copies blobs between local and remote storage on
//! a bounded worker pool. Every transfer goes through
//! [`ledgit_blob::BlobStore::copy_to`], so each remote leg is wrapped by the
//! shared resilience layer. Migration never deletes the source copy.
//!
//! [`publish_commit`] stores a commit object and only then moves the
//! repository's commit pointer through a [`CommitLedger`].

pub mod engine;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod types;

pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use ledger::{publish_commit, CommitLedger, InMemoryLedger, LedgerConfirmation};
pub use progress::ProgressEvent;
pub use types::{Direction, MigrateOptions, MigrateReport, PassReport};
