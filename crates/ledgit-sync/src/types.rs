use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ledgit_blob::BlobFailure;
use ledgit_types::{ObjectId, StorageLocation};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::progress::ProgressEvent;

/// Which way blobs move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
    /// Both one-way passes, local-to-remote first.
    Both,
}

impl Direction {
    /// The one-way passes this direction expands to.
    pub fn passes(self) -> Vec<Direction> {
        match self {
            Self::Both => vec![Self::LocalToRemote, Self::RemoteToLocal],
            one_way => vec![one_way],
        }
    }

    /// Source and destination of a one-way direction.
    pub fn endpoints(self) -> Option<(StorageLocation, StorageLocation)> {
        match self {
            Self::LocalToRemote => Some((StorageLocation::Local, StorageLocation::Remote)),
            Self::RemoteToLocal => Some((StorageLocation::Remote, StorageLocation::Local)),
            Self::Both => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalToRemote => "local-to-remote",
            Self::RemoteToLocal => "remote-to-local",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-to-remote" | "push" => Ok(Self::LocalToRemote),
            "remote-to-local" | "pull" => Ok(Self::RemoteToLocal),
            "both" => Ok(Self::Both),
            other => Err(SyncError::InvalidOptions(format!(
                "unknown direction {other:?} (expected local-to-remote, remote-to-local or both)"
            ))),
        }
    }
}

/// Options for [`crate::SyncEngine::migrate`].
#[derive(Clone, Debug)]
pub struct MigrateOptions {
    /// Leave verified destination copies alone.
    pub skip_existing: bool,
    /// Upper bound on simultaneous transfers.
    pub concurrency: usize,
    /// Further cap concurrency by the health monitor's recommendation.
    pub adaptive: bool,
    /// Time limit for one blob transfer, both legs included.
    pub transfer_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
            concurrency: 4,
            adaptive: false,
            transfer_timeout: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

impl MigrateOptions {
    pub fn validate(&self) -> SyncResult<()> {
        if self.concurrency == 0 {
            return Err(SyncError::InvalidOptions("concurrency must be at least 1".into()));
        }
        if self.transfer_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SyncError::InvalidOptions("transfer timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of one one-way pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PassReport {
    pub direction: Direction,
    pub transferred: Vec<ObjectId>,
    pub skipped: Vec<ObjectId>,
    pub failed: Vec<BlobFailure>,
    /// Uncompressed bytes moved.
    pub bytes: u64,
}

impl PassReport {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            transferred: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            bytes: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MigrateReport {
    pub passes: Vec<PassReport>,
}

impl MigrateReport {
    pub fn transferred(&self) -> usize {
        self.passes.iter().map(|p| p.transferred.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.passes.iter().map(|p| p.skipped.len()).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &BlobFailure> {
        self.passes.iter().flat_map(|p| p.failed.iter())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}
