use ledgit_resilience::ErrorKind;
use ledgit_types::ObjectId;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::Direction;

/// Migration progress, delivered best-effort on a bounded channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { direction: Direction, total: usize },
    Transferred { hash: ObjectId, bytes: u64 },
    Skipped { hash: ObjectId },
    Failed { hash: ObjectId, kind: ErrorKind, message: String },
    Finished {
        direction: Direction,
        transferred: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Producer side of the progress channel. A full or closed channel drops
/// the event; the engine never waits on a consumer.
#[derive(Clone, Debug, Default)]
pub(crate) struct Progress(Option<mpsc::Sender<ProgressEvent>>);

impl Progress {
    pub(crate) fn new(sender: Option<mpsc::Sender<ProgressEvent>>) -> Self {
        Self(sender)
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.0 {
            if let Err(e) = tx.try_send(event) {
                trace!(error = %e, "progress event dropped");
            }
        }
    }
}
