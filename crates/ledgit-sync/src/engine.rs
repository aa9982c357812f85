use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ledgit_blob::{BlobFailure, BlobStore, CopyOutcome, Targets};
use ledgit_resilience::ErrorKind;
use ledgit_types::{ObjectId, StorageLocation};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::progress::{Progress, ProgressEvent};
use crate::types::{Direction, MigrateOptions, MigrateReport, PassReport};

type TransferResult = Result<CopyOutcome, BlobFailure>;
type Joined = Result<(Id, (ObjectId, TransferResult)), JoinError>;

/// Moves blobs between the local and remote halves of a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct SyncEngine {
    store: Arc<BlobStore>,
}

impl SyncEngine {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Copy blobs in `direction`. `Both` runs the two one-way passes one
    /// after the other and reports them separately.
    ///
    /// Per-blob failures land in the pass's `failed` list and never abort
    /// the run. Once `options.cancel` fires, blobs not yet started are
    /// reported as skipped; transfers already running are aborted and
    /// reported as failed with kind `cancelled`.
    pub async fn migrate(
        &self,
        direction: Direction,
        targets: Targets,
        options: MigrateOptions,
    ) -> SyncResult<MigrateReport> {
        options.validate()?;
        if !self.store.has_remote() {
            return Err(SyncError::NoRemote);
        }
        let progress = Progress::new(options.progress.clone());
        let mut report = MigrateReport::default();
        for pass in direction.passes() {
            report
                .passes
                .push(self.run_pass(pass, &targets, &options, &progress).await);
            self.store.flush_index().await?;
        }
        Ok(report)
    }

    fn concurrency_limit(&self, options: &MigrateOptions) -> usize {
        if options.adaptive {
            let recommended = self.store.resilience().recommendations().concurrency.max(1);
            options.concurrency.min(recommended)
        } else {
            options.concurrency
        }
    }

    async fn run_pass(
        &self,
        direction: Direction,
        targets: &Targets,
        options: &MigrateOptions,
        progress: &Progress,
    ) -> PassReport {
        let mut report = PassReport::new(direction);
        let Some((from, to)) = direction.endpoints() else {
            return report;
        };
        let candidates = match targets {
            Targets::All => self.store.inventory(from),
            Targets::Only(list) => list.clone(),
        };
        let limit = self.concurrency_limit(options);
        info!(%direction, candidates = candidates.len(), concurrency = limit, "migration pass started");
        progress.emit(ProgressEvent::Started {
            direction,
            total: candidates.len(),
        });

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<(ObjectId, TransferResult)> = JoinSet::new();
        let mut running: HashMap<Id, ObjectId> = HashMap::new();

        for hash in candidates {
            let permit = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                progress.emit(ProgressEvent::Skipped { hash });
                report.skipped.push(hash);
                continue;
            };
            while let Some(joined) = tasks.try_join_next_with_id() {
                absorb(joined, &mut running, &mut report, progress);
            }

            let store = Arc::clone(&self.store);
            let cancel = options.cancel.clone();
            let skip_existing = options.skip_existing;
            let timeout = options.transfer_timeout;
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let result = transfer(&store, hash, from, to, skip_existing, timeout, &cancel).await;
                (hash, result)
            });
            running.insert(handle.id(), hash);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            absorb(joined, &mut running, &mut report, progress);
        }

        info!(
            %direction,
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            bytes = report.bytes,
            "migration pass finished"
        );
        progress.emit(ProgressEvent::Finished {
            direction,
            transferred: report.transferred.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
        });
        report
    }
}

async fn transfer(
    store: &BlobStore,
    hash: ObjectId,
    from: StorageLocation,
    to: StorageLocation,
    skip_existing: bool,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> TransferResult {
    let copy = store.copy_to(&hash, from, to, skip_existing, cancel);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, copy).await {
            Ok(result) => result,
            Err(_) => {
                return Err(BlobFailure {
                    hash,
                    kind: ErrorKind::TransientNetwork,
                    message: format!("transfer timed out after {}ms", limit.as_millis()),
                })
            }
        },
        None => copy.await,
    };
    result.map_err(|e| BlobFailure::new(hash, &e))
}

fn absorb(joined: Joined, running: &mut HashMap<Id, ObjectId>, report: &mut PassReport, progress: &Progress) {
    let (hash, result) = match joined {
        Ok((id, outcome)) => {
            running.remove(&id);
            outcome
        }
        Err(e) => {
            let Some(hash) = running.remove(&e.id()) else {
                return;
            };
            warn!(hash = %hash.short_hex(), error = %e, "transfer task died");
            let failure = BlobFailure {
                hash,
                kind: ErrorKind::Fatal,
                message: format!("transfer task failed: {e}"),
            };
            (hash, Err(failure))
        }
    };

    match result {
        Ok(CopyOutcome::Copied { bytes }) => {
            debug!(hash = %hash.short_hex(), bytes, "transferred");
            report.transferred.push(hash);
            report.bytes += bytes;
            progress.emit(ProgressEvent::Transferred { hash, bytes });
        }
        Ok(CopyOutcome::Skipped) => {
            report.skipped.push(hash);
            progress.emit(ProgressEvent::Skipped { hash });
        }
        Err(failure) => {
            debug!(hash = %hash.short_hex(), kind = %failure.kind, error = %failure.message, "transfer failed");
            progress.emit(ProgressEvent::Failed {
                hash,
                kind: failure.kind,
                message: failure.message.clone(),
            });
            report.failed.push(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use ledgit_blob::{BlobStoreConfig, MemoryRemote, PutHints, RemoteStorage};
    use ledgit_resilience::{
        BreakerConfig, BreakerState, ManualClock, RemoteError, ResilienceConfig, ResilienceContext, RetryPolicy,
    };
    use ledgit_store::{identify, InMemoryObjectStore, ObjectStore};
    use ledgit_types::LocationSet;
    use tokio::sync::mpsc;

    use super::*;

    struct Fixture {
        engine: SyncEngine,
        local: Arc<InMemoryObjectStore>,
        remote: Arc<MemoryRemote>,
    }

    fn fixture() -> Fixture {
        let resilience = ResilienceContext::new(ResilienceConfig {
            retry: RetryPolicy::none(),
            ..ResilienceConfig::default()
        })
        .unwrap();
        fixture_with(resilience)
    }

    fn fixture_with(resilience: ResilienceContext) -> Fixture {
        let local = Arc::new(InMemoryObjectStore::new());
        let remote = Arc::new(MemoryRemote::new("mem"));
        let store = BlobStore::new(
            BlobStoreConfig::default(),
            local.clone(),
            Some(remote.clone() as Arc<dyn RemoteStorage>),
            Arc::new(resilience),
        )
        .unwrap();
        Fixture {
            engine: SyncEngine::new(Arc::new(store)),
            local,
            remote,
        }
    }

    async fn seed(f: &Fixture, n: usize) -> Vec<ObjectId> {
        let mut hashes = Vec::new();
        for i in 0..n {
            let r = f
                .engine
                .store()
                .put(format!("blob number {i}").as_bytes(), PutHints::default())
                .await
                .unwrap();
            hashes.push(r.hash());
        }
        hashes
    }

    #[tokio::test]
    async fn second_migration_skips_everything() {
        let f = fixture();
        let x = seed(&f, 1).await[0];

        let first = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(first.passes[0].transferred, vec![x]);

        let second = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(second.transferred(), 0);
        assert_eq!(second.passes[0].skipped, vec![x]);
        assert_eq!(f.remote.put_calls(), 1);
        assert!(f.local.exists(&x).unwrap());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let f = fixture();
        seed(&f, 12).await;
        f.remote.set_latency(Duration::from_millis(20));
        let options = MigrateOptions {
            concurrency: 3,
            ..MigrateOptions::default()
        };
        let report = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();
        assert_eq!(report.transferred(), 12);
        assert!(f.remote.max_concurrency() <= 3);
        assert!(f.remote.max_concurrency() >= 2);
    }

    #[tokio::test]
    async fn failures_are_collected_per_blob() {
        let f = fixture();
        seed(&f, 3).await;
        f.remote.fail_next_put(RemoteError::QuotaExceeded("bucket full".into()));
        let options = MigrateOptions {
            concurrency: 1,
            ..MigrateOptions::default()
        };
        let report = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();
        assert_eq!(report.transferred(), 2);
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn timed_out_trial_does_not_wedge_the_breaker() {
        let clock = Arc::new(ManualClock::default());
        let config = ResilienceConfig {
            retry: RetryPolicy::none(),
            breaker: BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            ..ResilienceConfig::default()
        };
        let f = fixture_with(ResilienceContext::with_clock(config, clock.clone()).unwrap());
        let x = seed(&f, 1).await[0];
        let resilience = Arc::clone(f.engine.store().resilience());

        f.remote.fail_next_put(RemoteError::Transient("503".into()));
        let first = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(first.failed().count(), 1);
        assert_eq!(resilience.breaker_state("mem"), BreakerState::Open);

        clock.advance(Duration::from_secs(30));
        f.remote.set_latency(Duration::from_millis(500));
        let options = MigrateOptions {
            transfer_timeout: Some(Duration::from_millis(20)),
            ..MigrateOptions::default()
        };
        let timed_out = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();
        let failed: Vec<_> = timed_out.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ErrorKind::TransientNetwork);
        assert_eq!(resilience.breaker_state("mem"), BreakerState::HalfOpen);

        f.remote.set_latency(Duration::ZERO);
        let recovered = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(recovered.passes[0].transferred, vec![x]);
        assert_eq!(resilience.breaker_state("mem"), BreakerState::Closed);
        assert_eq!(f.engine.store().meta(&x).unwrap().locations, LocationSet::both());
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_all() {
        let f = fixture();
        seed(&f, 4).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = MigrateOptions {
            cancel,
            ..MigrateOptions::default()
        };
        let report = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();
        assert_eq!(report.skipped(), 4);
        assert_eq!(f.remote.put_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_run_fails_in_flight_and_skips_the_rest() {
        let f = fixture();
        seed(&f, 6).await;
        f.remote.set_latency(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let options = MigrateOptions {
            concurrency: 2,
            cancel: cancel.clone(),
            ..MigrateOptions::default()
        };
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let report = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();
        canceller.await.unwrap();

        let pass = &report.passes[0];
        assert_eq!(pass.failed.len(), 2);
        assert!(pass.failed.iter().all(|e| e.kind == ErrorKind::Cancelled));
        assert_eq!(pass.skipped.len(), 4);
    }

    #[tokio::test]
    async fn both_directions_report_separately() {
        let f = fixture();
        let local = seed(&f, 1).await[0];
        let remote_only = f
            .engine
            .store()
            .put(b"only remote", PutHints::at(LocationSet::remote()))
            .await
            .unwrap()
            .hash();

        let report = f
            .engine
            .migrate(Direction::Both, Targets::All, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(report.passes.len(), 2);
        assert_eq!(report.passes[0].direction, Direction::LocalToRemote);
        assert_eq!(report.passes[0].transferred, vec![local]);
        assert_eq!(report.passes[1].direction, Direction::RemoteToLocal);
        // The local blob now exists remotely but was already local.
        assert_eq!(report.passes[1].transferred, vec![remote_only]);
        assert_eq!(report.passes[1].skipped, vec![local]);
    }

    #[tokio::test]
    async fn explicit_targets_and_missing_blobs() {
        let f = fixture();
        let hashes = seed(&f, 3).await;
        let unknown = identify(b"never stored");
        let targets = Targets::Only(vec![hashes[1], unknown]);
        let report = f
            .engine
            .migrate(Direction::LocalToRemote, targets, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(report.passes[0].transferred, vec![hashes[1]]);
        assert_eq!(report.passes[0].failed[0].hash, unknown);
        assert_eq!(report.passes[0].failed[0].kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn progress_events_are_produced() {
        let f = fixture();
        seed(&f, 2).await;
        let (tx, mut rx) = mpsc::channel(16);
        let options = MigrateOptions {
            progress: Some(tx),
            ..MigrateOptions::default()
        };
        f.engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], ProgressEvent::Started { total: 2, .. }));
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { transferred: 2, .. })));
    }

    #[tokio::test]
    async fn slow_progress_consumer_does_not_block() {
        let f = fixture();
        seed(&f, 5).await;
        let (tx, _rx) = mpsc::channel(1);
        let options = MigrateOptions {
            progress: Some(tx),
            ..MigrateOptions::default()
        };
        let report = f
            .engine
            .migrate(Direction::LocalToRemote, Targets::All, options)
            .await
            .unwrap();
        assert_eq!(report.transferred(), 5);
    }

    #[tokio::test]
    async fn migrate_without_remote_is_structural() {
        let store = BlobStore::new(
            BlobStoreConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            None,
            Arc::new(ResilienceContext::new(ResilienceConfig::default()).unwrap()),
        )
        .unwrap();
        let engine = SyncEngine::new(Arc::new(store));
        let err = engine
            .migrate(Direction::LocalToRemote, Targets::All, MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoRemote));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn local_copy_survives_pull() {
        let f = fixture();
        let h = f
            .engine
            .store()
            .put(b"pulled", PutHints::at(LocationSet::remote()))
            .await
            .unwrap()
            .hash();
        f.engine
            .migrate(Direction::RemoteToLocal, Targets::All, MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(f.engine.store().get(&h, None).await.unwrap(), b"pulled");
        assert_eq!(f.engine.store().meta(&h).unwrap().locations, LocationSet::both());
        assert!(f.local.exists(&h).unwrap());
    }
}
