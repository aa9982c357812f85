use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgit_blob::{BlobError, BlobStore, Locator, PutHints};
use ledgit_store::Commit;
use ledgit_types::ObjectId;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Content type recorded for stored commit objects.
pub const COMMIT_CONTENT_TYPE: &str = "application/vnd.ledgit.commit+json";

/// The ledger's acknowledgement of a pointer move.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfirmation {
    pub confirmation_id: Uuid,
    pub repository_id: String,
    pub root: ObjectId,
    /// Position of this update in the repository's history, starting at 1.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_locator: Option<Locator>,
    pub confirmed_at: DateTime<Utc>,
}

/// Write boundary for the repository's commit pointer.
#[async_trait]
pub trait CommitLedger: Send + Sync + fmt::Debug {
    async fn update_commit_pointer(
        &self,
        repository_id: &str,
        new_root: ObjectId,
        auxiliary_locator: Option<Locator>,
    ) -> SyncResult<LedgerConfirmation>;

    async fn current_pointer(&self, repository_id: &str) -> SyncResult<Option<ObjectId>>;
}

/// In-memory ledger for tests and local demos.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    streams: RwLock<HashMap<String, Vec<LedgerConfirmation>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every confirmation issued for `repository_id`, oldest first.
    pub fn history(&self, repository_id: &str) -> Vec<LedgerConfirmation> {
        self.streams
            .read()
            .expect("ledger lock poisoned")
            .get(repository_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommitLedger for InMemoryLedger {
    async fn update_commit_pointer(
        &self,
        repository_id: &str,
        new_root: ObjectId,
        auxiliary_locator: Option<Locator>,
    ) -> SyncResult<LedgerConfirmation> {
        if repository_id.trim().is_empty() {
            return Err(SyncError::LedgerRejected {
                repository: repository_id.to_string(),
                reason: "repository id is empty".into(),
            });
        }
        if new_root.is_null() {
            return Err(SyncError::LedgerRejected {
                repository: repository_id.to_string(),
                reason: "root hash is null".into(),
            });
        }
        let mut streams = self.streams.write().expect("ledger lock poisoned");
        let stream = streams.entry(repository_id.to_string()).or_default();
        let confirmation = LedgerConfirmation {
            confirmation_id: Uuid::now_v7(),
            repository_id: repository_id.to_string(),
            root: new_root,
            sequence: stream.len() as u64 + 1,
            auxiliary_locator,
            confirmed_at: Utc::now(),
        };
        stream.push(confirmation.clone());
        Ok(confirmation)
    }

    async fn current_pointer(&self, repository_id: &str) -> SyncResult<Option<ObjectId>> {
        Ok(self
            .streams
            .read()
            .expect("ledger lock poisoned")
            .get(repository_id)
            .and_then(|s| s.last())
            .map(|c| c.root))
    }
}

/// Store `commit` at every configured location, then move the
/// repository's pointer to it.
///
/// The ledger is not contacted unless storage succeeded, so a confirmed
/// pointer always refers to a retrievable commit. The commit's remote
/// locator, when there is one, travels with the update.
pub async fn publish_commit(
    store: &BlobStore,
    ledger: &dyn CommitLedger,
    repository_id: &str,
    commit: &Commit,
) -> SyncResult<LedgerConfirmation> {
    let bytes = commit.to_bytes().map_err(BlobError::from)?;
    let hints = PutHints::at(store.configured_locations()).with_content_type(COMMIT_CONTENT_TYPE);
    let stored = store.put(&bytes, hints).await?;

    let confirmation = ledger
        .update_commit_pointer(repository_id, commit.hash(), stored.meta.remote_locator.clone())
        .await?;
    info!(
        repository = repository_id,
        commit = %commit.hash().short_hex(),
        blob = %stored.hash().short_hex(),
        sequence = confirmation.sequence,
        "commit published"
    );
    Ok(confirmation)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ledgit_blob::{BlobStoreConfig, MemoryRemote, RemoteStorage};
    use ledgit_resilience::{ErrorKind, RemoteError, ResilienceConfig, ResilienceContext, RetryPolicy};
    use ledgit_store::{build_commit, build_tree, CommitFields, InMemoryObjectStore, TreeEntry};

    use super::*;

    fn store(remote: Arc<MemoryRemote>) -> BlobStore {
        let resilience = ResilienceContext::new(ResilienceConfig {
            retry: RetryPolicy::none(),
            ..ResilienceConfig::default()
        })
        .unwrap();
        BlobStore::new(
            BlobStoreConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            Some(remote as Arc<dyn RemoteStorage>),
            Arc::new(resilience),
        )
        .unwrap()
    }

    fn commit(message: &str) -> Commit {
        let (tree, _) = build_tree([TreeEntry::blob("README.md", ObjectId::from_bytes(b"readme"))]).unwrap();
        build_commit(CommitFields {
            parent_hash: None,
            author_id: "ada".into(),
            message: message.into(),
            timestamp: Utc::now(),
            root_tree_hash: tree,
        })
        .unwrap()
        .1
    }

    #[tokio::test]
    async fn publish_stores_then_updates_pointer() {
        let remote = Arc::new(MemoryRemote::new("mem"));
        let store = store(remote.clone());
        let ledger = InMemoryLedger::new();
        let c = commit("initial");

        let confirmation = publish_commit(&store, &ledger, "repo-1", &c).await.unwrap();
        assert_eq!(confirmation.sequence, 1);
        assert_eq!(confirmation.root, c.hash());
        assert!(confirmation.auxiliary_locator.is_some());
        assert_eq!(ledger.current_pointer("repo-1").await.unwrap(), Some(c.hash()));

        let stored = store.get(&ledgit_store::identify(&c.to_bytes().unwrap()), None).await.unwrap();
        assert_eq!(Commit::from_bytes(&c.hash(), &stored).unwrap(), c);
    }

    #[tokio::test]
    async fn failed_storage_never_reaches_the_ledger() {
        let remote = Arc::new(MemoryRemote::new("mem"));
        remote.fail_always(RemoteError::PermissionDenied("read-only bucket".into()));
        let store = store(remote);
        let ledger = InMemoryLedger::new();

        let err = publish_commit(&store, &ledger, "repo-1", &commit("doomed")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(ledger.history("repo-1").is_empty());
    }

    #[tokio::test]
    async fn sequences_advance_per_repository() {
        let ledger = InMemoryLedger::new();
        let a = ObjectId::from_bytes(b"a");
        let b = ObjectId::from_bytes(b"b");
        ledger.update_commit_pointer("repo-1", a, None).await.unwrap();
        let second = ledger.update_commit_pointer("repo-1", b, None).await.unwrap();
        let other = ledger.update_commit_pointer("repo-2", a, None).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(other.sequence, 1);
        assert_eq!(ledger.history("repo-1").len(), 2);

        assert!(ledger.update_commit_pointer("", a, None).await.is_err());
        assert!(ledger.update_commit_pointer("repo-1", ObjectId::null(), None).await.is_err());
    }
}
