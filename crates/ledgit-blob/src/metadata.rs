use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ledgit_types::{LocationSet, ObjectId, StorageLocation};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::{BlobError, BlobResult};
use crate::remote::Locator;

/// Metadata for one blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Identity of the uncompressed content.
    pub hash: ObjectId,
    pub size: u64,
    /// Stored frame size (manifest plus chunks when chunked).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub locations: LocationSet,
    pub chunked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunk_hashes: Vec<ObjectId>,
    /// Puts that resolved to this blob, minus releases.
    pub ref_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_locator: Option<Locator>,
    pub created_at: DateTime<Utc>,
}

impl BlobMeta {
    pub fn new(hash: ObjectId, size: u64) -> Self {
        Self {
            hash,
            size,
            compressed_size: None,
            content_type: None,
            locations: LocationSet::new(),
            chunked: false,
            chunk_hashes: Vec::new(),
            ref_count: 0,
            remote_locator: None,
            created_at: Utc::now(),
        }
    }
}

/// Metadata for one chunk shared by chunked blobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub hash: ObjectId,
    pub size: u64,
    pub locations: LocationSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_locator: Option<Locator>,
    /// Blobs whose manifest lists this chunk.
    pub ref_count: u64,
}

/// Everything the manager knows about stored blobs.
///
/// Persisted as pretty JSON so it can be inspected by hand.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataIndex {
    #[serde(default)]
    pub blobs: BTreeMap<ObjectId, BlobMeta>,
    #[serde(default)]
    pub chunks: BTreeMap<ObjectId, ChunkMeta>,
    /// Legacy key -> canonical blob hash.
    #[serde(default)]
    pub aliases: BTreeMap<ObjectId, ObjectId>,
}

impl MetadataIndex {
    pub fn resolve(&self, id: &ObjectId) -> ObjectId {
        self.aliases.get(id).copied().unwrap_or(*id)
    }

    pub fn blob(&self, id: &ObjectId) -> Option<&BlobMeta> {
        self.blobs.get(&self.resolve(id))
    }

    /// Blob hashes stored at `location`, sorted.
    pub fn inventory(&self, location: StorageLocation) -> Vec<ObjectId> {
        self.blobs
            .values()
            .filter(|m| m.locations.contains(location))
            .map(|m| m.hash)
            .collect()
    }

    /// Chunks referenced by blobs that have a copy at `location`.
    pub fn chunks_needed_at(&self, location: StorageLocation) -> BTreeSet<ObjectId> {
        self.blobs
            .values()
            .filter(|m| m.chunked && m.locations.contains(location))
            .flat_map(|m| m.chunk_hashes.iter().copied())
            .collect()
    }

    /// Recompute every chunk's ref count from the blob manifests.
    pub fn recount_chunk_refs(&mut self) {
        let mut counts: HashMap<ObjectId, u64> = HashMap::new();
        for meta in self.blobs.values().filter(|m| m.chunked) {
            for hash in &meta.chunk_hashes {
                *counts.entry(*hash).or_insert(0) += 1;
            }
        }
        for (hash, chunk) in self.chunks.iter_mut() {
            chunk.ref_count = counts.get(hash).copied().unwrap_or(0);
        }
    }

    /// Write the index atomically.
    pub fn save(&self, path: &Path) -> BlobResult<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| BlobError::Io(e.error))?;
        Ok(())
    }

    /// Load an index; a missing file yields an empty index.
    pub fn load(path: &Path) -> BlobResult<Self> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Per-hash async locks serializing work on one blob.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
}

const PRUNE_AT: usize = 1024;

impl KeyLocks {
    pub(crate) async fn lock(&self, id: ObjectId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().expect("lock table poisoned");
            if map.len() >= PRUNE_AT {
                map.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(map.entry(id).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(content: &[u8], locations: LocationSet) -> BlobMeta {
        let mut m = BlobMeta::new(ledgit_store::identify(content), content.len() as u64);
        m.locations = locations;
        m.ref_count = 1;
        m
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("index.json");
        let mut index = MetadataIndex::default();
        let m = meta(b"hello", LocationSet::both());
        index.blobs.insert(m.hash, m.clone());
        index.aliases.insert(ObjectId::from_bytes(b"hello"), m.hash);

        index.save(&path).unwrap();
        let loaded = MetadataIndex::load(&path).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.resolve(&ObjectId::from_bytes(b"hello")), m.hash);
    }

    #[test]
    fn missing_index_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = MetadataIndex::load(&dir.path().join("none.json")).unwrap();
        assert!(loaded.blobs.is_empty());
    }

    #[test]
    fn inventory_filters_by_location() {
        let mut index = MetadataIndex::default();
        for (content, locs) in [
            (&b"a"[..], LocationSet::local()),
            (b"b", LocationSet::remote()),
            (b"c", LocationSet::both()),
        ] {
            let m = meta(content, locs);
            index.blobs.insert(m.hash, m);
        }
        assert_eq!(index.inventory(StorageLocation::Local).len(), 2);
        assert_eq!(index.inventory(StorageLocation::Remote).len(), 2);
    }

    #[test]
    fn chunk_refs_are_recounted() {
        let mut index = MetadataIndex::default();
        let chunk = ObjectId::from_bytes(b"chunk");
        index.chunks.insert(
            chunk,
            ChunkMeta {
                hash: chunk,
                size: 5,
                locations: LocationSet::local(),
                remote_locator: None,
                ref_count: 0,
            },
        );
        for content in [&b"x"[..], b"y"] {
            let mut m = meta(content, LocationSet::local());
            m.chunked = true;
            m.chunk_hashes = vec![chunk];
            index.blobs.insert(m.hash, m);
        }
        index.recount_chunk_refs();
        assert_eq!(index.chunks[&chunk].ref_count, 2);
        assert!(index.chunks_needed_at(StorageLocation::Local).contains(&chunk));
        assert!(index.chunks_needed_at(StorageLocation::Remote).is_empty());
    }

    #[tokio::test]
    async fn key_locks_serialize_same_key() {
        let locks = Arc::new(KeyLocks::default());
        let id = ObjectId::from_bytes(b"k");
        let guard = locks.lock(id).await;
        let other = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(id).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!other.is_finished());
        drop(guard);
        other.await.unwrap();
    }
}
