use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use ledgit_resilience::{CallTarget, ErrorKind, FailureCategory, ResilienceContext};
use ledgit_store::{identify, ObjectStore};
use ledgit_types::{LocationSet, ObjectId, StorageLocation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkManifest, ChunkRef};
use crate::codec::{self, Decoded};
use crate::config::BlobStoreConfig;
use crate::error::{BlobError, BlobResult};
use crate::metadata::{BlobMeta, ChunkMeta, KeyLocks, MetadataIndex};
use crate::remote::{Locator, RemoteStorage};
use crate::types::{BlobRef, CopyOutcome, PutHints, RebuildReport, StoreStats};

/// Component name for failures the manager itself detects.
pub(crate) const COMPONENT: &str = "blob-store";

/// Content encoded for storage.
pub(crate) enum Encoded {
    Whole {
        frame: Vec<u8>,
    },
    Chunked {
        manifest: ChunkManifest,
        manifest_frame: Vec<u8>,
        chunks: Vec<EncodedChunk>,
    },
}

pub(crate) struct EncodedChunk {
    hash: ObjectId,
    size: u64,
    frame: Vec<u8>,
}

impl Encoded {
    pub(crate) fn stored_size(&self) -> u64 {
        match self {
            Self::Whole { frame } => frame.len() as u64,
            Self::Chunked {
                manifest_frame,
                chunks,
                ..
            } => manifest_frame.len() as u64 + chunks.iter().map(|c| c.frame.len() as u64).sum::<u64>(),
        }
    }
}

/// The blob store manager.
///
/// Owns the metadata index and routes content between the local object
/// store and an optional remote backend. Work on a single blob hash is
/// serialized by a per-hash async lock; the index itself sits behind a
/// short-lived `RwLock` that is never held across an await.
pub struct BlobStore {
    pub(crate) config: BlobStoreConfig,
    pub(crate) local: Arc<dyn ObjectStore>,
    pub(crate) remote: Option<Arc<dyn RemoteStorage>>,
    pub(crate) resilience: Arc<ResilienceContext>,
    pub(crate) index: RwLock<MetadataIndex>,
    pub(crate) locks: KeyLocks,
    /// The index changed since it was last written to `index_path`.
    dirty: AtomicBool,
    /// Serializes flushes so an older snapshot never lands after a newer one.
    flushing: tokio::sync::Mutex<()>,
}

impl BlobStore {
    /// Build a manager. Loads the metadata index from `config.index_path`
    /// when one is set.
    pub fn new(
        config: BlobStoreConfig,
        local: Arc<dyn ObjectStore>,
        remote: Option<Arc<dyn RemoteStorage>>,
        resilience: Arc<ResilienceContext>,
    ) -> BlobResult<Self> {
        config.validate()?;
        let index = match &config.index_path {
            Some(path) => MetadataIndex::load(path)?,
            None => MetadataIndex::default(),
        };
        Ok(Self {
            config,
            local,
            remote,
            resilience,
            index: RwLock::new(index),
            locks: KeyLocks::default(),
            dirty: AtomicBool::new(false),
            flushing: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    pub fn resilience(&self) -> &Arc<ResilienceContext> {
        &self.resilience
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Locations this store can write to.
    pub fn configured_locations(&self) -> LocationSet {
        if self.has_remote() {
            LocationSet::both()
        } else {
            LocationSet::local()
        }
    }

    /// Metadata for a blob, resolving legacy aliases.
    pub fn meta(&self, hash: &ObjectId) -> Option<BlobMeta> {
        self.read_index().blob(hash).cloned()
    }

    /// A copy of the whole metadata index.
    pub fn index_snapshot(&self) -> MetadataIndex {
        self.read_index().clone()
    }

    /// Store content, deduplicating against existing blobs.
    pub async fn put(&self, content: &[u8], hints: PutHints) -> BlobResult<BlobRef> {
        let locations = hints
            .locations
            .clone()
            .unwrap_or_else(|| self.config.default_locations.clone());
        self.check_locations(&locations)?;
        if content.is_empty() && !self.config.allow_empty {
            return Err(BlobError::Validation("empty content is not allowed".into()));
        }
        if content.len() as u64 > self.config.max_blob_size {
            return Err(BlobError::Validation(format!(
                "content of {} bytes exceeds max_blob_size {}",
                content.len(),
                self.config.max_blob_size
            )));
        }

        let hash = identify(content);
        let _guard = self.locks.lock(hash).await;

        let missing = {
            let mut index = self.write_index();
            match index.blobs.get_mut(&hash) {
                Some(meta) if meta.locations.covers(&locations) => {
                    meta.ref_count += 1;
                    if meta.content_type.is_none() {
                        meta.content_type = hints.content_type.clone();
                    }
                    debug!(hash = %hash.short_hex(), refs = meta.ref_count, "put deduplicated");
                    Err(meta.clone())
                }
                Some(meta) => Ok(locations.missing_from(&meta.locations)),
                None => Ok(locations.iter().collect()),
            }
        };
        let missing: Vec<_> = match missing {
            Ok(missing) => missing,
            Err(meta) => {
                self.mark_dirty();
                self.flush_index().await?;
                return Ok(BlobRef {
                    meta,
                    deduplicated: true,
                });
            }
        };

        let encoded = self.encode(content)?;
        self.prepare_meta(hash, content.len() as u64, &encoded);

        let cancel = CancellationToken::new();
        for location in missing {
            if let Err(e) = self.write_to(location, hash, &encoded, false, &cancel).await {
                self.discard_if_unstored(&hash);
                self.mark_dirty();
                self.flush_index().await?;
                return Err(e);
            }
        }

        let meta = {
            let mut index = self.write_index();
            let meta = index.blobs.get_mut(&hash).ok_or(BlobError::NotFound(hash))?;
            meta.ref_count += 1;
            if meta.content_type.is_none() {
                meta.content_type = hints.content_type;
            }
            let meta = meta.clone();
            if meta.chunked {
                index.recount_chunk_refs();
            }
            meta
        };
        self.mark_dirty();
        self.flush_index().await?;
        debug!(
            hash = %hash.short_hex(),
            size = meta.size,
            stored = meta.compressed_size.unwrap_or_default(),
            locations = %meta.locations,
            "blob stored"
        );
        Ok(BlobRef {
            meta,
            deduplicated: false,
        })
    }

    /// Fetch content by hash, verifying it before returning.
    ///
    /// Local is tried first unless `preferred` is `Remote`. A corrupt copy
    /// falls through to the other location.
    pub async fn get(&self, hash: &ObjectId, preferred: Option<StorageLocation>) -> BlobResult<Vec<u8>> {
        let hash = self.resolve(hash);
        let cancel = CancellationToken::new();
        let order = match preferred {
            Some(StorageLocation::Remote) => [StorageLocation::Remote, StorageLocation::Local],
            _ => [StorageLocation::Local, StorageLocation::Remote],
        };

        let mut last_err = None;
        for location in order {
            let result = match location {
                StorageLocation::Local => match self.read_local(hash) {
                    Ok(Some(content)) => Ok(content),
                    Ok(None) => continue,
                    Err(e) => Err(e),
                },
                StorageLocation::Remote => {
                    if !self.has_remote_copy(&hash) {
                        continue;
                    }
                    self.read_remote(hash, &cancel).await
                }
            };
            match result {
                Ok(content) => {
                    if location == StorageLocation::Remote && self.config.promote_on_fetch {
                        if let Err(e) = self.promote(hash, &content).await {
                            warn!(hash = %hash.short_hex(), error = %e, "promotion to local failed");
                        }
                    }
                    return Ok(content);
                }
                Err(e) => {
                    warn!(hash = %hash.short_hex(), %location, error = %e, "copy unusable, trying next location");
                    if e.kind() == ErrorKind::Integrity {
                        self.record_integrity_failure("get");
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(BlobError::NotFound(hash)))
    }

    /// Drop one reference. At zero the blob becomes eligible for cleaning.
    pub async fn release(&self, hash: &ObjectId) -> BlobResult<u64> {
        let hash = self.resolve(hash);
        let _guard = self.locks.lock(hash).await;
        let remaining = {
            let mut index = self.write_index();
            let meta = index.blobs.get_mut(&hash).ok_or(BlobError::NotFound(hash))?;
            meta.ref_count = meta.ref_count.saturating_sub(1);
            meta.ref_count
        };
        self.mark_dirty();
        self.flush_index().await?;
        debug!(hash = %hash.short_hex(), refs = remaining, "reference released");
        Ok(remaining)
    }

    /// Copy one blob between locations.
    ///
    /// With `skip_existing`, a destination copy that re-hashes correctly is
    /// left alone. The source copy is never removed. The index is only
    /// marked dirty; batch callers flush once with [`Self::flush_index`].
    pub async fn copy_to(
        &self,
        hash: &ObjectId,
        from: StorageLocation,
        to: StorageLocation,
        skip_existing: bool,
        cancel: &CancellationToken,
    ) -> BlobResult<CopyOutcome> {
        if from == to {
            return Err(BlobError::Validation(format!("cannot copy {from} to itself")));
        }
        self.check_locations(&LocationSet::of(&[from, to]))?;
        let hash = self.resolve(hash);
        let _guard = self.locks.lock(hash).await;

        let meta = self.meta(&hash).ok_or(BlobError::NotFound(hash))?;
        if skip_existing && meta.locations.contains(to) {
            match self.read_at(to, hash, cancel).await {
                Ok(_) => {
                    debug!(hash = %hash.short_hex(), %to, "destination verified, skipping");
                    return Ok(CopyOutcome::Skipped);
                }
                Err(e) if e.is_location_failure() => {
                    debug!(hash = %hash.short_hex(), %to, error = %e, "destination copy unusable, transferring");
                }
                Err(e) => return Err(e),
            }
        }

        let content = self.read_at(from, hash, cancel).await?;
        let encoded = self.encode(&content)?;
        self.write_to(to, hash, &encoded, true, cancel).await?;
        self.mark_dirty();
        debug!(hash = %hash.short_hex(), %from, %to, size = content.len(), "blob copied");
        Ok(CopyOutcome::Copied {
            bytes: content.len() as u64,
        })
    }

    /// One `exists` round trip to the remote backend, so the health monitor
    /// and breaker see a fresh sample. Probes a known remote object when
    /// there is one.
    pub async fn probe_remote(&self, cancel: &CancellationToken) -> BlobResult<bool> {
        let remote = Arc::clone(self.remote()?);
        let locator = self
            .read_index()
            .blobs
            .values()
            .find_map(|m| m.remote_locator.clone())
            .unwrap_or_else(|| Locator::new("ledgit-probe"));
        let target = CallTarget::new(remote.backend_id(), "exists");
        let found = self
            .resilience
            .call(target, cancel, || {
                let remote = Arc::clone(&remote);
                let locator = locator.clone();
                async move { remote.exists(&locator).await }
            })
            .await?;
        Ok(found)
    }

    /// Blob hashes recorded at `location`, sorted.
    pub fn inventory(&self, location: StorageLocation) -> Vec<ObjectId> {
        self.read_index().inventory(location)
    }

    pub fn stats(&self) -> BlobResult<StoreStats> {
        let mut stats = {
            let index = self.read_index();
            StoreStats {
                unique_blobs: index.blobs.len(),
                total_references: index.blobs.values().map(|m| m.ref_count).sum(),
                chunk_count: index.chunks.len(),
                alias_count: index.aliases.len(),
                local_blobs: index.inventory(StorageLocation::Local).len(),
                remote_blobs: index.inventory(StorageLocation::Remote).len(),
                logical_bytes: index.blobs.values().map(|m| m.size).sum(),
                local_stored_bytes: 0,
            }
        };
        for id in self.local.list()? {
            stats.local_stored_bytes += self.local.size_of(&id)?.unwrap_or(0);
        }
        Ok(stats)
    }

    /// Re-derive local metadata by scanning the local object store.
    ///
    /// Remote knowledge (locators) is kept; local claims are replaced by
    /// what is actually on disk. Objects that are neither framed blobs nor
    /// chunks are counted but left alone.
    pub fn rebuild_index(&self) -> BlobResult<RebuildReport> {
        let ids = self.local.list()?;
        let present: HashSet<ObjectId> = ids.iter().copied().collect();
        let mut index = self.read_index().clone();
        let mut report = RebuildReport::default();

        for meta in index.blobs.values_mut() {
            if meta.locations.contains(StorageLocation::Local) && !present.contains(&meta.hash) {
                meta.locations.remove(StorageLocation::Local);
                report.dropped += 1;
            }
        }
        for chunk in index.chunks.values_mut() {
            if chunk.locations.contains(StorageLocation::Local) && !present.contains(&chunk.hash) {
                chunk.locations.remove(StorageLocation::Local);
            }
        }

        for id in &ids {
            let Some(frame) = self.local.read(id)? else {
                continue;
            };
            match codec::decode(&frame, self.config.max_blob_size) {
                Ok(Decoded::Content(content)) if identify(&content) == *id => {
                    let meta = index
                        .blobs
                        .entry(*id)
                        .or_insert_with(|| BlobMeta::new(*id, content.len() as u64));
                    if meta.ref_count == 0 && meta.locations.is_empty() {
                        meta.ref_count = 1;
                    }
                    meta.locations.insert(StorageLocation::Local);
                    meta.compressed_size = Some(frame.len() as u64);
                    report.blobs += 1;
                }
                Ok(Decoded::Content(content)) if chunk::chunk_id(&content) == *id => {
                    let entry = index.chunks.entry(*id).or_insert_with(|| ChunkMeta {
                        hash: *id,
                        size: content.len() as u64,
                        locations: LocationSet::new(),
                        remote_locator: None,
                        ref_count: 0,
                    });
                    entry.locations.insert(StorageLocation::Local);
                    report.chunks += 1;
                }
                Ok(Decoded::Manifest(manifest)) => {
                    let meta = index
                        .blobs
                        .entry(*id)
                        .or_insert_with(|| BlobMeta::new(*id, manifest.size));
                    if meta.ref_count == 0 && meta.locations.is_empty() {
                        meta.ref_count = 1;
                    }
                    meta.locations.insert(StorageLocation::Local);
                    meta.chunked = true;
                    meta.chunk_hashes = manifest.hashes();
                    report.blobs += 1;
                }
                _ => report.unrecognized += 1,
            }
        }

        index.blobs.retain(|_, m| !m.locations.is_empty());
        index.chunks.retain(|_, c| !c.locations.is_empty());
        index.recount_chunk_refs();
        *self.write_index() = index;
        self.checkpoint_now()?;
        info!(
            blobs = report.blobs,
            chunks = report.chunks,
            dropped = report.dropped,
            unrecognized = report.unrecognized,
            "metadata index rebuilt"
        );
        Ok(report)
    }

    pub fn save_index(&self, path: &Path) -> BlobResult<()> {
        self.read_index().save(path)
    }

    /// Replace the in-memory index with the one stored at `path`.
    pub fn load_index(&self, path: &Path) -> BlobResult<()> {
        let loaded = MetadataIndex::load(path)?;
        *self.write_index() = loaded;
        Ok(())
    }

    // ---- internals shared with verify/optimize ----

    pub(crate) fn read_index(&self) -> RwLockReadGuard<'_, MetadataIndex> {
        self.index.read().expect("index lock poisoned")
    }

    pub(crate) fn write_index(&self) -> RwLockWriteGuard<'_, MetadataIndex> {
        self.index.write().expect("index lock poisoned")
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the index to `index_path` if it changed since the last flush.
    ///
    /// Serialization and fsync run on the blocking pool against a snapshot,
    /// so index readers and writers are not held up. Returns whether a
    /// write happened.
    pub async fn flush_index(&self) -> BlobResult<bool> {
        let Some(path) = self.config.index_path.clone() else {
            return Ok(false);
        };
        let _flushing = self.flushing.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.index_snapshot();
        let result = tokio::task::spawn_blocking(move || snapshot.save(&path))
            .await
            .map_err(|e| BlobError::Io(std::io::Error::other(e)))
            .and_then(|saved| saved);
        if let Err(e) = &result {
            self.mark_dirty();
            warn!(error = %e, "index flush failed");
        }
        result.map(|()| true)
    }

    /// Synchronous save for callers outside the runtime's async paths.
    fn checkpoint_now(&self) -> BlobResult<()> {
        if let Some(path) = &self.config.index_path {
            self.dirty.store(false, Ordering::Release);
            let snapshot = self.index_snapshot();
            if let Err(e) = snapshot.save(path) {
                self.mark_dirty();
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, hash: &ObjectId) -> ObjectId {
        self.read_index().resolve(hash)
    }

    fn has_remote_copy(&self, hash: &ObjectId) -> bool {
        self.remote.is_some()
            && self
                .read_index()
                .blobs
                .get(hash)
                .is_some_and(|m| m.remote_locator.is_some())
    }

    fn check_locations(&self, locations: &LocationSet) -> BlobResult<()> {
        if locations.is_empty() {
            return Err(BlobError::Validation("no storage location requested".into()));
        }
        if locations.contains(StorageLocation::Remote) && self.remote.is_none() {
            return Err(BlobError::Validation(
                "remote location requested but no remote storage is configured".into(),
            ));
        }
        Ok(())
    }

    fn remote(&self) -> BlobResult<&Arc<dyn RemoteStorage>> {
        self.remote
            .as_ref()
            .ok_or_else(|| BlobError::Validation("no remote storage is configured".into()))
    }

    /// Make sure a metadata entry exists for `hash` and describes `encoded`.
    pub(crate) fn prepare_meta(&self, hash: ObjectId, size: u64, encoded: &Encoded) {
        let mut index = self.write_index();
        let meta = index
            .blobs
            .entry(hash)
            .or_insert_with(|| BlobMeta::new(hash, size));
        meta.compressed_size = Some(encoded.stored_size());
        if let Encoded::Chunked { manifest, .. } = encoded {
            meta.chunked = true;
            meta.chunk_hashes = manifest.hashes();
        }
    }

    /// Drop a blob entry that ended up with no stored copy.
    fn discard_if_unstored(&self, hash: &ObjectId) {
        let mut index = self.write_index();
        if index
            .blobs
            .get(hash)
            .is_some_and(|m| m.locations.is_empty() && m.ref_count == 0)
        {
            index.blobs.remove(hash);
        }
    }

    pub(crate) fn record_integrity_failure(&self, operation: &str) {
        self.resilience
            .analytics()
            .record(COMPONENT, operation, "integrity", FailureCategory::Integrity);
    }

    pub(crate) fn encode(&self, content: &[u8]) -> BlobResult<Encoded> {
        let chunking = &self.config.chunking;
        if !(chunking.enabled && content.len() > chunking.threshold) {
            return Ok(Encoded::Whole {
                frame: codec::encode_content(content, &self.config.compression)?,
            });
        }
        let mut refs = Vec::new();
        let mut chunks = Vec::new();
        for (hash, piece) in chunk::split(content, chunking.chunk_size) {
            let size = piece.len() as u64;
            refs.push(ChunkRef { hash, size });
            chunks.push(EncodedChunk {
                hash,
                size,
                frame: codec::encode_content(piece, &self.config.compression)?,
            });
        }
        let manifest = ChunkManifest::new(refs);
        let manifest_frame = codec::encode_manifest(&manifest)?;
        Ok(Encoded::Chunked {
            manifest,
            manifest_frame,
            chunks,
        })
    }

    /// Write an encoded blob to `location` and record it there.
    ///
    /// `replace` overwrites existing local bytes and re-uploads remote
    /// chunks; it is used by repair and transfers.
    pub(crate) async fn write_to(
        &self,
        location: StorageLocation,
        hash: ObjectId,
        encoded: &Encoded,
        replace: bool,
        cancel: &CancellationToken,
    ) -> BlobResult<()> {
        match location {
            StorageLocation::Local => self.write_local(hash, encoded, replace)?,
            StorageLocation::Remote => {
                let locator = self.write_remote(encoded, replace, cancel).await?;
                let mut index = self.write_index();
                if let Some(meta) = index.blobs.get_mut(&hash) {
                    meta.remote_locator = Some(locator);
                }
            }
        }
        let mut index = self.write_index();
        if let Some(meta) = index.blobs.get_mut(&hash) {
            meta.locations.insert(location);
        }
        Ok(())
    }

    fn write_local(&self, hash: ObjectId, encoded: &Encoded, replace: bool) -> BlobResult<()> {
        let put = |id: &ObjectId, frame: &[u8]| -> BlobResult<()> {
            if replace {
                self.local.replace(id, frame)?;
            } else {
                self.local.write(id, frame)?;
            }
            Ok(())
        };
        match encoded {
            Encoded::Whole { frame } => put(&hash, frame),
            Encoded::Chunked {
                manifest_frame,
                chunks,
                ..
            } => {
                // Chunks before the manifest, so a manifest never points at
                // chunks that were not written.
                for c in chunks {
                    put(&c.hash, &c.frame)?;
                    self.note_chunk(c, StorageLocation::Local, None);
                }
                put(&hash, manifest_frame)
            }
        }
    }

    async fn write_remote(
        &self,
        encoded: &Encoded,
        force: bool,
        cancel: &CancellationToken,
    ) -> BlobResult<Locator> {
        match encoded {
            Encoded::Whole { frame } => self.remote_put(frame.clone(), cancel).await,
            Encoded::Chunked {
                manifest_frame,
                chunks,
                ..
            } => {
                for c in chunks {
                    let stored = self
                        .read_index()
                        .chunks
                        .get(&c.hash)
                        .is_some_and(|m| m.remote_locator.is_some());
                    if stored && !force {
                        continue;
                    }
                    let locator = self.remote_put(c.frame.clone(), cancel).await?;
                    self.note_chunk(c, StorageLocation::Remote, Some(locator));
                }
                self.remote_put(manifest_frame.clone(), cancel).await
            }
        }
    }

    fn note_chunk(&self, chunk: &EncodedChunk, location: StorageLocation, locator: Option<Locator>) {
        let mut index = self.write_index();
        let entry = index.chunks.entry(chunk.hash).or_insert_with(|| ChunkMeta {
            hash: chunk.hash,
            size: chunk.size,
            locations: LocationSet::new(),
            remote_locator: None,
            ref_count: 0,
        });
        entry.locations.insert(location);
        if locator.is_some() {
            entry.remote_locator = locator;
        }
    }

    async fn remote_put(&self, frame: Vec<u8>, cancel: &CancellationToken) -> BlobResult<Locator> {
        let remote = Arc::clone(self.remote()?);
        let data = Bytes::from(frame);
        let target = CallTarget::new(remote.backend_id(), "put_object");
        let locator = self
            .resilience
            .call(target, cancel, || {
                let remote = Arc::clone(&remote);
                let data = data.clone();
                async move { remote.put_object(data).await }
            })
            .await?;
        Ok(locator)
    }

    async fn remote_get(&self, locator: &Locator, cancel: &CancellationToken) -> BlobResult<Bytes> {
        let remote = Arc::clone(self.remote()?);
        let target = CallTarget::new(remote.backend_id(), "get_object");
        let data = self
            .resilience
            .call(target, cancel, || {
                let remote = Arc::clone(&remote);
                let locator = locator.clone();
                async move { remote.get_object(&locator).await }
            })
            .await?;
        Ok(data)
    }

    /// Read and verify the local copy. `Ok(None)` if there is none.
    pub(crate) fn read_local(&self, hash: ObjectId) -> BlobResult<Option<Vec<u8>>> {
        let Some(frame) = self.local.read(&hash)? else {
            return Ok(None);
        };
        let decoded = codec::decode(&frame, self.config.max_blob_size)
            .map_err(|e| BlobError::integrity(hash, e.to_string()))?;
        let content = match decoded {
            Decoded::Content(content) => content,
            Decoded::Manifest(manifest) => {
                let mut content = Vec::new();
                for chunk in &manifest.chunks {
                    let frame = self.local.read(&chunk.hash)?.ok_or_else(|| {
                        BlobError::integrity(hash, format!("chunk {} missing locally", chunk.hash.short_hex()))
                    })?;
                    content.extend_from_slice(&verified_chunk(hash, chunk, &frame, self.config.max_blob_size)?);
                }
                content
            }
        };
        let content = self.verified(hash, content)?;
        Ok(Some(content))
    }

    /// Fetch and verify the remote copy.
    pub(crate) async fn read_remote(&self, hash: ObjectId, cancel: &CancellationToken) -> BlobResult<Vec<u8>> {
        let locator = self
            .read_index()
            .blobs
            .get(&hash)
            .and_then(|m| m.remote_locator.clone())
            .ok_or(BlobError::NotFound(hash))?;
        let frame = self.remote_get(&locator, cancel).await?;
        let decoded = codec::decode(&frame, self.config.max_blob_size)
            .map_err(|e| BlobError::integrity(hash, e.to_string()))?;
        let content = match decoded {
            Decoded::Content(content) => content,
            Decoded::Manifest(manifest) => {
                let mut content = Vec::new();
                for chunk in &manifest.chunks {
                    let chunk_locator = self
                        .read_index()
                        .chunks
                        .get(&chunk.hash)
                        .and_then(|c| c.remote_locator.clone())
                        .ok_or_else(|| {
                            BlobError::integrity(
                                hash,
                                format!("chunk {} has no remote copy", chunk.hash.short_hex()),
                            )
                        })?;
                    let frame = self.remote_get(&chunk_locator, cancel).await?;
                    content.extend_from_slice(&verified_chunk(hash, chunk, &frame, self.config.max_blob_size)?);
                }
                content
            }
        };
        self.verified(hash, content)
    }

    pub(crate) async fn read_at(
        &self,
        location: StorageLocation,
        hash: ObjectId,
        cancel: &CancellationToken,
    ) -> BlobResult<Vec<u8>> {
        match location {
            StorageLocation::Local => self.read_local(hash)?.ok_or(BlobError::NotFound(hash)),
            StorageLocation::Remote => self.read_remote(hash, cancel).await,
        }
    }

    fn verified(&self, hash: ObjectId, content: Vec<u8>) -> BlobResult<Vec<u8>> {
        let computed = identify(&content);
        if computed != hash {
            return Err(BlobError::integrity(
                hash,
                format!("content hashes to {}", computed.short_hex()),
            ));
        }
        Ok(content)
    }

    /// Write a remotely fetched blob to the local store.
    async fn promote(&self, hash: ObjectId, content: &[u8]) -> BlobResult<()> {
        let _guard = self.locks.lock(hash).await;
        let replace = self.local.exists(&hash)?;
        let encoded = self.encode(content)?;
        self.write_local(hash, &encoded, replace)?;
        {
            let mut index = self.write_index();
            if let Some(meta) = index.blobs.get_mut(&hash) {
                meta.locations.insert(StorageLocation::Local);
            }
        }
        self.mark_dirty();
        debug!(hash = %hash.short_hex(), "remote blob promoted to local");
        Ok(())
    }
}

fn verified_chunk(blob: ObjectId, chunk: &ChunkRef, frame: &[u8], max_len: u64) -> BlobResult<Vec<u8>> {
    let piece = codec::decode_content(frame, max_len.min(chunk.size)).map_err(|e| {
        BlobError::integrity(blob, format!("chunk {}: {e}", chunk.hash.short_hex()))
    })?;
    if chunk::chunk_id(&piece) != chunk.hash {
        return Err(BlobError::integrity(
            blob,
            format!("chunk {} does not match its hash", chunk.hash.short_hex()),
        ));
    }
    Ok(piece)
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("blobs", &self.read_index().blobs.len())
            .field("remote", &self.remote.as_ref().map(|r| r.backend_id().to_string()))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ledgit_resilience::{RemoteError, ResilienceConfig, RetryPolicy};
    use ledgit_store::{FsObjectStore, InMemoryObjectStore};
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    use super::*;
    use crate::config::ChunkingConfig;
    use crate::remote::MemoryRemote;

    pub(crate) struct Fixture {
        pub store: Arc<BlobStore>,
        pub local: Arc<InMemoryObjectStore>,
        pub remote: Arc<MemoryRemote>,
    }

    pub(crate) fn resilience() -> Arc<ResilienceContext> {
        let config = ResilienceConfig {
            retry: RetryPolicy::none(),
            ..ResilienceConfig::default()
        };
        Arc::new(ResilienceContext::new(config).unwrap())
    }

    pub(crate) fn fixture_with(config: BlobStoreConfig) -> Fixture {
        let local = Arc::new(InMemoryObjectStore::new());
        let remote = Arc::new(MemoryRemote::new("mem"));
        let store = BlobStore::new(
            config,
            local.clone(),
            Some(remote.clone() as Arc<dyn RemoteStorage>),
            resilience(),
        )
        .unwrap();
        Fixture {
            store: Arc::new(store),
            local,
            remote,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(BlobStoreConfig::default())
    }

    pub(crate) fn small_chunks() -> BlobStoreConfig {
        BlobStoreConfig {
            chunking: ChunkingConfig {
                enabled: true,
                threshold: 1024,
                chunk_size: 256,
            },
            ..BlobStoreConfig::default()
        }
    }

    /// Bytes that neither compress well nor repeat across chunks.
    pub(crate) fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut bytes = vec![0; len];
        StdRng::seed_from_u64(u64::from(seed)).fill_bytes(&mut bytes);
        bytes
    }

    #[tokio::test]
    async fn hello_twice_is_one_blob_with_two_refs() {
        let f = fixture();
        let first = f.store.put(b"hello", PutHints::default()).await.unwrap();
        let writes = f.local.mutations();
        let second = f.store.put(b"hello", PutHints::default()).await.unwrap();
        assert_eq!(f.local.mutations(), writes);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.hash(), second.hash());
        assert_eq!(second.meta.ref_count, 2);

        let stats = f.store.stats().unwrap();
        assert_eq!(stats.unique_blobs, 1);
        assert_eq!(stats.total_references, 2);
        assert_eq!(f.local.len(), 1);
    }

    #[tokio::test]
    async fn round_trip_small_and_compressible() {
        let f = fixture();
        for content in [b"tiny".to_vec(), vec![b'z'; 50_000]] {
            let r = f.store.put(&content, PutHints::default()).await.unwrap();
            assert_eq!(f.store.get(&r.hash(), None).await.unwrap(), content);
        }
        let big = f.store.meta(&identify(&vec![b'z'; 50_000])).unwrap();
        assert!(big.compressed_size.unwrap() < 50_000);
    }

    #[tokio::test]
    async fn chunked_blobs_share_chunks() {
        let f = fixture_with(small_chunks());
        let shared = noise(512, 1);
        let mut a = shared.clone();
        a.extend_from_slice(&noise(768, 2));
        let mut b = shared;
        b.extend_from_slice(&noise(768, 3));

        let ra = f.store.put(&a, PutHints::default()).await.unwrap();
        let rb = f.store.put(&b, PutHints::default()).await.unwrap();
        assert!(ra.meta.chunked);
        assert_eq!(ra.meta.chunk_hashes.len(), 5);
        assert_eq!(ra.meta.chunk_hashes[..2], rb.meta.chunk_hashes[..2]);

        // 2 shared + 3 + 3 chunks, plus two manifests.
        assert_eq!(f.local.len(), 10);
        let index = f.store.index_snapshot();
        assert_eq!(index.chunks[&ra.meta.chunk_hashes[0]].ref_count, 2);

        assert_eq!(f.store.get(&ra.hash(), None).await.unwrap(), a);
        assert_eq!(f.store.get(&rb.hash(), None).await.unwrap(), b);
    }

    #[tokio::test]
    async fn empty_content_policy() {
        let f = fixture();
        let r = f.store.put(b"", PutHints::default()).await.unwrap();
        assert_eq!(f.store.get(&r.hash(), None).await.unwrap(), b"");

        let strict = fixture_with(BlobStoreConfig {
            allow_empty: false,
            ..BlobStoreConfig::default()
        });
        let err = strict.store.put(b"", PutHints::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn location_validation() {
        let f = fixture();
        let err = f
            .store
            .put(b"x", PutHints::at(LocationSet::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let local_only = BlobStore::new(
            BlobStoreConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            None,
            resilience(),
        )
        .unwrap();
        let err = local_only
            .put(b"x", PutHints::at(LocationSet::remote()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn corrupt_local_falls_through_to_remote_and_is_promoted() {
        let f = fixture();
        let content = b"important bytes".to_vec();
        let r = f.store.put(&content, PutHints::at(LocationSet::both())).await.unwrap();
        f.local.replace(&r.hash(), b"garbage").unwrap();

        assert_eq!(f.store.get(&r.hash(), None).await.unwrap(), content);
        assert_eq!(f.remote.get_calls(), 1);
        // Promotion rewrote the local copy.
        assert_eq!(f.store.read_local(r.hash()).unwrap().unwrap(), content);
        assert_eq!(f.store.get(&r.hash(), None).await.unwrap(), content);
        assert_eq!(f.remote.get_calls(), 1);
    }

    #[tokio::test]
    async fn tampered_remote_is_an_integrity_error() {
        let f = fixture();
        let r = f.store.put(b"remote only", PutHints::at(LocationSet::remote())).await.unwrap();
        let locator = r.meta.remote_locator.clone().unwrap();
        let bogus = codec::encode_content(b"something else", &Default::default()).unwrap();
        f.remote.tamper(&locator, bogus);

        let err = f.store.get(&r.hash(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(f.store.resilience().analytics().len(), 1);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let f = fixture();
        let err = f.store.get(&identify(b"nope"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn concurrent_puts_store_one_copy() {
        let f = fixture_with(BlobStoreConfig {
            default_locations: LocationSet::both(),
            ..BlobStoreConfig::default()
        });
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&f.store);
            handles.push(tokio::spawn(async move {
                store.put(b"same content", PutHints::default()).await.unwrap()
            }));
        }
        let mut fresh = 0;
        for h in handles {
            if !h.await.unwrap().deduplicated {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(f.remote.put_calls(), 1);
        assert_eq!(f.store.meta(&identify(b"same content")).unwrap().ref_count, 8);
    }

    #[tokio::test]
    async fn failed_remote_put_keeps_local_copy() {
        let f = fixture();
        f.remote.fail_next_put(RemoteError::QuotaExceeded("full".into()));
        let err = f
            .store
            .put(b"payload", PutHints::at(LocationSet::both()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let meta = f.store.meta(&identify(b"payload")).unwrap();
        assert_eq!(meta.locations, LocationSet::local());
        assert_eq!(meta.ref_count, 0);

        let r = f.store.put(b"payload", PutHints::at(LocationSet::both())).await.unwrap();
        assert!(!r.deduplicated);
        assert_eq!(r.meta.locations, LocationSet::both());
        assert_eq!(r.meta.ref_count, 1);
    }

    #[tokio::test]
    async fn release_counts_down() {
        let f = fixture();
        let r = f.store.put(b"x", PutHints::default()).await.unwrap();
        f.store.put(b"x", PutHints::default()).await.unwrap();
        assert_eq!(f.store.release(&r.hash()).await.unwrap(), 1);
        assert_eq!(f.store.release(&r.hash()).await.unwrap(), 0);
        assert_eq!(f.store.release(&r.hash()).await.unwrap(), 0);
        assert!(f.store.release(&identify(b"unknown")).await.is_err());
    }

    #[tokio::test]
    async fn copy_to_remote_then_skip() {
        let f = fixture();
        let token = CancellationToken::new();
        let r = f.store.put(b"to migrate", PutHints::default()).await.unwrap();

        let first = f
            .store
            .copy_to(&r.hash(), StorageLocation::Local, StorageLocation::Remote, true, &token)
            .await
            .unwrap();
        assert_eq!(first, CopyOutcome::Copied { bytes: 10 });
        let second = f
            .store
            .copy_to(&r.hash(), StorageLocation::Local, StorageLocation::Remote, true, &token)
            .await
            .unwrap();
        assert_eq!(second, CopyOutcome::Skipped);
        assert_eq!(f.remote.put_calls(), 1);
        assert_eq!(f.store.meta(&r.hash()).unwrap().locations, LocationSet::both());

        let err = f
            .store
            .copy_to(&r.hash(), StorageLocation::Local, StorageLocation::Local, true, &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn copy_to_rewrites_invalid_destination() {
        let f = fixture();
        let token = CancellationToken::new();
        let r = f.store.put(b"both places", PutHints::at(LocationSet::both())).await.unwrap();
        f.remote.forget(r.meta.remote_locator.as_ref().unwrap());

        let outcome = f
            .store
            .copy_to(&r.hash(), StorageLocation::Local, StorageLocation::Remote, true, &token)
            .await
            .unwrap();
        assert!(matches!(outcome, CopyOutcome::Copied { .. }));
        assert_eq!(
            f.store.get(&r.hash(), Some(StorageLocation::Remote)).await.unwrap(),
            b"both places"
        );
    }

    #[tokio::test]
    async fn probe_feeds_the_health_monitor() {
        let f = fixture();
        let token = CancellationToken::new();
        assert!(!f.store.probe_remote(&token).await.unwrap());
        let r = f.store.put(b"probe me", PutHints::at(LocationSet::remote())).await.unwrap();
        assert!(f.store.probe_remote(&token).await.unwrap());
        assert_eq!(f.store.resilience().health().len(), 3);
        assert!(r.meta.remote_locator.is_some());
    }

    #[tokio::test]
    async fn inventory_and_stats() {
        let f = fixture();
        f.store.put(b"a", PutHints::default()).await.unwrap();
        f.store.put(b"b", PutHints::at(LocationSet::both())).await.unwrap();
        assert_eq!(f.store.inventory(StorageLocation::Local).len(), 2);
        assert_eq!(f.store.inventory(StorageLocation::Remote).len(), 1);

        let stats = f.store.stats().unwrap();
        assert_eq!(stats.local_blobs, 2);
        assert_eq!(stats.remote_blobs, 1);
        assert_eq!(stats.logical_bytes, 2);
        assert!(stats.local_stored_bytes > 0);
    }

    #[tokio::test]
    async fn rebuild_index_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::create(dir.path()).unwrap());
        let first = BlobStore::new(small_chunks(), fs_store.clone(), None, resilience()).unwrap();
        let small = first.put(b"small file", PutHints::default()).await.unwrap();
        let large_content = noise(2000, 7);
        let large = first.put(&large_content, PutHints::default()).await.unwrap();
        fs_store.write(&ObjectId::from_bytes(b"junk"), b"not a frame").unwrap();

        let second = BlobStore::new(small_chunks(), fs_store, None, resilience()).unwrap();
        assert!(second.meta(&small.hash()).is_none());
        let report = second.rebuild_index().unwrap();
        assert_eq!(report.blobs, 2);
        assert_eq!(report.chunks, 8);
        assert_eq!(report.unrecognized, 1);

        assert_eq!(second.get(&large.hash(), None).await.unwrap(), large_content);
        assert!(second.meta(&large.hash()).unwrap().chunked);
    }

    #[tokio::test]
    async fn index_checkpoints_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.json");
        let local: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let config = BlobStoreConfig {
            index_path: Some(index_path.clone()),
            ..BlobStoreConfig::default()
        };
        let store = BlobStore::new(config.clone(), local.clone(), None, resilience()).unwrap();
        let r = store.put(b"persisted", PutHints::default()).await.unwrap();
        assert!(index_path.is_file());

        let reopened = BlobStore::new(config, local, None, resilience()).unwrap();
        assert_eq!(reopened.meta(&r.hash()).unwrap().ref_count, 1);

        let other = dir.path().join("copy.json");
        reopened.save_index(&other).unwrap();
        let fresh = BlobStore::new(
            BlobStoreConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            None,
            resilience(),
        )
        .unwrap();
        fresh.load_index(&other).unwrap();
        assert!(fresh.meta(&r.hash()).is_some());
    }

    #[tokio::test]
    async fn content_above_size_bound_is_rejected() {
        let f = fixture_with(BlobStoreConfig {
            max_blob_size: 8,
            ..BlobStoreConfig::default()
        });
        let err = f.store.put(b"nine byte", PutHints::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.local.is_empty());
        assert!(f.store.put(b"eight by", PutHints::default()).await.is_ok());
    }

    #[tokio::test]
    async fn copies_reach_the_index_file_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.json");
        let config = BlobStoreConfig {
            index_path: Some(index_path.clone()),
            ..BlobStoreConfig::default()
        };
        let remote = Arc::new(MemoryRemote::new("mem"));
        let store = BlobStore::new(
            config,
            Arc::new(InMemoryObjectStore::new()),
            Some(remote as Arc<dyn RemoteStorage>),
            resilience(),
        )
        .unwrap();
        let r = store.put(b"mirrored later", PutHints::default()).await.unwrap();
        assert!(!store.flush_index().await.unwrap());
        let on_disk = || MetadataIndex::load(&index_path).unwrap().blobs[&r.hash()].locations.clone();
        assert_eq!(on_disk(), LocationSet::local());

        let cancel = CancellationToken::new();
        store
            .copy_to(&r.hash(), StorageLocation::Local, StorageLocation::Remote, false, &cancel)
            .await
            .unwrap();
        assert_eq!(on_disk(), LocationSet::local());
        assert!(store.flush_index().await.unwrap());
        assert_eq!(on_disk(), LocationSet::both());
        assert!(!store.flush_index().await.unwrap());
    }
}
