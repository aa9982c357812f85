//! Storage optimization: legacy deduplication, recompression, cleanup.

use std::collections::HashSet;

use ledgit_store::identify;
use ledgit_types::{ObjectId, StorageLocation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chunk;
use crate::codec::{self, Decoded};
use crate::error::{BlobError, BlobResult};
use crate::manager::BlobStore;
use crate::types::{BlobFailure, OptimizeOptions, OptimizeReport};

impl BlobStore {
    /// Run the selected optimization passes over the local store.
    ///
    /// Each pass records its metadata changes and flushes the index once
    /// before deleting any bytes, so an interrupted run can leave
    /// unreachable objects behind but never metadata pointing at deleted
    /// ones.
    pub async fn optimize(&self, options: OptimizeOptions) -> BlobResult<OptimizeReport> {
        let mut report = OptimizeReport::default();
        if options.deduplicate {
            self.deduplicate_legacy(&mut report, &options.cancel).await?;
        }
        if options.recompress {
            self.recompress(&mut report, &options.cancel).await?;
        }
        if options.clean {
            self.clean(&mut report, &options.cancel).await?;
        }
        self.flush_index().await?;
        info!(
            deduplicated = report.deduplicated,
            recompressed = report.recompressed,
            cleaned = report.cleaned,
            failed = report.failed.len(),
            savings = report.savings,
            "optimization finished"
        );
        Ok(report)
    }

    /// Collapse objects stored under a legacy key (the plain BLAKE3 digest
    /// of the content) onto the canonical blob hash.
    async fn deduplicate_legacy(&self, report: &mut OptimizeReport, cancel: &CancellationToken) -> BlobResult<()> {
        let known: HashSet<ObjectId> = {
            let index = self.read_index();
            index.blobs.keys().chain(index.chunks.keys()).copied().collect()
        };
        let mut adopted = Vec::new();
        for id in self.local.list()? {
            if cancel.is_cancelled() {
                break;
            }
            if known.contains(&id) {
                continue;
            }
            let Some(raw) = self.local.read(&id)? else {
                continue;
            };
            let content = if codec::is_frame(&raw) {
                match codec::decode(&raw, self.config.max_blob_size) {
                    Ok(Decoded::Content(content)) => content,
                    _ => continue,
                }
            } else {
                raw.clone()
            };
            if ObjectId::from_bytes(&content) != id {
                continue;
            }
            match self.adopt_legacy(id, &content, cancel).await {
                Ok(written) => adopted.push((id, (raw.len() as u64).saturating_sub(written))),
                Err(e) => report.failed.push(BlobFailure::new(id, &e)),
            }
        }
        if adopted.is_empty() {
            return Ok(());
        }

        // Aliases must be durable before the legacy keys disappear.
        self.flush_index().await?;
        for (legacy, freed) in adopted {
            match self.local.delete(&legacy) {
                Ok(_) => {
                    report.deduplicated += 1;
                    report.savings += freed;
                }
                Err(e) => report.failed.push(BlobFailure::new(legacy, &e.into())),
            }
        }
        Ok(())
    }

    /// Store the canonical copy and record the alias. Returns the bytes
    /// written for the canonical copy.
    async fn adopt_legacy(&self, legacy: ObjectId, content: &[u8], cancel: &CancellationToken) -> BlobResult<u64> {
        let canonical = identify(content);
        let _guard = self.locks.lock(canonical).await;

        let stored_locally = self
            .read_index()
            .blobs
            .get(&canonical)
            .is_some_and(|m| m.locations.contains(StorageLocation::Local));
        let mut written = 0;
        if !stored_locally {
            let encoded = self.encode(content)?;
            self.prepare_meta(canonical, content.len() as u64, &encoded);
            self.write_to(StorageLocation::Local, canonical, &encoded, false, cancel)
                .await?;
            written = encoded.stored_size();
        }
        {
            let mut index = self.write_index();
            if let Some(meta) = index.blobs.get_mut(&canonical) {
                meta.ref_count += 1;
            }
            index.aliases.insert(legacy, canonical);
            index.recount_chunk_refs();
        }
        self.mark_dirty();
        debug!(legacy = %legacy.short_hex(), canonical = %canonical.short_hex(), "legacy key collapsed");
        Ok(written)
    }

    /// Rewrite local content frames at the recompression level, keeping the
    /// new frame only if it is strictly smaller.
    async fn recompress(&self, report: &mut OptimizeReport, cancel: &CancellationToken) -> BlobResult<()> {
        let targets: Vec<ObjectId> = {
            let index = self.read_index();
            let blobs = index
                .blobs
                .values()
                .filter(|m| !m.chunked && m.locations.contains(StorageLocation::Local))
                .map(|m| m.hash);
            let chunks = index
                .chunks
                .values()
                .filter(|c| c.locations.contains(StorageLocation::Local))
                .map(|c| c.hash);
            blobs.chain(chunks).collect()
        };
        for id in targets {
            if cancel.is_cancelled() {
                break;
            }
            match self.recompress_one(id).await {
                Ok(Some(saved)) => {
                    report.recompressed += 1;
                    report.savings += saved;
                }
                Ok(None) => {}
                Err(e) => report.failed.push(BlobFailure::new(id, &e)),
            }
        }
        Ok(())
    }

    async fn recompress_one(&self, id: ObjectId) -> BlobResult<Option<u64>> {
        let _guard = self.locks.lock(id).await;
        let Some(frame) = self.local.read(&id)? else {
            return Ok(None);
        };
        let content = codec::decode_content(&frame, self.config.max_blob_size)
            .map_err(|e| BlobError::integrity(id, e.to_string()))?;
        if identify(&content) != id && chunk::chunk_id(&content) != id {
            return Err(BlobError::integrity(id, "local copy does not match its key"));
        }
        let compression = &self.config.compression;
        let smaller = codec::encode_at_level(&content, compression, compression.recompress_level)?;
        if smaller.len() >= frame.len() {
            return Ok(None);
        }
        self.local.replace(&id, &smaller)?;
        if let Some(meta) = self.write_index().blobs.get_mut(&id) {
            meta.compressed_size = Some(smaller.len() as u64);
        }
        self.mark_dirty();
        debug!(id = %id.short_hex(), before = frame.len(), after = smaller.len(), "frame recompressed");
        Ok(Some((frame.len() - smaller.len()) as u64))
    }

    /// Evict local copies nothing references, orphaned chunks and stale
    /// temporary files.
    async fn clean(&self, report: &mut OptimizeReport, cancel: &CancellationToken) -> BlobResult<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let unreferenced: Vec<ObjectId> = self
            .read_index()
            .blobs
            .values()
            .filter(|m| m.ref_count == 0 && m.locations.contains(StorageLocation::Local))
            .map(|m| m.hash)
            .collect();
        let mut evictions = Vec::new();
        for hash in unreferenced {
            if cancel.is_cancelled() {
                break;
            }
            let _guard = self.locks.lock(hash).await;
            let mut index = self.write_index();
            let Some(meta) = index.blobs.get_mut(&hash) else {
                continue;
            };
            if meta.ref_count > 0 {
                continue;
            }
            meta.locations.remove(StorageLocation::Local);
            if meta.locations.is_empty() {
                index.blobs.remove(&hash);
                index.aliases.retain(|_, target| *target != hash);
            }
            index.recount_chunk_refs();
            evictions.push(hash);
        }

        if !cancel.is_cancelled() {
            let mut index = self.write_index();
            let needed = index.chunks_needed_at(StorageLocation::Local);
            let orphans: Vec<ObjectId> = index
                .chunks
                .values()
                .filter(|c| c.locations.contains(StorageLocation::Local) && !needed.contains(&c.hash))
                .map(|c| c.hash)
                .collect();
            for hash in &orphans {
                if let Some(chunk) = index.chunks.get_mut(hash) {
                    chunk.locations.remove(StorageLocation::Local);
                }
            }
            index.chunks.retain(|_, c| !c.locations.is_empty());
            evictions.extend(orphans);
        }

        if !evictions.is_empty() {
            self.mark_dirty();
            self.flush_index().await?;
        }
        for hash in &evictions {
            let _guard = self.locks.lock(*hash).await;
            if self.recorded_locally(hash) {
                // Stored again since the metadata was updated.
                continue;
            }
            report.savings += self.evict(hash)?;
            report.cleaned += 1;
            debug!(hash = %hash.short_hex(), "local copy evicted");
        }

        let temp = self.local.clean_temp(self.config.temp_max_age())?;
        report.cleaned += temp;
        Ok(())
    }

    fn recorded_locally(&self, hash: &ObjectId) -> bool {
        let index = self.read_index();
        index
            .blobs
            .get(hash)
            .is_some_and(|m| m.locations.contains(StorageLocation::Local))
            || index
                .chunks
                .get(hash)
                .is_some_and(|c| c.locations.contains(StorageLocation::Local))
    }

    /// Delete a local object, returning the bytes it occupied.
    fn evict(&self, id: &ObjectId) -> BlobResult<u64> {
        let size = self.local.size_of(id)?.unwrap_or(0);
        self.local.delete(id)?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use ledgit_store::ObjectStore;
    use ledgit_types::LocationSet;

    use super::*;
    use crate::config::{BlobStoreConfig, CompressionConfig};
    use crate::manager::tests::{fixture, fixture_with, noise, small_chunks};
    use crate::types::PutHints;

    fn only(deduplicate: bool, recompress: bool, clean: bool) -> OptimizeOptions {
        OptimizeOptions {
            deduplicate,
            recompress,
            clean,
            cancel: CancellationToken::new(),
        }
    }

    fn text(lines: usize) -> Vec<u8> {
        (0..lines)
            .map(|i| format!("record {i}: value={} status=ok\n", i * 7 % 13))
            .collect::<String>()
            .into_bytes()
    }

    #[tokio::test]
    async fn legacy_raw_object_is_collapsed() {
        let f = fixture();
        let content = b"written by an old client".to_vec();
        let legacy = ObjectId::from_bytes(&content);
        f.local.write(&legacy, &content).unwrap();

        let report = f.store.optimize(only(true, false, false)).await.unwrap();
        assert_eq!(report.deduplicated, 1);
        assert!(!f.local.exists(&legacy).unwrap());

        let canonical = identify(&content);
        assert_eq!(f.store.meta(&legacy).unwrap().hash, canonical);
        assert_eq!(f.store.get(&legacy, None).await.unwrap(), content);
        assert_eq!(f.store.index_snapshot().aliases[&legacy], canonical);
    }

    #[tokio::test]
    async fn legacy_duplicate_of_existing_blob_frees_its_bytes() {
        let f = fixture();
        let content = b"already here".to_vec();
        let r = f.store.put(&content, PutHints::default()).await.unwrap();
        let legacy = ObjectId::from_bytes(&content);
        f.local.write(&legacy, &content).unwrap();

        let report = f.store.optimize(only(true, false, false)).await.unwrap();
        assert_eq!(report.deduplicated, 1);
        assert_eq!(report.savings, content.len() as u64);
        assert_eq!(f.store.meta(&r.hash()).unwrap().ref_count, 2);
        assert_eq!(f.local.len(), 1);
    }

    #[tokio::test]
    async fn unrelated_objects_are_left_alone() {
        let f = fixture();
        f.local.write(&ObjectId::from_bytes(b"key"), b"not the key's content").unwrap();
        let report = f.store.optimize(only(true, false, false)).await.unwrap();
        assert_eq!(report.deduplicated, 0);
        assert_eq!(f.local.len(), 1);
    }

    #[tokio::test]
    async fn recompression_only_keeps_smaller_frames() {
        let f = fixture_with(BlobStoreConfig {
            compression: CompressionConfig {
                level: 1,
                ..CompressionConfig::default()
            },
            ..BlobStoreConfig::default()
        });
        let compressible = text(4000);
        let r = f.store.put(&compressible, PutHints::default()).await.unwrap();
        f.store.put(&noise(4096, 5), PutHints::default()).await.unwrap();
        let before = r.meta.compressed_size.unwrap();

        let report = f.store.optimize(only(false, true, false)).await.unwrap();
        assert_eq!(report.recompressed, 1);
        assert!(report.savings > 0);
        assert!(f.store.meta(&r.hash()).unwrap().compressed_size.unwrap() < before);
        assert_eq!(f.store.get(&r.hash(), None).await.unwrap(), compressible);
    }

    #[tokio::test]
    async fn clean_evicts_unreferenced_local_copies() {
        let f = fixture();
        let kept = f.store.put(b"kept", PutHints::default()).await.unwrap();
        let gone = f.store.put(b"gone", PutHints::default()).await.unwrap();
        let mirrored = f.store.put(b"mirrored", PutHints::at(LocationSet::both())).await.unwrap();
        f.store.release(&gone.hash()).await.unwrap();
        f.store.release(&mirrored.hash()).await.unwrap();

        let report = f.store.optimize(only(false, false, true)).await.unwrap();
        assert_eq!(report.cleaned, 2);
        assert!(f.store.meta(&gone.hash()).is_none());
        assert!(!f.local.exists(&gone.hash()).unwrap());
        assert!(f.local.exists(&kept.hash()).unwrap());
        assert_eq!(f.store.meta(&mirrored.hash()).unwrap().locations, LocationSet::remote());
        assert_eq!(f.store.get(&mirrored.hash(), None).await.unwrap(), b"mirrored");
    }

    #[tokio::test]
    async fn clean_drops_orphan_chunks_but_keeps_shared_ones() {
        let f = fixture_with(small_chunks());
        let shared = noise(512, 21);
        let mut a = shared.clone();
        a.extend_from_slice(&noise(768, 22));
        let mut b = shared;
        b.extend_from_slice(&noise(768, 23));
        let ra = f.store.put(&a, PutHints::default()).await.unwrap();
        let rb = f.store.put(&b, PutHints::default()).await.unwrap();
        f.store.release(&ra.hash()).await.unwrap();

        let report = f.store.optimize(only(false, false, true)).await.unwrap();
        // Manifest plus the three chunks only `a` used.
        assert_eq!(report.cleaned, 4);
        for hash in &rb.meta.chunk_hashes {
            assert!(f.local.exists(hash).unwrap());
        }
        assert_eq!(f.store.get(&rb.hash(), None).await.unwrap(), b);
    }

    #[tokio::test]
    async fn cancelled_optimize_does_nothing() {
        let f = fixture();
        let r = f.store.put(b"x", PutHints::default()).await.unwrap();
        f.store.release(&r.hash()).await.unwrap();
        let options = OptimizeOptions::all();
        options.cancel.cancel();
        let report = f.store.optimize(options).await.unwrap();
        assert_eq!(report.cleaned, 0);
        assert!(f.local.exists(&r.hash()).unwrap());
    }
}
