//! Integrity verification and repair.

use ledgit_resilience::ErrorKind;
use ledgit_types::{ObjectId, StorageLocation};
use tracing::{info, warn};

use crate::error::{BlobError, BlobResult};
use crate::manager::BlobStore;
use crate::types::{BlobFailure, Targets, VerifyOptions, VerifyReport};

enum Verdict {
    Verified,
    Repaired,
}

impl BlobStore {
    /// Re-derive every claimed copy of the targeted blobs.
    ///
    /// A copy that is missing or does not hash back to its blob is corrupt.
    /// With `repair`, corrupt copies are rewritten from a valid one. With
    /// `sync_missing`, configured locations that lack the blob are filled.
    /// Blobs with no valid copy end up in `failed`; their metadata is kept
    /// so nothing is silently forgotten. Once `cancel` fires, remaining
    /// blobs are reported as skipped.
    pub async fn verify_and_repair(&self, targets: Targets, options: VerifyOptions) -> BlobResult<VerifyReport> {
        let hashes: Vec<ObjectId> = match targets {
            Targets::All => self.read_index().blobs.keys().copied().collect(),
            Targets::Only(list) => list.iter().map(|h| self.resolve(h)).collect(),
        };

        let mut report = VerifyReport::default();
        for hash in hashes {
            if options.cancel.is_cancelled() {
                report.skipped.push(hash);
                continue;
            }
            match self.verify_one(hash, &options).await {
                Ok(Verdict::Verified) => report.verified.push(hash),
                Ok(Verdict::Repaired) => report.repaired.push(hash),
                Err(e) => {
                    warn!(hash = %hash.short_hex(), error = %e, "verification failed");
                    report.failed.push(BlobFailure::new(hash, &e));
                }
            }
        }
        self.flush_index().await?;

        info!(
            verified = report.verified.len(),
            repaired = report.repaired.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "verification finished"
        );
        Ok(report)
    }

    async fn verify_one(&self, hash: ObjectId, options: &VerifyOptions) -> BlobResult<Verdict> {
        let _guard = self.locks.lock(hash).await;
        let meta = self.meta(&hash).ok_or(BlobError::NotFound(hash))?;
        if meta.locations.is_empty() {
            return Err(BlobError::integrity(hash, "no stored copy is recorded"));
        }

        let mut valid = None;
        let mut corrupt: Vec<(StorageLocation, BlobError)> = Vec::new();
        for location in meta.locations.iter() {
            match self.read_at(location, hash, &options.cancel).await {
                Ok(content) => {
                    valid.get_or_insert(content);
                }
                Err(e) if e.is_location_failure() => {
                    warn!(hash = %hash.short_hex(), %location, error = %e, "corrupt copy");
                    if e.kind() == ErrorKind::Integrity {
                        self.record_integrity_failure("verify");
                    }
                    corrupt.push((location, e));
                }
                Err(e) => return Err(e),
            }
        }

        let missing = if options.sync_missing {
            self.configured_locations().missing_from(&meta.locations)
        } else {
            Vec::new()
        };
        if corrupt.is_empty() && missing.is_empty() {
            return Ok(Verdict::Verified);
        }

        let content = match valid {
            Some(content) if corrupt.is_empty() || options.repair => content,
            _ => {
                let (_, first) = corrupt.swap_remove(0);
                return Err(first);
            }
        };

        let encoded = self.encode(&content)?;
        for (location, _) in &corrupt {
            self.write_to(*location, hash, &encoded, true, &options.cancel).await?;
            info!(hash = %hash.short_hex(), %location, "corrupt copy repaired");
        }
        for location in missing {
            self.write_to(location, hash, &encoded, false, &options.cancel).await?;
            info!(hash = %hash.short_hex(), %location, "missing copy populated");
        }
        self.mark_dirty();
        Ok(Verdict::Repaired)
    }
}
