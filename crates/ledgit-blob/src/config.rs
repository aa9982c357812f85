use std::path::PathBuf;
use std::time::Duration;

use ledgit_types::LocationSet;
use serde::{Deserialize, Serialize};

use crate::error::{BlobError, BlobResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// zstd level used on `put`.
    pub level: i32,
    /// zstd level used by the recompress pass.
    pub recompress_level: i32,
    /// Compressed output is kept only if smaller than `max_ratio * original`.
    pub max_ratio: f64,
    /// Content shorter than this is always stored raw.
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 3,
            recompress_level: 19,
            max_ratio: 0.9,
            min_size: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub enabled: bool,
    /// Content strictly larger than this is chunked.
    pub threshold: usize,
    pub chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 4 * 1024 * 1024,
            chunk_size: 1024 * 1024,
        }
    }
}

/// Blob store manager settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    pub compression: CompressionConfig,
    pub chunking: ChunkingConfig,
    /// Locations `put` writes to when the caller gives no hint.
    pub default_locations: LocationSet,
    pub allow_empty: bool,
    /// Largest blob `put` accepts and decoding will materialise.
    pub max_blob_size: u64,
    /// Write remotely fetched blobs to the local store.
    pub promote_on_fetch: bool,
    /// Age after which staged temp files are considered abandoned.
    pub temp_max_age_secs: u64,
    /// Where the metadata index is checkpointed. `None` keeps it in memory.
    pub index_path: Option<PathBuf>,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            chunking: ChunkingConfig::default(),
            default_locations: LocationSet::local(),
            allow_empty: true,
            max_blob_size: 16 * 1024 * 1024 * 1024,
            promote_on_fetch: true,
            temp_max_age_secs: 3600,
            index_path: None,
        }
    }
}

impl BlobStoreConfig {
    pub fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_max_age_secs)
    }

    pub fn validate(&self) -> BlobResult<()> {
        let c = &self.compression;
        let levels = zstd::compression_level_range();
        if !levels.contains(&c.level) || !levels.contains(&c.recompress_level) {
            return Err(BlobError::Validation(format!(
                "zstd levels must be within {}..={}",
                levels.start(),
                levels.end()
            )));
        }
        if !(c.max_ratio > 0.0 && c.max_ratio <= 1.0) {
            return Err(BlobError::Validation(
                "compression.max_ratio must be within (0, 1]".into(),
            ));
        }
        let k = &self.chunking;
        if k.chunk_size == 0 {
            return Err(BlobError::Validation("chunking.chunk_size must be positive".into()));
        }
        if k.threshold < k.chunk_size {
            return Err(BlobError::Validation(
                "chunking.threshold must not be below chunking.chunk_size".into(),
            ));
        }
        if self.default_locations.is_empty() {
            return Err(BlobError::Validation("default_locations must not be empty".into()));
        }
        if self.max_blob_size == 0 {
            return Err(BlobError::Validation("max_blob_size must be positive".into()));
        }
        Ok(())
    }
}
