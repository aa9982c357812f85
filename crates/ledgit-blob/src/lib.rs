//! Blob Store Manager for Ledgit.
//!
//! [`BlobStore`] owns blob metadata and decides where bytes live. Content is
//! identified by [`ledgit_store::identify`], deduplicated on `put`,
//! compressed with zstd when that pays off, split into fixed-size chunks when
//! large, and written to the local [`ledgit_store::ObjectStore`] and/or a
//! [`RemoteStorage`] backend. Every remote call runs through the shared
//! [`ledgit_resilience::ResilienceContext`].
//!
//! # Stored representation
//!
//! Every stored object is a [`codec`] frame: a small header (magic, codec,
//! uncompressed length, CRC32 of the payload) followed by the payload. A
//! chunked blob is stored as a manifest frame under the blob hash plus one
//! content frame per chunk, keyed by the chunk's own hash.
//!
//! # Maintenance
//!
//! - [`BlobStore::verify_and_repair`] re-derives content at every location
//!   and rewrites corrupt copies from a valid one.
//! - [`BlobStore::optimize`] collapses legacy-keyed duplicates, recompresses
//!   local frames and evicts unreferenced copies.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod optimize;
pub mod remote;
pub mod types;
pub mod verify;

pub use chunk::{ChunkManifest, ChunkRef};
pub use codec::{Codec, Decoded};
pub use config::{BlobStoreConfig, ChunkingConfig, CompressionConfig};
pub use error::{BlobError, BlobResult};
pub use manager::BlobStore;
pub use metadata::{BlobMeta, ChunkMeta, MetadataIndex};
pub use remote::{DirectoryRemote, Locator, MemoryRemote, RemoteStorage};
pub use types::{
    BlobFailure, BlobRef, CopyOutcome, OptimizeOptions, OptimizeReport, PutHints, RebuildReport,
    StoreStats, Targets, VerifyOptions, VerifyReport,
};
