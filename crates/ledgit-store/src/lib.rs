//! Object model and local content-addressed storage for Ledgit.
//!
//! Every piece of versioned data (file contents, directory listings,
//! commits) is identified by a domain-separated BLAKE3 hash of its content.
//! This crate defines those identities and the local, hash-keyed object
//! directory that caches them next to the working copy.
//!
//! # Object Model
//!
//! - [`identify`] -- the identity of raw blob content
//! - [`Tree`] / [`build_tree`] -- directory listing with canonical ordering
//! - [`Commit`] / [`build_commit`] -- immutable snapshot pointer
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectStore`] trait:
//!
//! - [`InMemoryObjectStore`] -- ordered map with a mutation counter, for tests
//! - [`FsObjectStore`] -- fan-out directory (`objects/ab/abcd...`) with
//!   atomic temp-file writes
//!
//! # Design Rules
//!
//! 1. `write` never overwrites: the first writer of an id wins.
//! 2. `replace` is the only overwrite path and is atomic (repair, recompress).
//! 3. The store never interprets bytes; integrity is checked by callers
//!    that know how the bytes were encoded.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod fs;
pub mod memory;
pub mod object;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use fs::FsObjectStore;
pub use memory::InMemoryObjectStore;
pub use object::{build_commit, build_tree, identify, Commit, CommitFields, EntryType, Tree, TreeEntry};
pub use traits::ObjectStore;
