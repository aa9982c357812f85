//! Foundation types for Ledgit.
//!
//! This crate provides the identifiers shared by every other Ledgit crate.
//!
//! # Key Types
//!
//! - [`ObjectId`]: Content-addressed identifier (BLAKE3 hash)
//! - [`StorageLocation`]: Where a stored copy lives (local cache or remote backend)
//! - [`LocationSet`]: Small ordered set of locations

pub mod error;
pub mod location;
pub mod object;

pub use error::TypeError;
pub use location::{LocationSet, StorageLocation};
pub use object::ObjectId;
