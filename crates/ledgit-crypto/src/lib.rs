//! Content hashing for Ledgit.
//!
//! Every identity in the storage core is a domain-separated BLAKE3 digest.
//! Domain tags carry a version suffix; moving to a different algorithm means
//! introducing a new tag and migrating, never silently reinterpreting an
//! existing one.

pub mod hasher;

pub use hasher::{ContentHasher, HasherError};
