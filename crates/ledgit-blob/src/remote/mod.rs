//! Remote storage interface.
//!
//! A remote backend is an opaque put/get service: it accepts bytes and hands
//! back a [`Locator`] (transaction id, object key, path) that later retrieves
//! them. The manager never assumes locators are derived from content.

mod directory;
mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use ledgit_resilience::RemoteError;
use serde::{Deserialize, Serialize};

pub use directory::DirectoryRemote;
pub use memory::MemoryRemote;

/// Opaque handle to an object held by a remote backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote storage provider.
///
/// Implementations map their transport failures onto [`RemoteError`] so the
/// resilience layer can classify them. They must not retry internally.
#[async_trait]
pub trait RemoteStorage: Send + Sync + fmt::Debug {
    /// Stable backend name; used as the circuit breaker key.
    fn backend_id(&self) -> &str;

    async fn put_object(&self, data: Bytes) -> Result<Locator, RemoteError>;

    async fn get_object(&self, locator: &Locator) -> Result<Bytes, RemoteError>;

    async fn exists(&self, locator: &Locator) -> Result<bool, RemoteError>;
}
