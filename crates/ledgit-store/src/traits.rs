use std::time::Duration;

use ledgit_types::ObjectId;

use crate::error::StoreResult;

/// Content-addressed local object store.
///
/// Keys are object ids; values are opaque encoded bytes. All implementations
/// must satisfy these invariants:
/// - `write` is first-writer-wins: if the id is already present the call is
///   a no-op and returns `false`, even under concurrent writers.
/// - `replace` atomically swaps the bytes under an id; a reader sees either
///   the old or the new bytes, never a mix.
/// - Reads return exactly the bytes last written, so callers can re-hash
///   them for verification.
/// - All I/O errors are propagated, never silently ignored.
pub trait ObjectStore: Send + Sync {
    /// Read the bytes stored under `id`.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    fn read(&self, id: &ObjectId) -> StoreResult<Option<Vec<u8>>>;

    /// Store bytes under `id` unless something is already stored there.
    ///
    /// Returns `true` if this call created the entry.
    fn write(&self, id: &ObjectId, data: &[u8]) -> StoreResult<bool>;

    /// Overwrite the bytes under `id`, creating the entry if needed.
    ///
    /// Used by repair and recompression only.
    fn replace(&self, id: &ObjectId, data: &[u8]) -> StoreResult<()>;

    /// Check whether an object exists in the store.
    fn exists(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Delete an object by ID. Returns `true` if the object existed.
    fn delete(&self, id: &ObjectId) -> StoreResult<bool>;

    /// All ids currently stored, sorted.
    fn list(&self) -> StoreResult<Vec<ObjectId>>;

    /// Stored size of an object in bytes.
    fn size_of(&self, id: &ObjectId) -> StoreResult<Option<u64>> {
        Ok(self.read(id)?.map(|data| data.len() as u64))
    }

    /// Remove temporary files left behind by interrupted writes that are
    /// older than `max_age`. Returns how many were removed.
    fn clean_temp(&self, _max_age: Duration) -> StoreResult<usize> {
        Ok(0)
    }
}
