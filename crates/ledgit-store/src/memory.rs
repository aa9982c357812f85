use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use ledgit_types::ObjectId;
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

#[derive(Default)]
struct Slots {
    objects: BTreeMap<ObjectId, Vec<u8>>,
    /// Successful `write` and `replace` calls.
    mutations: u64,
}

/// Object store held entirely in memory.
///
/// Used by tests and by embedders that bring their own persistence. Keeps a
/// mutation counter so callers can assert that deduplicated writes did no
/// I/O, and can flip bytes in place to simulate on-disk corruption.
#[derive(Default)]
pub struct InMemoryObjectStore {
    slots: RwLock<Slots>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.read().expect("store lock poisoned").objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes and replaces that changed the store.
    pub fn mutations(&self) -> u64 {
        self.slots.read().expect("store lock poisoned").mutations
    }

    /// Invert the byte at `offset` (clamped to the last byte). Returns
    /// `false` if nothing is stored under `id` or the object is empty.
    pub fn corrupt(&self, id: &ObjectId, offset: usize) -> bool {
        let mut slots = self.slots.write().expect("store lock poisoned");
        match slots.objects.get_mut(id) {
            Some(bytes) if !bytes.is_empty() => {
                let at = offset.min(bytes.len() - 1);
                bytes[at] = !bytes[at];
                true
            }
            _ => false,
        }
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.slots.read().expect("store lock poisoned").objects.get(id).cloned())
    }

    fn write(&self, id: &ObjectId, data: &[u8]) -> StoreResult<bool> {
        if id.is_null() {
            return Err(StoreError::NullObjectId);
        }
        let mut slots = self.slots.write().expect("store lock poisoned");
        if slots.objects.contains_key(id) {
            trace!(id = %id.short_hex(), "write skipped, already present");
            return Ok(false);
        }
        slots.objects.insert(*id, data.to_vec());
        slots.mutations += 1;
        Ok(true)
    }

    fn replace(&self, id: &ObjectId, data: &[u8]) -> StoreResult<()> {
        if id.is_null() {
            return Err(StoreError::NullObjectId);
        }
        let mut slots = self.slots.write().expect("store lock poisoned");
        slots.objects.insert(*id, data.to_vec());
        slots.mutations += 1;
        Ok(())
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.slots.read().expect("store lock poisoned").objects.contains_key(id))
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self
            .slots
            .write()
            .expect("store lock poisoned")
            .objects
            .remove(id)
            .is_some())
    }

    fn list(&self) -> StoreResult<Vec<ObjectId>> {
        // BTreeMap keys are already in order.
        Ok(self.slots.read().expect("store lock poisoned").objects.keys().copied().collect())
    }

    fn size_of(&self, id: &ObjectId) -> StoreResult<Option<u64>> {
        Ok(self
            .slots
            .read()
            .expect("store lock poisoned")
            .objects
            .get(id)
            .map(|b| b.len() as u64))
    }
}

impl fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read().expect("store lock poisoned");
        f.debug_struct("InMemoryObjectStore")
            .field("objects", &slots.objects.len())
            .field("mutations", &slots.mutations)
            .finish()
    }
}
