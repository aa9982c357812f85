use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use ledgit_types::ObjectId;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Filesystem object store.
///
/// On-disk layout:
/// ```text
/// <root>/objects/ab/abcdef...   one file per object, named by full hex id
/// <root>/tmp/                   staging area for in-progress writes
/// ```
///
/// Every write goes to a temp file in `tmp/` first and is then renamed into
/// place, so a crash never leaves a half-written object under its id.
/// New objects are persisted with no-clobber semantics, which makes
/// first-writer-wins hold across processes too.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open an existing store. A missing root directory is an error: the
    /// store was never initialised and nothing should be written blindly.
    pub fn open(root: &Path) -> StoreResult<Self> {
        if !root.is_dir() {
            return Err(StoreError::MissingRoot(root.to_path_buf()));
        }
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Create the store directory (and parents) if needed, then open it.
    pub fn create(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root)?;
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(id.fanout())
            .join(id.to_hex())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn stage(&self, id: &ObjectId, data: &[u8]) -> StoreResult<(NamedTempFile, PathBuf)> {
        if id.is_null() {
            return Err(StoreError::NullObjectId);
        }
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = NamedTempFile::new_in(self.tmp_dir())?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok((tmp, path))
    }
}

impl ObjectStore for FsObjectStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.object_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &ObjectId, data: &[u8]) -> StoreResult<bool> {
        if self.object_path(id).exists() {
            return Ok(false);
        }
        let (tmp, path) = self.stage(id, data)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(id = %id.short_hex(), len = data.len(), "object written");
                Ok(true)
            }
            // Another writer got there first; its bytes stand.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    fn replace(&self, id: &ObjectId, data: &[u8]) -> StoreResult<()> {
        let (tmp, path) = self.stage(id, data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(id = %id.short_hex(), len = data.len(), "object replaced");
        Ok(())
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.object_path(id).is_file())
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        match fs::remove_file(self.object_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> StoreResult<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(self.root.join(OBJECTS_DIR))
            .min_depth(2)
            .max_depth(2)
        {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory walk failed"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            match ObjectId::from_hex(&name) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(path = %entry.path().display(), "ignoring stray file in object directory"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn size_of(&self, id: &ObjectId) -> StoreResult<Option<u64>> {
        match fs::metadata(self.object_path(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clean_temp(&self, max_age: Duration) -> StoreResult<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(self.tmp_dir())? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "stale temp files removed");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for FsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsObjectStore")
            .field("root", &self.root)
            .finish()
    }
}
