use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use ledgit_resilience::RemoteError;
use ledgit_types::ObjectId;
use tracing::debug;

use super::{Locator, RemoteStorage};

/// Remote backend that mirrors objects into a directory.
///
/// Useful as a stand-in for a real provider (a mounted bucket, a network
/// share) and for end-to-end tests of the CLI. Locators are file names.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    id: String,
    root: PathBuf,
}

impl DirectoryRemote {
    /// Create the directory if needed.
    pub fn create(id: impl Into<String>, root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            id: id.into(),
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &Locator) -> Result<PathBuf, RemoteError> {
        let name = locator.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(RemoteError::NotFound(format!("invalid locator {name:?}")));
        }
        Ok(self.root.join(name))
    }
}

fn map_io(context: &str, e: io::Error) -> RemoteError {
    match e.kind() {
        io::ErrorKind::NotFound => RemoteError::NotFound(context.to_string()),
        io::ErrorKind::PermissionDenied => RemoteError::PermissionDenied(context.to_string()),
        io::ErrorKind::TimedOut => RemoteError::Timeout(std::time::Duration::ZERO),
        _ => RemoteError::Transient(format!("{context}: {e}")),
    }
}

#[async_trait]
impl RemoteStorage for DirectoryRemote {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn put_object(&self, data: Bytes) -> Result<Locator, RemoteError> {
        let name = ObjectId::from_bytes(&data).to_hex();
        let locator = Locator::new(name.clone());
        let path = self.root.join(&name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(locator);
        }
        let staging = self.root.join(format!(".{name}.{}.tmp", std::process::id()));
        tokio::fs::write(&staging, &data)
            .await
            .map_err(|e| map_io("write staging file", e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| map_io("publish object", e))?;
        debug!(backend = %self.id, locator = %locator, len = data.len(), "object mirrored");
        Ok(locator)
    }

    async fn get_object(&self, locator: &Locator) -> Result<Bytes, RemoteError> {
        let path = self.path_for(locator)?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| map_io(locator.as_str(), e))
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, RemoteError> {
        let path = self.path_for(locator)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| map_io(locator.as_str(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemote::create("mirror", &dir.path().join("remote")).unwrap();
        let loc = remote.put_object(Bytes::from_static(b"payload")).await.unwrap();
        assert!(remote.exists(&loc).await.unwrap());
        assert_eq!(remote.get_object(&loc).await.unwrap(), Bytes::from_static(b"payload"));

        let again = remote.put_object(Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(again, loc);
        assert_eq!(std::fs::read_dir(remote.root()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn missing_and_invalid_locators() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemote::create("mirror", dir.path()).unwrap();
        assert!(matches!(
            remote.get_object(&Locator::new("absent")).await,
            Err(RemoteError::NotFound(_))
        ));
        assert!(matches!(
            remote.get_object(&Locator::new("../escape")).await,
            Err(RemoteError::NotFound(_))
        ));
        assert!(!remote.exists(&Locator::new("absent")).await.unwrap());
    }
}
