use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use ledgit_blob::{BlobStore, DirectoryRemote, RemoteStorage};
use ledgit_resilience::ResilienceContext;
use ledgit_store::{FsObjectStore, ObjectStore};
use tracing::debug;

use crate::config::{LedgitConfig, RemoteConfig};

pub const LEDGIT_DIR: &str = ".ledgit";
const CONFIG_FILE: &str = "config.toml";
const STORE_DIR: &str = "store";
const INDEX_FILE: &str = "index.json";

/// An opened `.ledgit/` directory.
#[derive(Debug)]
pub struct Repo {
    root: PathBuf,
    config: LedgitConfig,
}

impl Repo {
    /// Create the layout under `root`, keeping an existing config.
    pub fn init(root: &Path, remote_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let dir = root.join(LEDGIT_DIR);
        FsObjectStore::create(&dir.join(STORE_DIR))
            .with_context(|| format!("creating object store in {}", dir.display()))?;
        let config_path = dir.join(CONFIG_FILE);
        let mut config = if config_path.is_file() {
            LedgitConfig::load(&config_path)?
        } else {
            LedgitConfig::default()
        };
        if let Some(path) = remote_dir {
            config.remote = Some(RemoteConfig {
                id: "mirror".into(),
                path,
            });
        }
        config.save(&config_path)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let dir = root.join(LEDGIT_DIR);
        if !dir.is_dir() {
            bail!(
                "{} is not a ledgit repository (run `ledgit init`)",
                root.display()
            );
        }
        let config_path = dir.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            LedgitConfig::load(&config_path)?
        } else {
            LedgitConfig::default()
        };
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn config(&self) -> &LedgitConfig {
        &self.config
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(LEDGIT_DIR)
    }

    fn remote_root(&self, remote: &RemoteConfig) -> PathBuf {
        if remote.path.is_absolute() {
            remote.path.clone()
        } else {
            self.root.join(&remote.path)
        }
    }

    /// Wire the object store, the optional remote and the resilience
    /// context into a blob store whose index lives in `.ledgit/`.
    pub fn blob_store(&self) -> anyhow::Result<Arc<BlobStore>> {
        let local: Arc<dyn ObjectStore> = Arc::new(
            FsObjectStore::open(&self.dir().join(STORE_DIR)).context("opening object store")?,
        );
        let remote = match &self.config.remote {
            Some(remote) => {
                let path = self.remote_root(remote);
                let dir = DirectoryRemote::create(remote.id.clone(), &path)
                    .with_context(|| format!("opening remote directory {}", path.display()))?;
                Some(Arc::new(dir) as Arc<dyn RemoteStorage>)
            }
            None => None,
        };
        let resilience = Arc::new(ResilienceContext::new(self.config.resilience.clone())?);

        let mut blob_config = self.config.blob.clone();
        if blob_config.index_path.is_none() {
            blob_config.index_path = Some(self.dir().join(INDEX_FILE));
        }
        debug!(root = %self.root.display(), remote = remote.is_some(), "opening blob store");
        Ok(Arc::new(BlobStore::new(blob_config, local, remote, resilience)?))
    }
}

#[cfg(test)]
mod tests {
    use ledgit_blob::PutHints;
    use ledgit_types::LocationSet;

    use super::*;

    #[test]
    fn open_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Repo::open(dir.path()).is_err());
        Repo::init(dir.path(), None).unwrap();
        assert!(Repo::open(dir.path()).is_ok());
    }

    #[tokio::test]
    async fn blob_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        Repo::init(dir.path(), Some("remote".into())).unwrap();

        let repo = Repo::open(dir.path()).unwrap();
        let store = repo.blob_store().unwrap();
        let r = store
            .put(b"kept between runs", PutHints::at(LocationSet::both()))
            .await
            .unwrap();
        assert!(dir.path().join("remote").is_dir());

        let reopened = Repo::open(dir.path()).unwrap().blob_store().unwrap();
        assert_eq!(reopened.meta(&r.hash()).unwrap().locations, LocationSet::both());
        assert_eq!(reopened.get(&r.hash(), None).await.unwrap(), b"kept between runs");
    }

    #[test]
    fn missing_object_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        Repo::init(dir.path(), None).unwrap();
        std::fs::remove_dir_all(dir.path().join(LEDGIT_DIR).join(STORE_DIR)).unwrap();
        let repo = Repo::open(dir.path()).unwrap();
        assert!(repo.blob_store().is_err());
    }
}
