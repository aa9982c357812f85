use std::path::{Path, PathBuf};

use anyhow::Context;
use ledgit_blob::BlobStoreConfig;
use ledgit_resilience::ResilienceConfig;
use serde::{Deserialize, Serialize};

/// `.ledgit/config.toml`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgitConfig {
    pub blob: BlobStoreConfig,
    pub resilience: ResilienceConfig,
    pub sync: SyncSettings,
    pub remote: Option<RemoteConfig>,
}

/// A directory standing in for remote storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Backend name; keys the circuit breaker.
    #[serde(default = "default_remote_id")]
    pub id: String,
    /// Relative paths are resolved against the repository root.
    pub path: PathBuf,
}

fn default_remote_id() -> String {
    "mirror".into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub concurrency: usize,
    /// Cap concurrency by the health monitor's recommendation.
    pub adaptive: bool,
    pub transfer_timeout_ms: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            adaptive: true,
            transfer_timeout_ms: None,
        }
    }
}

impl LedgitConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.blob.validate()?;
        self.resilience.validate()?;
        anyhow::ensure!(self.sync.concurrency > 0, "sync.concurrency must be at least 1");
        if let Some(remote) = &self.remote {
            anyhow::ensure!(!remote.id.trim().is_empty(), "remote.id must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = LedgitConfig {
            remote: Some(RemoteConfig {
                id: "mirror".into(),
                path: "../remote".into(),
            }),
            ..LedgitConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(LedgitConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: LedgitConfig = toml::from_str(
            r#"
            [resilience.breaker]
            failure_threshold = 3

            [remote]
            path = "/mnt/bucket"
            "#,
        )
        .unwrap();
        assert_eq!(config.resilience.breaker.failure_threshold, 3);
        assert_eq!(config.resilience.breaker.cooldown_ms, 30_000);
        assert_eq!(config.remote.unwrap().id, "mirror");
        assert_eq!(config.sync.concurrency, 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nconcurrency = 0\n").unwrap();
        assert!(LedgitConfig::load(&path).is_err());
    }
}
