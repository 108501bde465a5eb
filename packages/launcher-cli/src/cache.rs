// Input download cache
use crate::error::TransferError;
use crate::hash::Checksum;
use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Cache of previously downloaded input files, keyed by identifier
///
/// Entries live at `{root}/{key[:2]}/{key[2:4]}/{key}` where `key` is the
/// BLAKE3 digest of the identifier. Hits are hard-linked into place.
#[derive(Debug, Clone)]
pub struct ProvisionCache {
    root: PathBuf,
}

impl ProvisionCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create the cache root if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create cache directory: {}", self.root.display()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, identifier: &str) -> PathBuf {
        let hex = Checksum::of_identifier(identifier).to_hex();

        self.root.join(&hex[..2]).join(&hex[2..4]).join(&hex)
    }

    /// Place a cached copy of `identifier` at `target`. Returns false on a miss.
    pub async fn fetch(&self, identifier: &str, target: &Path) -> Result<bool, TransferError> {
        let cached = self.entry_path(identifier);
        if !cached.is_file() {
            return Ok(false);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::from_io(&e, parent.display()))?;
        }

        match fs::hard_link(&cached, target).await {
            Ok(()) => {
                tracing::info!("Found {} in cache, hard-linked", identifier);
            }
            Err(e) => {
                tracing::warn!("Cannot hard-link cached file ({}), copying instead", e);
                fs::copy(&cached, target)
                    .await
                    .map_err(|e| TransferError::from_io(&e, cached.display()))?;
                tracing::info!("Found {} in cache, copied", identifier);
            }
        }

        Ok(true)
    }

    /// Record a freshly downloaded file. Failures only cost a future cache miss.
    pub async fn store(&self, identifier: &str, source: &Path) {
        if source.is_dir() {
            return;
        }

        let cached = self.entry_path(identifier);
        if cached.exists() {
            return;
        }

        if let Some(parent) = cached.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                tracing::warn!("Cannot create cache directory {}: {}", parent.display(), e);
                return;
            }
        }

        match fs::hard_link(source, &cached).await {
            Ok(()) => tracing::debug!("Cached {} as {}", identifier, cached.display()),
            // another transfer of the same identifier got there first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => tracing::warn!("Cannot cache {}, skipping: {}", source.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_cache() -> (ProvisionCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = ProvisionCache::new(temp_dir.path().join("cache"));
        cache.initialize().await.unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (cache, temp) = create_test_cache().await;
        let target = temp.path().join("staging").join("ref");

        assert!(!cache.fetch("s3://bucket/key", &target).await.unwrap());
        assert!(!target.exists());

        let downloaded = temp.path().join("downloaded");
        fs::write(&downloaded, b"payload").await.unwrap();
        cache.store("s3://bucket/key", &downloaded).await;

        assert!(cache.fetch("s3://bucket/key", &target).await.unwrap());
        assert_eq!(fs::read(&target).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_entry_path_structure() {
        let (cache, _temp) = create_test_cache().await;

        let hex = Checksum::of_identifier("https://example.org/a").to_hex();
        let path = cache.entry_path("https://example.org/a");

        assert!(path.starts_with(cache.root()));
        assert!(path.to_str().unwrap().contains(&hex[..2]));
        assert!(path.to_str().unwrap().contains(&hex[2..4]));
        assert!(path.ends_with(&hex));
    }

    #[tokio::test]
    async fn test_directories_are_not_cached() {
        let (cache, temp) = create_test_cache().await;
        let dir = temp.path().join("dataset");
        fs::create_dir_all(&dir).await.unwrap();

        cache.store("/data/dataset", &dir).await;

        assert!(!cache.entry_path("/data/dataset").exists());
    }

    #[tokio::test]
    async fn test_store_twice_keeps_first_copy() {
        let (cache, temp) = create_test_cache().await;
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        fs::write(&first, b"first").await.unwrap();
        fs::write(&second, b"second").await.unwrap();

        cache.store("id", &first).await;
        cache.store("id", &second).await;

        assert_eq!(fs::read(cache.entry_path("id")).await.unwrap(), b"first");
    }
}
