//! Backend capability contract and the compiled-in implementations.
//!
//! A backend claims identifiers by scheme or prefix, and moves data between an
//! identifier and a local path. New backends implement [`Backend`] and are added
//! to a [`crate::registry::StrategyTable`]; nothing else in the launcher changes.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{ConfigError, TransferError};

pub mod dcc;
pub mod http;
pub mod local;
pub mod s3;

/// Settings slice handed to one backend
pub type BackendSettings = BTreeMap<String, String>;

/// Resolution order. Explicit backends are probed before the catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Explicit,
    Fallback,
}

/// Static description of a backend instance
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: String,
    pub priority: Priority,
    pub required_keys: Vec<String>,
    /// Human readable description of what it claims, e.g. `s3://`
    pub handles: String,
}

/// One output transfer, as seen by the upload-set hooks
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub source: PathBuf,
    pub identifier: String,
    pub metadata: Option<String>,
}

/// Capability set every storage backend implements
#[async_trait]
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Pure predicate; the registry probes every backend with it
    fn claims(&self, identifier: &str) -> bool;

    /// Called once by the registry before any transfer. Calling it again with
    /// the same settings leaves the backend in the same state.
    fn configure(&mut self, settings: &BackendSettings) -> Result<(), ConfigError>;

    /// Whether a directory can be transferred as one unit
    fn supports_directories(&self) -> bool {
        false
    }

    /// Fetch `identifier` into `target`. Leaves nothing at `target` on failure.
    async fn download(&self, identifier: &str, target: &Path) -> Result<(), TransferError>;

    /// Push `source` to `identifier`
    async fn upload(
        &self,
        source: &Path,
        identifier: &str,
        metadata: Option<&str>,
    ) -> Result<(), TransferError>;

    /// Called once before this backend's outputs are uploaded
    async fn prepare_upload_set(&self, _items: &[UploadItem]) -> Result<(), TransferError> {
        Ok(())
    }

    /// Called once after this backend's outputs are uploaded
    async fn finalize_upload_set(&self, _items: &[UploadItem]) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Lower-cased URI scheme of an identifier, if it has one.
/// Single letters are treated as Windows drive prefixes, not schemes.
pub fn scheme_of(identifier: &str) -> Option<String> {
    match url::Url::parse(identifier) {
        Ok(url) if url.scheme().len() > 1 => Some(url.scheme().to_ascii_lowercase()),
        _ => None,
    }
}

/// Fetch a required settings key or report which one is missing
pub fn require<'a>(
    settings: &'a BackendSettings,
    backend: &str,
    key: &str,
) -> Result<&'a str, ConfigError> {
    settings
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingKey {
            backend: backend.to_string(),
            key: key.to_string(),
        })
}

/// A temp file next to its final destination, renamed into place on commit
/// and removed when dropped uncommitted
pub struct StagedFile {
    temp: tempfile::TempPath,
    target: PathBuf,
}

impl StagedFile {
    pub async fn create(target: &Path) -> Result<Self, TransferError> {
        let parent = parent_of(target);
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| TransferError::from_io(&e, parent.display()))?;

        let temp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&parent)
            .map_err(|e| TransferError::from_io(&e, parent.display()))?
            .into_temp_path();

        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn commit(self) -> Result<(), TransferError> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| TransferError::from_io(&e.error, target.display()))
    }
}

/// Directory counterpart of [`StagedFile`]
pub struct StagedDir {
    temp: tempfile::TempDir,
    target: PathBuf,
}

impl StagedDir {
    pub async fn create(target: &Path) -> Result<Self, TransferError> {
        let parent = parent_of(target);
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| TransferError::from_io(&e, parent.display()))?;

        let temp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempdir_in(&parent)
            .map_err(|e| TransferError::from_io(&e, parent.display()))?;

        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub async fn commit(self) -> Result<(), TransferError> {
        fs::rename(self.temp.path(), &self.target)
            .await
            .map_err(|e| TransferError::from_io(&e, self.target.display()))
        // the TempDir guard now points at a missing path; its drop is a no-op
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scheme_detection() {
        assert_eq!(scheme_of("s3://bucket/key").as_deref(), Some("s3"));
        assert_eq!(scheme_of("HTTPS://example.org/x").as_deref(), Some("https"));
        assert_eq!(scheme_of("icgc:0ad0a3a9").as_deref(), Some("icgc"));
        assert_eq!(scheme_of("/local/x"), None);
        assert_eq!(scheme_of("relative/path.txt"), None);
        assert_eq!(scheme_of("C:/data/file"), None);
    }

    #[test]
    fn test_require_reports_missing_and_empty_keys() {
        let mut settings = BackendSettings::new();
        settings.insert("token".into(), "".into());

        assert_eq!(
            require(&settings, "repo", "token"),
            Err(ConfigError::MissingKey {
                backend: "repo".into(),
                key: "token".into()
            })
        );

        settings.insert("token".into(), "abc".into());
        assert_eq!(require(&settings, "repo", "token"), Ok("abc"));
    }

    #[tokio::test]
    async fn test_staged_file_commit_and_abort() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("nested").join("file.txt");

        let staged = StagedFile::create(&target).await.unwrap();
        fs::write(staged.path(), b"partial").await.unwrap();
        drop(staged);
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(temp.path().join("nested")).unwrap().count(), 0);

        let staged = StagedFile::create(&target).await.unwrap();
        fs::write(staged.path(), b"complete").await.unwrap();
        staged.commit().unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"complete");
    }

    #[tokio::test]
    async fn test_staged_dir_commit() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("dir");

        let staged = StagedDir::create(&target).await.unwrap();
        fs::write(staged.path().join("a.txt"), b"a").await.unwrap();
        staged.commit().await.unwrap();

        assert_eq!(fs::read(target.join("a.txt")).await.unwrap(), b"a");
    }
}
