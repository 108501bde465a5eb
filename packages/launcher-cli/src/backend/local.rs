// Local filesystem backend: bare paths and file:// URLs
use super::{scheme_of, Backend, BackendDescriptor, BackendSettings, Priority, StagedDir, StagedFile};
use crate::error::{ConfigError, TransferError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const KIND: &str = "local";

/// Local filesystem backend
///
/// Catch-all: it claims every identifier without a scheme, so it resolves last.
/// Inputs are hard-linked into the staging directory where possible and copied
/// otherwise.
pub struct LocalBackend {
    descriptor: BackendDescriptor,
    base_dir: Option<PathBuf>,
}

impl LocalBackend {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: BackendDescriptor {
                name: name.to_string(),
                kind: KIND.to_string(),
                priority: Priority::Fallback,
                required_keys: Vec::new(),
                handles: "local paths, file://".to_string(),
            },
            base_dir: None,
        }
    }

    /// Map an identifier to the path it names on this machine
    fn resolve_path(&self, identifier: &str) -> Result<PathBuf, TransferError> {
        let path = if scheme_of(identifier).as_deref() == Some("file") {
            url::Url::parse(identifier)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| {
                    TransferError::invalid_identifier(format!("not a local file URL: {}", identifier))
                })?
        } else {
            PathBuf::from(identifier)
        };

        if path.is_absolute() {
            return Ok(path);
        }

        match &self.base_dir {
            Some(base) => Ok(base.join(path)),
            None => Ok(path),
        }
    }

    async fn copy_file(source: &Path, target: &Path) -> Result<(), TransferError> {
        let staged = StagedFile::create(target).await?;
        fs::copy(source, staged.path())
            .await
            .map_err(|e| TransferError::from_io(&e, source.display()))?;
        staged.commit()
    }

    async fn copy_dir(source: &Path, target: &Path) -> Result<(), TransferError> {
        let staged = StagedDir::create(target).await?;
        copy_tree(source, staged.path()).await?;
        staged.commit().await
    }

    async fn transfer(source: &Path, target: &Path, link: bool) -> Result<(), TransferError> {
        let metadata = fs::metadata(source)
            .await
            .map_err(|e| TransferError::from_io(&e, source.display()))?;

        if metadata.is_dir() {
            return Self::copy_dir(source, target).await;
        }

        if link {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransferError::from_io(&e, parent.display()))?;
            }
            match fs::hard_link(source, target).await {
                Ok(()) => {
                    tracing::debug!("Hard-linked {} to {}", source.display(), target.display());
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        "Could not link {} to {} ({}), copying instead",
                        source.display(),
                        target.display(),
                        e
                    );
                }
            }
        }

        Self::copy_file(source, target).await
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn claims(&self, identifier: &str) -> bool {
        !identifier.is_empty()
            && match scheme_of(identifier) {
                None => true,
                Some(scheme) => scheme == "file",
            }
    }

    fn configure(&mut self, settings: &BackendSettings) -> Result<(), ConfigError> {
        if let Some(base) = settings.get("base-dir") {
            self.base_dir = Some(PathBuf::from(base));
        }
        Ok(())
    }

    fn supports_directories(&self) -> bool {
        true
    }

    async fn download(&self, identifier: &str, target: &Path) -> Result<(), TransferError> {
        let source = self.resolve_path(identifier)?;
        Self::transfer(&source, target, true).await
    }

    async fn upload(
        &self,
        source: &Path,
        identifier: &str,
        _metadata: Option<&str>,
    ) -> Result<(), TransferError> {
        let destination = self.resolve_path(identifier)?;
        // outputs leave the staging directory, which is removed afterwards; copy
        Self::transfer(source, &destination, false).await
    }
}

/// Recursively copy the contents of `source` into the existing directory `target`
async fn copy_tree(source: &Path, target: &Path) -> Result<(), TransferError> {
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| TransferError::from_io(&e, from.display()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransferError::from_io(&e, from.display()))?
        {
            let path = entry.path();
            let dest = to.join(entry.file_name());
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| TransferError::from_io(&e, path.display()))?;

            if file_type.is_dir() {
                fs::create_dir_all(&dest)
                    .await
                    .map_err(|e| TransferError::from_io(&e, dest.display()))?;
                pending.push((path, dest));
            } else {
                fs::copy(&path, &dest)
                    .await
                    .map_err(|e| TransferError::from_io(&e, path.display()))?;
            }
        }
    }

    Ok(())
}
