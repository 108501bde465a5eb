// Institutional data repository backend (`icgc:<object-id>`)
//
// Transfers go through the repository's own storage client. The client only
// reports success or failure, so errors are returned unclassified and the
// provision engine classifies them by message.
use super::{require, scheme_of, Backend, BackendDescriptor, BackendSettings, Priority};
use crate::error::{ConfigError, TransferError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;

pub const KIND: &str = "dcc";

const SCHEME: &str = "icgc";

pub struct DccStorageBackend {
    descriptor: BackendDescriptor,
    client: Option<PathBuf>,
}

impl DccStorageBackend {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: BackendDescriptor {
                name: name.to_string(),
                kind: KIND.to_string(),
                priority: Priority::Explicit,
                required_keys: vec!["client".to_string()],
                handles: format!("{}:<object-id>", SCHEME),
            },
            client: None,
        }
    }

    fn object_id(identifier: &str) -> Result<String, TransferError> {
        identifier
            .split_once(':')
            .map(|(_, id)| id.trim_start_matches('/').to_ascii_lowercase())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransferError::invalid_identifier(format!("missing object id in {}", identifier)))
    }
}

#[async_trait]
impl Backend for DccStorageBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn claims(&self, identifier: &str) -> bool {
        scheme_of(identifier).as_deref() == Some(SCHEME)
    }

    fn configure(&mut self, settings: &BackendSettings) -> Result<(), ConfigError> {
        let client = require(settings, &self.descriptor.name, "client")?;
        self.client = Some(PathBuf::from(client));
        Ok(())
    }

    async fn download(&self, identifier: &str, target: &Path) -> Result<(), TransferError> {
        let object_id = Self::object_id(identifier)?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransferError::backend(format!("backend `{}` was never configured", self.descriptor.name)))?;

        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::from_io(&e, parent.display()))?;

        // the client writes <output-dir>/<object-id>; keep that inside a scratch dir
        let scratch = tempfile::Builder::new()
            .prefix(".dcc-")
            .tempdir_in(parent)
            .map_err(|e| TransferError::from_io(&e, parent.display()))?;

        tracing::debug!(backend = %self.descriptor.name, "Running {} for {}", client.display(), object_id);
        let output = Command::new(client)
            .arg("--quiet")
            .arg("download")
            .arg("--object-id")
            .arg(&object_id)
            .arg("--output-dir")
            .arg(scratch.path())
            .arg("--output-layout")
            .arg("id")
            .output()
            .await
            .map_err(|e| TransferError::backend(format!("could not run {}: {}", client.display(), e)))?;

        if !output.status.success() {
            return Err(TransferError::backend(format!(
                "storage client failed for {} ({}): {}",
                identifier,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let downloaded = scratch.path().join(&object_id);
        fs::rename(&downloaded, target).await.map_err(|e| {
            TransferError::backend(format!(
                "storage client did not produce {}: {}",
                downloaded.display(),
                e
            ))
        })
    }

    async fn upload(
        &self,
        _source: &Path,
        identifier: &str,
        _metadata: Option<&str>,
    ) -> Result<(), TransferError> {
        Err(TransferError::unsupported(format!(
            "backend `{}` cannot upload to {}",
            self.descriptor.name, identifier
        )))
    }
}
