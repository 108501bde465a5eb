// Object-store backend for s3://bucket/key identifiers
use super::{require, scheme_of, Backend, BackendDescriptor, BackendSettings, Priority, StagedFile};
use crate::error::{ConfigError, FailureKind, TransferError};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const KIND: &str = "s3";

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Backend {
    descriptor: BackendDescriptor,
    client: Option<Client>,
}

impl S3Backend {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: BackendDescriptor {
                name: name.to_string(),
                kind: KIND.to_string(),
                priority: Priority::Explicit,
                required_keys: vec!["access-key".to_string(), "secret-key".to_string()],
                handles: "s3://".to_string(),
            },
            client: None,
        }
    }

    fn client(&self) -> Result<&Client, TransferError> {
        self.client
            .as_ref()
            .ok_or_else(|| TransferError::backend(format!("backend `{}` was never configured", self.descriptor.name)))
    }
}

/// Split `s3://bucket/some/key` into `("bucket", "some/key")`
pub(crate) fn split_location(identifier: &str) -> Result<(&str, &str), TransferError> {
    let trimmed = identifier
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("s3://"))
        .and_then(|_| identifier.get(5..))
        .ok_or_else(|| TransferError::invalid_identifier(format!("not an s3:// identifier: {}", identifier)))?;

    match trimmed.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(TransferError::invalid_identifier(format!(
            "expected s3://bucket/key, got {}",
            identifier
        ))),
    }
}

fn classify_sdk_error<E, R>(err: &SdkError<E, R>, identifier: &str) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{}: {}", identifier, DisplayErrorContext(err));
    let kind = match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => FailureKind::Transient,
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch")
            | Some("ExpiredToken") => FailureKind::AuthRejected,
            Some("NoSuchKey") | Some("NoSuchBucket") => FailureKind::NotFound,
            Some("SlowDown") | Some("InternalError") | Some("ServiceUnavailable")
            | Some("RequestTimeout") => FailureKind::Transient,
            _ => FailureKind::Backend,
        },
        _ => FailureKind::Backend,
    };
    TransferError::new(kind, message)
}

#[async_trait]
impl Backend for S3Backend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn claims(&self, identifier: &str) -> bool {
        scheme_of(identifier).as_deref() == Some("s3")
    }

    fn configure(&mut self, settings: &BackendSettings) -> Result<(), ConfigError> {
        let name = self.descriptor.name.clone();
        let access_key = require(settings, &name, "access-key")?;
        let secret_key = require(settings, &name, "secret-key")?;
        let region = settings
            .get("region")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let credentials = Credentials::new(access_key, secret_key, None, None, "launcher-config");
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials);

        if let Some(endpoint) = settings.get("endpoint") {
            tracing::info!(backend = %name, "Using custom S3 endpoint {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        self.client = Some(Client::from_conf(builder.build()));
        Ok(())
    }

    async fn download(&self, identifier: &str, target: &Path) -> Result<(), TransferError> {
        let (bucket, key) = split_location(identifier)?;
        let client = self.client()?;

        let object = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, identifier))?;

        let staged = StagedFile::create(target).await?;
        let mut file = fs::File::create(staged.path())
            .await
            .map_err(|e| TransferError::from_io(&e, target.display()))?;

        let mut body = object.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| TransferError::transient(format!("{}: {}", identifier, e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::from_io(&e, target.display()))?;
        }

        file.sync_all()
            .await
            .map_err(|e| TransferError::from_io(&e, target.display()))?;
        drop(file);

        staged.commit()
    }

    async fn upload(
        &self,
        source: &Path,
        identifier: &str,
        metadata: Option<&str>,
    ) -> Result<(), TransferError> {
        let (bucket, key) = split_location(identifier)?;
        let client = self.client()?;

        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| TransferError::local_disk(format!("{}: {}", source.display(), e)))?;

        let mut request = client.put_object().bucket(bucket).key(key).body(body);
        if let Some(metadata) = metadata {
            request = request.metadata("launcher-metadata", metadata);
        }

        request
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, identifier))?;

        Ok(())
    }
}
