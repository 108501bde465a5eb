// HTTP(S) backend: streaming GET for inputs, PUT for outputs
use super::{scheme_of, Backend, BackendDescriptor, BackendSettings, Priority, StagedFile};
use crate::error::{ConfigError, FailureKind, TransferError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub const KIND: &str = "http";

const DEFAULT_TIMEOUT_SECS: u64 = 300;

pub struct HttpBackend {
    descriptor: BackendDescriptor,
    client: Option<reqwest::Client>,
    bearer_token: Option<String>,
}

impl HttpBackend {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: BackendDescriptor {
                name: name.to_string(),
                kind: KIND.to_string(),
                priority: Priority::Explicit,
                required_keys: Vec::new(),
                handles: "http://, https://".to_string(),
            },
            client: None,
            bearer_token: None,
        }
    }

    fn client(&self) -> Result<&reqwest::Client, TransferError> {
        self.client
            .as_ref()
            .ok_or_else(|| TransferError::backend(format!("backend `{}` was never configured", self.descriptor.name)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success status to a failure kind
pub(crate) fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::AuthRejected,
        StatusCode::NOT_FOUND | StatusCode::GONE => FailureKind::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FailureKind::Transient,
        s if s.is_server_error() => FailureKind::Transient,
        _ => FailureKind::Backend,
    }
}

fn classify_request_error(err: &reqwest::Error, identifier: &str) -> TransferError {
    let message = format!("{}: {}", identifier, err);
    if err.is_timeout() || err.is_connect() {
        return TransferError::transient(message);
    }
    match err.status() {
        Some(status) => TransferError::new(classify_status(status), message),
        None => TransferError::backend(message),
    }
}

fn status_error(status: StatusCode, identifier: &str) -> TransferError {
    TransferError::new(
        classify_status(status),
        format!("{} returned HTTP {}", identifier, status),
    )
}

#[async_trait]
impl Backend for HttpBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn claims(&self, identifier: &str) -> bool {
        matches!(scheme_of(identifier).as_deref(), Some("http") | Some("https"))
    }

    fn configure(&mut self, settings: &BackendSettings) -> Result<(), ConfigError> {
        let timeout = match settings.get("timeout-secs") {
            Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                backend: self.descriptor.name.clone(),
                key: "timeout-secs".to_string(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                backend: self.descriptor.name.clone(),
                key: "timeout-secs".to_string(),
                reason: e.to_string(),
            })?;

        self.client = Some(client);
        self.bearer_token = settings.get("bearer-token").cloned();
        Ok(())
    }

    async fn download(&self, identifier: &str, target: &Path) -> Result<(), TransferError> {
        let response = self
            .authorize(self.client()?.get(identifier))
            .send()
            .await
            .map_err(|e| classify_request_error(&e, identifier))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), identifier));
        }

        let staged = StagedFile::create(target).await?;
        let mut file = fs::File::create(staged.path())
            .await
            .map_err(|e| TransferError::from_io(&e, target.display()))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| classify_request_error(&e, identifier))?;
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
        _metadata: Option<&str>,
    ) -> Result<(), TransferError> {
        let client = self.client()?;
        let file = fs::File::open(source)
            .await
            .map_err(|e| TransferError::from_io(&e, source.display()))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| TransferError::from_io(&e, source.display()))?
            .len();

        let response = self
            .authorize(client.put(identifier))
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| classify_request_error(&e, identifier))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), identifier));
        }

        Ok(())
    }
}
