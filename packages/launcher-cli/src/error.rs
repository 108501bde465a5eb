// Typed failures shared by backends, the registry, and the provision engine
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Classification of a failed transfer, carried into the launch report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No registered backend claims the identifier
    NoCapableBackend,
    /// More than one explicit backend claims the identifier
    AmbiguousBackend,
    /// Timeouts, dropped connections, throttling. Retried.
    Transient,
    /// Credentials rejected by the remote side
    AuthRejected,
    /// The remote object or local source does not exist
    NotFound,
    /// The identifier is malformed for the backend that claimed it
    InvalidIdentifier,
    /// Local filesystem failure (disk full, permissions)
    LocalDisk,
    /// The backend does not implement this direction
    Unsupported,
    /// Backend failure that could not be classified
    Backend,
    /// A declared output was not produced by the run
    MissingOutput,
    /// Dispatch was halted by a cancellation request
    Cancelled,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NoCapableBackend => "no_capable_backend",
            FailureKind::AmbiguousBackend => "ambiguous_backend",
            FailureKind::Transient => "transient",
            FailureKind::AuthRejected => "auth_rejected",
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidIdentifier => "invalid_identifier",
            FailureKind::LocalDisk => "local_disk",
            FailureKind::Unsupported => "unsupported",
            FailureKind::Backend => "backend",
            FailureKind::MissingOutput => "missing_output",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed download or upload. Backends return this instead of panicking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AuthRejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidIdentifier, message)
    }

    pub fn local_disk(message: impl Into<String>) -> Self {
        Self::new(FailureKind::LocalDisk, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unsupported, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Backend, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    /// Classify a local I/O error raised while touching `context`
    pub fn from_io(err: &io::Error, context: impl fmt::Display) -> Self {
        let message = format!("{}: {}", context, err);
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(message),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted => Self::transient(message),
            _ => Self::local_disk(message),
        }
    }
}

/// Raised while configuring a backend; the backend is disabled, not fatal
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("backend `{backend}` is missing required configuration key `{key}`")]
    MissingKey { backend: String, key: String },

    #[error("backend `{backend}` has an invalid value for `{key}`: {reason}")]
    InvalidValue {
        backend: String,
        key: String,
        reason: String,
    },

    #[error("plugin `{name}` declares unknown backend kind `{kind}`")]
    UnknownKind { name: String, kind: String },

    #[error("plugin `{0}` is declared more than once")]
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no capable backend for `{0}`")]
    NotFound(String),

    #[error("`{identifier}` is claimed by more than one backend: {}", .backends.join(", "))]
    Ambiguous {
        identifier: String,
        backends: Vec<String>,
    },
}

impl From<ResolveError> for TransferError {
    fn from(err: ResolveError) -> Self {
        let kind = match err {
            ResolveError::NotFound(_) => FailureKind::NoCapableBackend,
            ResolveError::Ambiguous { .. } => FailureKind::AmbiguousBackend,
        };
        TransferError::new(kind, err.to_string())
    }
}

/// Problems found while turning a descriptor and job document into entries
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("job field `{field}` is not a valid data reference: {reason}")]
    InvalidReference { field: String, reason: String },

    #[error("descriptor output `{0}` was declared but not produced by the run")]
    MissingOutput(String),

    #[error("failed to list produced output `{field}`: {reason}")]
    UnreadableOutput { field: String, reason: String },

    #[error("job field `{field}`: directory `{identifier}` has no listing and its backend only transfers files")]
    DirectoryUnsupported { field: String, identifier: String },

    #[error("output `{field}` lists {destinations} destinations but the run produced {produced} files")]
    DestinationMismatch {
        field: String,
        destinations: usize,
        produced: usize,
    },
}
