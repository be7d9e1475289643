use std::path::PathBuf;

use thiserror::Error;

use crate::vault::VaultError;

/// Coarse failure category, for callers that branch on what went wrong
/// rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    Config,
    Io,
    SizeMismatch,
    VaultLookup,
    VaultCreate,
    VaultRemove,
    Decrypt,
}

/// Errors produced by the key-lifecycle core.
#[derive(Debug, Error)]
pub enum CellarError {
    /// Tenant identifier has no usable trailing segment.
    #[error("invalid tenant identifier format: {identifier}")]
    Format { identifier: String },
    /// Required external parameter is missing or unusable.
    #[error("invalid configuration `{parameter}`: {reason}")]
    Config {
        parameter: &'static str,
        reason: String,
    },
    /// Key storage directory or file could not be created, read or written.
    #[error("failed to {action} '{}': {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Persisted master key is not exactly the expected length. Never repaired.
    #[error(
        "master key file '{}' has incorrect size: expected {expected} bytes, got {actual}",
        path.display()
    )]
    SizeMismatch {
        path: PathBuf,
        expected: usize,
        actual: u64,
    },
    /// Any vault lookup failure other than a clean not-found.
    #[error("failed to look up DEK '{alt_name}': {source}")]
    VaultLookup {
        alt_name: String,
        #[source]
        source: VaultError,
    },
    #[error("failed to create DEK '{alt_name}': {source}")]
    VaultCreate {
        alt_name: String,
        #[source]
        source: VaultError,
    },
    #[error("failed to remove DEK '{alt_name}': {source}")]
    VaultRemove {
        alt_name: String,
        #[source]
        source: VaultError,
    },
    #[error("failed to decrypt value: {reason}")]
    Decrypt {
        reason: String,
        #[source]
        source: Option<VaultError>,
    },
}

impl CellarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Format { .. } => ErrorKind::Format,
            Self::Config { .. } => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::VaultLookup { .. } => ErrorKind::VaultLookup,
            Self::VaultCreate { .. } => ErrorKind::VaultCreate,
            Self::VaultRemove { .. } => ErrorKind::VaultRemove,
            Self::Decrypt { .. } => ErrorKind::Decrypt,
        }
    }

    pub(crate) fn config(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            parameter,
            reason: reason.into(),
        }
    }

    pub(crate) fn decrypt(reason: impl Into<String>) -> Self {
        Self::Decrypt {
            reason: reason.into(),
            source: None,
        }
    }

    /// Wraps an I/O failure with the action and path it concerned.
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
