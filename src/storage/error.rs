//! Storage error taxonomy

use crate::core::path::PathError;
use std::io;
use thiserror::Error;

/// Errors returned by a [`Storage`](super::Storage) backend.
///
/// Only [`StorageError::Transport`] is retryable. Everything else describes
/// the state of the resource and will not change by asking again.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("insufficient storage: {0}")]
    QuotaExceeded(String),

    #[error("operation not supported by {backend}: {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    /// The backend returned a path that does not fit under the root.
    #[error("invalid path from server: {0}")]
    InvalidPath(#[from] PathError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Transient network failures are the only ones worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Map a local I/O error onto the domain taxonomy.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::Conflict(path.to_string()),
            io::ErrorKind::StorageFull => StorageError::QuotaExceeded(path.to_string()),
            io::ErrorKind::DirectoryNotEmpty => {
                StorageError::Conflict(format!("{}: directory not empty", path))
            }
            io::ErrorKind::NotADirectory => {
                StorageError::Conflict(format!("{}: not a directory", path))
            }
            _ => StorageError::Io(err),
        }
    }
}

impl From<opendal::Error> for StorageError {
    fn from(err: opendal::Error) -> Self {
        use opendal::ErrorKind;

        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(message),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(message),
            ErrorKind::AlreadyExists
            | ErrorKind::IsADirectory
            | ErrorKind::NotADirectory
            | ErrorKind::ConditionNotMatch
            | ErrorKind::IsSameFile => StorageError::Conflict(message),
            ErrorKind::Unsupported => StorageError::Unsupported {
                backend: "webdav".to_string(),
                operation: "request",
            },
            ErrorKind::RateLimited => StorageError::Transport(message),
            // WebDAV servers answer 507 Insufficient Storage and 409 Conflict
            // (missing parent collection); opendal surfaces both as Unexpected.
            _ if message.contains("507") || message.contains("Insufficient Storage") => {
                StorageError::QuotaExceeded(message)
            }
            _ if message.contains("409") => StorageError::Conflict(message),
            _ => StorageError::Transport(message),
        }
    }
}
