use crate::core::path::{PathError, RelPath};
use crate::storage::StorageError;
use thiserror::Error;

/// Errors that abort a whole sync before (or instead of) execution.
///
/// Per-item failures never surface here; they are recorded in the
/// [`SyncReport`](crate::core::engine::SyncReport).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("inconsistent listing at {path}: {reason}")]
    WalkConsistency { path: RelPath, reason: String },

    #[error("{} unreachable subtree(s): {}", paths.len(), join_paths(paths))]
    PartialListing { paths: Vec<RelPath> },

    #[error("source root does not exist on {storage}")]
    SourceRootMissing { storage: String },

    #[error("destination root does not exist on {storage}")]
    DestinationRootMissing { storage: String },

    #[error("root of {storage} is not a directory")]
    RootNotDirectory { storage: String },

    #[error("failed to create destination root on {storage}: {source}")]
    CreateRoot {
        storage: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid exclude pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cancelled")]
    Cancelled,
}

fn join_paths(paths: &[RelPath]) -> String {
    paths
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
