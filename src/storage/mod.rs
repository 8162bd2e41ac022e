pub mod error;
pub mod local;
pub mod webdav;

use crate::config::ConnectionConfig;
use crate::core::path::RelPath;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

pub use error::StorageError;
pub use local::LocalStorage;
pub use webdav::WebDavStorage;

/// Default chunk size for streamed reads and writes.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Streamed file content.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    File,
    Directory,
}

/// One node observed in a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub path: RelPath,
    pub kind: ResourceKind,
    /// Bytes; always 0 for directories.
    pub size: u64,
    /// Not every server reports a reliable timestamp.
    pub modified: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn file(path: RelPath, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            path,
            kind: ResourceKind::File,
            size,
            modified,
        }
    }

    pub fn directory(path: RelPath, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            path,
            kind: ResourceKind::Directory,
            size: 0,
            modified,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ResourceKind::Directory
    }
}

/// Optional verbs, queried once per backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub copy: bool,
    pub rename: bool,
    pub publish: bool,
}

/// The operations the sync engine needs from either side of a sync.
///
/// Implementations must tolerate concurrent independent calls: the transfer
/// executor keeps one call in flight per active worker.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Metadata of a single resource. `NotFound` when absent.
    async fn stat(&self, path: &RelPath) -> Result<Entry, StorageError>;

    /// Direct children of a directory, not recursive.
    async fn list_children(&self, dir: &RelPath) -> Result<Vec<Entry>, StorageError>;

    /// Create one directory. The parent must exist; an existing directory at
    /// `path` is not an error, an existing file is a `Conflict`.
    async fn create_dir(&self, path: &RelPath) -> Result<(), StorageError>;

    /// Remove a file, or an empty directory.
    async fn delete(&self, path: &RelPath, kind: ResourceKind) -> Result<(), StorageError>;

    /// Remove a resource and everything below it.
    async fn delete_all(&self, path: &RelPath) -> Result<(), StorageError> {
        let root = self.stat(path).await?;
        if !root.is_dir() {
            return self.delete(path, ResourceKind::File).await;
        }

        let mut found = Vec::new();
        let mut pending = vec![path.clone()];
        while let Some(dir) = pending.pop() {
            for child in self.list_children(&dir).await? {
                if child.is_dir() {
                    pending.push(child.path.clone());
                }
                found.push(child);
            }
        }

        found.sort_by(|a, b| b.path.depth().cmp(&a.path.depth()));
        for entry in found {
            self.delete(&entry.path, entry.kind).await?;
        }
        self.delete(path, ResourceKind::Directory).await
    }

    /// Open a file for streamed reading.
    async fn fetch(&self, path: &RelPath) -> Result<ByteStream, StorageError>;

    /// Write `data` to `path`, replacing any existing file. A stream error
    /// aborts the write and is returned unchanged. Returns bytes written.
    async fn store(&self, path: &RelPath, data: ByteStream) -> Result<u64, StorageError>;

    async fn exists(&self, path: &RelPath) -> Result<bool, StorageError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Server-side copy within the same storage.
    async fn copy(&self, _from: &RelPath, _to: &RelPath) -> Result<(), StorageError> {
        Err(self.unsupported("copy"))
    }

    /// Server-side move within the same storage.
    async fn rename(&self, _from: &RelPath, _to: &RelPath) -> Result<(), StorageError> {
        Err(self.unsupported("rename"))
    }

    /// Publish a resource and return its public link.
    async fn publish(&self, _path: &RelPath) -> Result<String, StorageError> {
        Err(self.unsupported("publish"))
    }

    async fn unpublish(&self, _path: &RelPath) -> Result<(), StorageError> {
        Err(self.unsupported("unpublish"))
    }

    /// Available bytes, when the backend reports a quota.
    async fn free_space(&self) -> Result<Option<u64>, StorageError> {
        Ok(None)
    }

    /// Name used in logs.
    fn name(&self) -> &str;

    fn unsupported(&self, operation: &'static str) -> StorageError {
        StorageError::Unsupported {
            backend: self.name().to_string(),
            operation,
        }
    }
}

/// Connect to the remote tree described by `config`, rooted at `subdir`.
pub fn create_remote(
    config: &ConnectionConfig,
    subdir: &RelPath,
) -> Result<Arc<dyn Storage>, StorageError> {
    let root = crate::core::path::join(config.root.as_deref().unwrap_or(""), subdir);
    tracing::info!("connecting to WebDAV: endpoint={}, root={}", config.endpoint, root);
    Ok(Arc::new(WebDavStorage::new(config, &root)?) as Arc<dyn Storage>)
}
