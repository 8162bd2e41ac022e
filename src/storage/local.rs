use super::{ByteStream, Capabilities, Entry, ResourceKind, Storage, StorageError, CHUNK_SIZE};
use crate::core::path::RelPath;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;

/// Suffix of the temporary file a store writes before renaming into place.
const PARTIAL_SUFFIX: &str = ".davsync-part";

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    /// The base directory does not have to exist yet; the engine creates it
    /// when it is the destination of a sync.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let base_path = path.as_ref().to_path_buf();
        let name = format!("local:{}", base_path.display());
        Self { base_path, name }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `RelPath` has no `..` segments, so the result stays under the base.
    fn resolve_path(&self, path: &RelPath) -> PathBuf {
        if path.is_root() {
            self.base_path.clone()
        } else {
            path.as_str()
                .split('/')
                .fold(self.base_path.clone(), |acc, segment| acc.join(segment))
        }
    }

    fn entry_from_metadata(path: RelPath, metadata: &std::fs::Metadata) -> Entry {
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        if metadata.is_dir() {
            Entry::directory(path, modified)
        } else {
            Entry::file(path, metadata.len(), modified)
        }
    }

    fn partial_path(full_path: &Path) -> PathBuf {
        let mut name = full_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(PARTIAL_SUFFIX);
        full_path.with_file_name(name)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, path: &RelPath) -> Result<Entry, StorageError> {
        let metadata = fs::metadata(self.resolve_path(path))
            .await
            .map_err(|e| StorageError::from_io(e, path.as_str()))?;
        Ok(Self::entry_from_metadata(path.clone(), &metadata))
    }

    async fn list_children(&self, dir: &RelPath) -> Result<Vec<Entry>, StorageError> {
        let full_path = self.resolve_path(dir);
        let mut read_dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| StorageError::from_io(e, dir.as_str()))?;

        let mut children = Vec::new();
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, dir.as_str()))?
        {
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                warn!("skipping non UTF-8 name in {}: {:?}", full_path.display(), file_name);
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let child = match dir.child(name) {
                Ok(child) => child,
                Err(e) => {
                    warn!("skipping {}: {}", name, e);
                    continue;
                }
            };
            // follows symlinks, so a linked directory is walked as a directory
            let metadata = match fs::metadata(item.path()).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping {}: {}", item.path().display(), e);
                    continue;
                }
            };
            children.push(Self::entry_from_metadata(child, &metadata));
        }

        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    async fn create_dir(&self, path: &RelPath) -> Result<(), StorageError> {
        let full_path = self.resolve_path(path);
        match fs::create_dir(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if fs::metadata(&full_path).await.map(|m| m.is_dir()).unwrap_or(false) {
                    Ok(())
                } else {
                    Err(StorageError::Conflict(format!("{}: a file is in the way", path)))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::Conflict(
                format!("{}: parent directory does not exist", path),
            )),
            Err(e) => Err(StorageError::from_io(e, path.as_str())),
        }
    }

    async fn delete(&self, path: &RelPath, kind: ResourceKind) -> Result<(), StorageError> {
        let full_path = self.resolve_path(path);
        let result = match kind {
            ResourceKind::File => fs::remove_file(&full_path).await,
            ResourceKind::Directory => fs::remove_dir(&full_path).await,
        };
        result.map_err(|e| StorageError::from_io(e, path.as_str()))
    }

    async fn delete_all(&self, path: &RelPath) -> Result<(), StorageError> {
        let full_path = self.resolve_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| StorageError::from_io(e, path.as_str()))?;
        let result = if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        result.map_err(|e| StorageError::from_io(e, path.as_str()))
    }

    async fn fetch(&self, path: &RelPath) -> Result<ByteStream, StorageError> {
        let file = fs::File::open(self.resolve_path(path))
            .await
            .map_err(|e| StorageError::from_io(e, path.as_str()))?;
        if file.metadata().await?.is_dir() {
            return Err(StorageError::Conflict(format!("{}: is a directory", path)));
        }
        let stream = ReaderStream::with_capacity(file, CHUNK_SIZE).map_err(StorageError::Io);
        Ok(Box::pin(stream))
    }

    async fn store(&self, path: &RelPath, mut data: ByteStream) -> Result<u64, StorageError> {
        if path.is_root() {
            return Err(StorageError::Conflict("cannot store onto the root".to_string()));
        }
        let full_path = self.resolve_path(path);
        let temp_path = Self::partial_path(&full_path);

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::Conflict(format!("{}: parent directory does not exist", path))
            } else {
                StorageError::from_io(e, path.as_str())
            }
        })?;

        let mut written = 0u64;
        let result: Result<(), StorageError> = async {
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| StorageError::from_io(e, path.as_str()))?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        // write to a temporary file first, then rename into place
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::from_io(e, path.as_str()));
        }
        Ok(written)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            copy: true,
            rename: true,
            publish: false,
        }
    }

    async fn copy(&self, from: &RelPath, to: &RelPath) -> Result<(), StorageError> {
        let source = self.resolve_path(from);
        if fs::metadata(&source)
            .await
            .map_err(|e| StorageError::from_io(e, from.as_str()))?
            .is_dir()
        {
            return Err(StorageError::Conflict(format!(
                "{}: directory copy is not supported locally",
                from
            )));
        }
        fs::copy(&source, self.resolve_path(to))
            .await
            .map_err(|e| StorageError::from_io(e, to.as_str()))?;
        Ok(())
    }

    async fn rename(&self, from: &RelPath, to: &RelPath) -> Result<(), StorageError> {
        fs::rename(self.resolve_path(from), self.resolve_path(to))
            .await
            .map_err(|e| StorageError::from_io(e, from.as_str()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
