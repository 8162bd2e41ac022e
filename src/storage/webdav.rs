use super::{ByteStream, Capabilities, Entry, ResourceKind, Storage, StorageError, CHUNK_SIZE};
use crate::config::ConnectionConfig;
use crate::core::path::RelPath;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use opendal::{Metadata, Metakey, Operator};
use tracing::{debug, warn};

pub struct WebDavStorage {
    operator: Operator,
    name: String,
    chunk_size: usize,
}

impl WebDavStorage {
    pub fn new(config: &ConnectionConfig, root: &str) -> Result<Self, StorageError> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default().endpoint(&config.endpoint).root(root);
        if let Some(ref username) = config.username {
            builder = builder.username(username);
        }
        if let Some(ref password) = config.password {
            builder = builder.password(password);
        }
        if let Some(ref token) = config.token {
            builder = builder.token(token);
        }

        let operator = Operator::new(builder)?.finish();
        let name = format!(
            "webdav://{}/{}",
            config.endpoint.trim_end_matches('/'),
            root.trim_start_matches('/')
        );

        Ok(Self::from_operator(operator, name))
    }

    /// Wrap an already configured operator.
    pub fn from_operator(operator: Operator, name: impl Into<String>) -> Self {
        Self {
            operator,
            name: name.into(),
            chunk_size: CHUNK_SIZE,
        }
    }

    fn entry_from_metadata(path: RelPath, meta: &Metadata) -> Entry {
        if meta.is_dir() {
            Entry::directory(path, meta.last_modified())
        } else {
            Entry::file(path, meta.content_length(), meta.last_modified())
        }
    }

    fn object_path(path: &RelPath) -> String {
        if path.is_root() {
            "/".to_string()
        } else {
            path.as_str().to_string()
        }
    }
}

#[async_trait]
impl Storage for WebDavStorage {
    async fn stat(&self, path: &RelPath) -> Result<Entry, StorageError> {
        let meta = match self.operator.stat(&Self::object_path(path)).await {
            Ok(meta) => meta,
            // some servers only answer PROPFIND on collections with the trailing slash
            Err(e) if e.kind() == opendal::ErrorKind::NotFound && !path.is_root() => {
                self.operator.stat(&path.as_dir()).await?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::entry_from_metadata(path.clone(), &meta))
    }

    async fn list_children(&self, dir: &RelPath) -> Result<Vec<Entry>, StorageError> {
        let listed = dir.as_dir();
        let mut lister = self
            .operator
            .lister_with(&listed)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        let mut children = Vec::new();
        while let Some(entry) = lister.try_next().await? {
            let raw = entry.path();
            // the collection itself comes back in its own multistatus response
            if raw.is_empty()
                || raw == "/"
                || raw.trim_end_matches('/') == listed.trim_end_matches('/')
            {
                continue;
            }

            let path = RelPath::parse(raw).map_err(|e| {
                warn!("{}: listed entry {:?} under {}: {}", self.name, raw, dir, e);
                StorageError::InvalidPath(e)
            })?;
            children.push(Self::entry_from_metadata(path, entry.metadata()));
        }

        debug!("{}: {} children under {}", self.name, children.len(), dir);
        Ok(children)
    }

    async fn create_dir(&self, path: &RelPath) -> Result<(), StorageError> {
        if let Ok(existing) = self.operator.stat(&path.as_dir()).await {
            return if existing.is_dir() {
                Ok(())
            } else {
                Err(StorageError::Conflict(format!("{}: a file is in the way", path)))
            };
        }
        self.operator.create_dir(&path.as_dir()).await?;
        Ok(())
    }

    async fn delete(&self, path: &RelPath, kind: ResourceKind) -> Result<(), StorageError> {
        let target = match kind {
            ResourceKind::File => Self::object_path(path),
            ResourceKind::Directory => {
                // DELETE on a collection is recursive on the server
                if !self.list_children(path).await?.is_empty() {
                    return Err(StorageError::Conflict(format!("{}: directory not empty", path)));
                }
                path.as_dir()
            }
        };
        self.operator.delete(&target).await?;
        Ok(())
    }

    async fn delete_all(&self, path: &RelPath) -> Result<(), StorageError> {
        let entry = self.stat(path).await?;
        if entry.is_dir() {
            self.operator.remove_all(&path.as_dir()).await?;
        } else {
            self.operator.delete(&Self::object_path(path)).await?;
        }
        Ok(())
    }

    async fn fetch(&self, path: &RelPath) -> Result<ByteStream, StorageError> {
        let object = Self::object_path(path);
        let meta = self.operator.stat(&object).await?;
        if meta.is_dir() {
            return Err(StorageError::Conflict(format!("{}: is a directory", path)));
        }

        let size = meta.content_length();
        let chunk = self.chunk_size as u64;
        let operator = self.operator.clone();

        // ranged reads, one request per chunk
        let stream = futures::stream::try_unfold(0u64, move |offset| {
            let operator = operator.clone();
            let object = object.clone();
            async move {
                if offset >= size {
                    return Ok::<_, StorageError>(None);
                }
                let end = (offset + chunk).min(size);
                let data = operator.read_with(&object).range(offset..end).await?.to_bytes();
                if data.is_empty() {
                    return Err(StorageError::Transport(format!(
                        "{}: unexpected end of content at byte {}",
                        object, offset
                    )));
                }
                let next = offset + data.len() as u64;
                Ok(Some((data, next)))
            }
        });
        Ok(Box::pin(stream))
    }

    async fn store(&self, path: &RelPath, mut data: ByteStream) -> Result<u64, StorageError> {
        let mut writer = self
            .operator
            .writer_with(&Self::object_path(path))
            .chunk(self.chunk_size)
            .await?;

        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e);
                }
            };
            written += chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        }
        writer.close().await?;
        Ok(written)
    }

    fn capabilities(&self) -> Capabilities {
        let cap = self.operator.info().full_capability();
        Capabilities {
            copy: cap.copy,
            rename: cap.rename,
            publish: false,
        }
    }

    async fn copy(&self, from: &RelPath, to: &RelPath) -> Result<(), StorageError> {
        if !self.capabilities().copy {
            return Err(self.unsupported("copy"));
        }
        self.operator
            .copy(&Self::object_path(from), &Self::object_path(to))
            .await?;
        Ok(())
    }

    async fn rename(&self, from: &RelPath, to: &RelPath) -> Result<(), StorageError> {
        if !self.capabilities().rename {
            return Err(self.unsupported("rename"));
        }
        self.operator
            .rename(&Self::object_path(from), &Self::object_path(to))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
