#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use davsync_lib::core::{
    synchronize, Direction, ProgressReporter, RelPath, SyncConfig, SyncError, SyncMode, SyncReport,
    SyncRequest,
};
use davsync_lib::storage::{ByteStream, Entry, ResourceKind, Storage, StorageError};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn rel(s: &str) -> RelPath {
    RelPath::parse(s).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct Faults {
    fail_create: HashSet<RelPath>,
    deny_list: HashSet<RelPath>,
    /// Remaining transport failures per stored path.
    flaky_store: HashMap<RelPath, u32>,
    full_store: HashSet<RelPath>,
    fail_delete: HashSet<RelPath>,
}

/// In-memory tree with injectable failures and a log of mutating calls.
pub struct MemoryStorage {
    name: String,
    chunk_size: usize,
    nodes: Mutex<BTreeMap<RelPath, Node>>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<String>>,
    store_delay: Option<Duration>,
    in_flight: AtomicUsize,
    /// Most stores ever running at once.
    peak: AtomicUsize,
}

impl MemoryStorage {
    pub fn new(name: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(RelPath::root(), Node::Dir);
        Self {
            name: name.to_string(),
            chunk_size: 4096,
            nodes: Mutex::new(nodes),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(Vec::new()),
            store_delay: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn without_root(name: &str) -> Self {
        let storage = Self::new(name);
        storage.nodes.lock().unwrap().clear();
        storage
    }

    pub fn dir(self, path: &str) -> Self {
        self.nodes.lock().unwrap().insert(rel(path), Node::Dir);
        self
    }

    pub fn file(self, path: &str, content: &[u8]) -> Self {
        self.nodes
            .lock()
            .unwrap()
            .insert(rel(path), Node::File(content.to_vec()));
        self
    }

    pub fn fail_create(self, path: &str) -> Self {
        self.faults.lock().unwrap().fail_create.insert(rel(path));
        self
    }

    pub fn deny_list(self, path: &str) -> Self {
        self.faults.lock().unwrap().deny_list.insert(rel(path));
        self
    }

    pub fn flaky_store(self, path: &str, failures: u32) -> Self {
        self.faults
            .lock()
            .unwrap()
            .flaky_store
            .insert(rel(path), failures);
        self
    }

    pub fn full_store(self, path: &str) -> Self {
        self.faults.lock().unwrap().full_store.insert(rel(path));
        self
    }

    pub fn fail_delete(self, path: &str) -> Self {
        self.faults.lock().unwrap().fail_delete.insert(rel(path));
        self
    }

    /// Hold every store open for `delay` before it reads its data.
    pub fn slow_store(mut self, delay: Duration) -> Self {
        self.store_delay = Some(delay);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(&rel(path)).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|p| !p.is_root())
            .map(|p| p.to_string())
            .collect()
    }

    pub fn peak_stores(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn entry(path: &RelPath, node: &Node) -> Entry {
        match node {
            Node::Dir => Entry::directory(path.clone(), None),
            Node::File(data) => Entry::file(path.clone(), data.len() as u64, None),
        }
    }

    fn parent_is_dir(&self, path: &RelPath) -> bool {
        match path.parent() {
            Some(parent) => matches!(self.nodes.lock().unwrap().get(&parent), Some(Node::Dir)),
            None => true,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn stat(&self, path: &RelPath) -> Result<Entry, StorageError> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(path)
            .map(|node| Self::entry(path, node))
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn list_children(&self, dir: &RelPath) -> Result<Vec<Entry>, StorageError> {
        if self.faults.lock().unwrap().deny_list.contains(dir) {
            return Err(StorageError::PermissionDenied(dir.to_string()));
        }
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(dir) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(StorageError::Conflict(dir.to_string())),
            None => return Err(StorageError::NotFound(dir.to_string())),
        }
        Ok(nodes
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(dir))
            .map(|(path, node)| Self::entry(path, node))
            .collect())
    }

    async fn create_dir(&self, path: &RelPath) -> Result<(), StorageError> {
        self.record(format!("mkdir {}", path));
        if self.faults.lock().unwrap().fail_create.contains(path) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        if !self.parent_is_dir(path) {
            return Err(StorageError::Conflict(format!("{}: missing parent", path)));
        }
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(StorageError::Conflict(format!("{}: file in the way", path))),
            None => {
                nodes.insert(path.clone(), Node::Dir);
                Ok(())
            }
        }
    }

    async fn delete(&self, path: &RelPath, _kind: ResourceKind) -> Result<(), StorageError> {
        self.record(format!("delete {}", path));
        if self.faults.lock().unwrap().fail_delete.contains(path) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(path) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if nodes.keys().any(|p| p.is_descendant_of(path)) {
            return Err(StorageError::Conflict(format!("{}: not empty", path)));
        }
        nodes.remove(path);
        Ok(())
    }

    async fn fetch(&self, path: &RelPath) -> Result<ByteStream, StorageError> {
        let data = match self.nodes.lock().unwrap().get(path) {
            Some(Node::File(data)) => data.clone(),
            Some(Node::Dir) => return Err(StorageError::Conflict(path.to_string())),
            None => return Err(StorageError::NotFound(path.to_string())),
        };
        let chunks: Vec<Result<Bytes, StorageError>> = data
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn store(&self, path: &RelPath, data: ByteStream) -> Result<u64, StorageError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.store_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.store_now(path, data).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MemoryStorage {
    async fn store_now(&self, path: &RelPath, mut data: ByteStream) -> Result<u64, StorageError> {
        self.record(format!("store {}", path));
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.full_store.contains(path) {
                return Err(StorageError::QuotaExceeded(path.to_string()));
            }
            if let Some(left) = faults.flaky_store.get_mut(path) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StorageError::Transport("connection reset by peer".into()));
                }
            }
        }
        if !self.parent_is_dir(path) {
            return Err(StorageError::Conflict(format!("{}: missing parent", path)));
        }

        let mut content = Vec::new();
        while let Some(chunk) = data.next().await {
            content.extend_from_slice(&chunk?);
        }
        let written = content.len() as u64;
        self.nodes
            .lock()
            .unwrap()
            .insert(path.clone(), Node::File(content));
        Ok(written)
    }
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..Default::default()
    }
}

pub async fn run(
    direction: Direction,
    mode: SyncMode,
    remote: &Arc<MemoryStorage>,
    local: &Arc<MemoryStorage>,
    config: &SyncConfig,
    reporter: &ProgressReporter,
) -> Result<SyncReport, SyncError> {
    let request = SyncRequest {
        direction,
        remote: remote.clone() as Arc<dyn Storage>,
        local: local.clone() as Arc<dyn Storage>,
        mode,
    };
    synchronize(request, config, reporter, CancellationToken::new()).await
}
