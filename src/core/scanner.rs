use crate::core::error::SyncError;
use crate::core::path::RelPath;
use crate::storage::{Entry, Storage, StorageError};
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with subtrees that could not be listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialListingPolicy {
    /// Fail the sync, naming every unreachable subtree.
    #[default]
    Fail,
    /// Leave unreachable subtrees alone and sync the rest.
    Skip,
}

/// Tree walk configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Glob patterns. A pattern without `/` matches the file name, otherwise
    /// the whole relative path. Excluded directories are not descended.
    pub exclude_patterns: Vec<String>,
    pub partial_listing: PartialListingPolicy,
    /// Retries of a listing that failed with a transport error.
    pub list_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            partial_listing: PartialListingPolicy::Fail,
            list_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    Entry(Entry),
    /// A directory whose children could not be listed.
    Unreachable { path: RelPath, reason: String },
    /// A listed entry dropped by an exclude pattern.
    Excluded(RelPath),
}

/// A fully materialized walk of one side.
#[derive(Debug, Clone, Default)]
pub struct TreeListing {
    pub root_exists: bool,
    pub entries: BTreeMap<RelPath, Entry>,
    /// Roots of subtrees that were not listed. Only populated under
    /// [`PartialListingPolicy::Skip`].
    pub unreachable: Vec<RelPath>,
    /// Entries that exist but were dropped by an exclude pattern.
    pub excluded: Vec<RelPath>,
}

impl TreeListing {
    /// A listing of a side whose root does not exist yet.
    pub fn missing() -> Self {
        Self::default()
    }

    /// True when `path` is at or below an unreachable subtree.
    pub fn is_unreachable(&self, path: &RelPath) -> bool {
        self.unreachable.iter().any(|u| path.is_within(u))
    }

    /// Directories holding something this listing did not see: an
    /// unreachable subtree or an excluded entry below them.
    pub fn hidden_content_dirs(&self) -> BTreeSet<RelPath> {
        let mut dirs = BTreeSet::new();
        for hidden in self.unreachable.iter().chain(self.excluded.iter()) {
            let mut current = hidden.parent();
            while let Some(dir) = current {
                if dir.is_root() || !dirs.insert(dir.clone()) {
                    break;
                }
                current = dir.parent();
            }
        }
        dirs
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_dir()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_dir()).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// Compile a glob into an anchored regex. `**` crosses separators, `*` and
/// `?` do not.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else if chars.peek().is_none() && out.ends_with('/') {
                    // "dir/**" also matches "dir" itself
                    out.pop();
                    out.push_str("(?:/.*)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Regex::new(&out)
}

#[derive(Debug, Clone)]
struct Exclude {
    regex: Regex,
    name_only: bool,
}

/// Walks a [`Storage`] tree.
#[derive(Debug, Clone)]
pub struct FileScanner {
    config: ScanConfig,
    excludes: Vec<Exclude>,
    cancel: CancellationToken,
}

impl FileScanner {
    pub fn new(config: ScanConfig) -> Result<Self, SyncError> {
        let excludes = config
            .exclude_patterns
            .iter()
            .map(|pattern| {
                let regex = glob_to_regex(pattern).map_err(|source| SyncError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
                Ok(Exclude {
                    regex,
                    name_only: !pattern.contains('/'),
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(Self {
            config,
            excludes,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn should_exclude(&self, path: &RelPath) -> bool {
        self.excludes.iter().any(|ex| {
            if ex.name_only {
                ex.regex.is_match(path.file_name())
            } else {
                ex.regex.is_match(path.as_str())
            }
        })
    }

    /// Lazy depth-first walk below the root of `storage`.
    ///
    /// A directory is listed only when the stream is polled past its entry.
    /// Directories that cannot be listed come out as
    /// [`WalkEvent::Unreachable`] and the walk carries on with their
    /// siblings; failing to list the root itself ends the stream with an
    /// error. The root is expected to exist (see [`Self::scan_storage`]).
    pub fn walk(&self, storage: Arc<dyn Storage>) -> BoxStream<'static, Result<WalkEvent, SyncError>> {
        let state = WalkState {
            scanner: self.clone(),
            storage,
            stack: vec![Frame::Pending(RelPath::root())],
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            let item = state.next_event().await?;
            Some((item, state))
        })
        .boxed()
    }

    /// Stat the root, walk the tree and apply the partial-listing policy.
    pub async fn scan_storage(&self, storage: Arc<dyn Storage>) -> Result<TreeListing, SyncError> {
        info!("scanning {}", storage.name());

        let root_path = RelPath::root();
        let root = match self.with_retry(|| storage.stat(&root_path)).await {
            Ok(root) => root,
            Err(e) if e.is_not_found() => {
                info!("{}: root does not exist", storage.name());
                return Ok(TreeListing::missing());
            }
            Err(e) => return Err(e.into()),
        };
        if !root.is_dir() {
            return Err(SyncError::RootNotDirectory {
                storage: storage.name().to_string(),
            });
        }

        let listing = collect_tree(self.walk(storage.clone()), self.config.partial_listing).await?;
        info!(
            "{}: {} files, {} directories, {} bytes, {} unreachable",
            storage.name(),
            listing.file_count(),
            listing.dir_count(),
            listing.total_bytes(),
            listing.unreachable.len()
        );
        Ok(listing)
    }

    /// Run `op`, retrying transport errors with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.config.list_retries => {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "listing failed, retrying in {:?} ({}/{}): {}",
                        delay, attempt, self.config.list_retries, e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

enum Frame {
    /// A directory whose children have not been requested yet.
    Pending(RelPath),
    Listed(std::vec::IntoIter<Entry>),
}

struct WalkState {
    scanner: FileScanner,
    storage: Arc<dyn Storage>,
    stack: Vec<Frame>,
    finished: bool,
}

impl WalkState {
    async fn next_event(&mut self) -> Option<Result<WalkEvent, SyncError>> {
        if self.finished {
            return None;
        }

        loop {
            if self.scanner.cancel.is_cancelled() {
                return self.fail(SyncError::Cancelled);
            }

            match self.stack.pop()? {
                Frame::Pending(dir) => {
                    let listed = self
                        .scanner
                        .with_retry(|| self.storage.list_children(&dir))
                        .await;
                    match listed {
                        Ok(mut children) => {
                            if let Some(bad) =
                                children.iter().find(|c| c.path.parent().as_ref() != Some(&dir))
                            {
                                let err = SyncError::WalkConsistency {
                                    path: bad.path.clone(),
                                    reason: format!("returned when listing {}", dir),
                                };
                                return self.fail(err);
                            }
                            children.sort_by(|a, b| a.path.cmp(&b.path));
                            debug!("{}: listed {} ({} children)", self.storage.name(), dir, children.len());
                            self.stack.push(Frame::Listed(children.into_iter()));
                        }
                        Err(StorageError::Cancelled) => return self.fail(SyncError::Cancelled),
                        Err(StorageError::InvalidPath(e)) => return self.fail(SyncError::Path(e)),
                        Err(e) if dir.is_root() => return self.fail(e.into()),
                        Err(e) => {
                            warn!("{}: cannot list {}: {}", self.storage.name(), dir, e);
                            return Some(Ok(WalkEvent::Unreachable {
                                path: dir,
                                reason: e.to_string(),
                            }));
                        }
                    }
                }
                Frame::Listed(mut children) => {
                    let Some(entry) = children.next() else {
                        continue;
                    };
                    self.stack.push(Frame::Listed(children));

                    if self.scanner.should_exclude(&entry.path) {
                        debug!("excluded {}", entry.path);
                        return Some(Ok(WalkEvent::Excluded(entry.path)));
                    }
                    if entry.is_dir() {
                        self.stack.push(Frame::Pending(entry.path.clone()));
                    }
                    return Some(Ok(WalkEvent::Entry(entry)));
                }
            }
        }
    }

    fn fail(&mut self, err: SyncError) -> Option<Result<WalkEvent, SyncError>> {
        self.finished = true;
        self.stack.clear();
        Some(Err(err))
    }
}

/// Materialize a walk.
///
/// A path seen twice is a [`SyncError::WalkConsistency`]. Unreachable
/// subtrees fail the whole listing under [`PartialListingPolicy::Fail`],
/// after the walk has finished so that every one of them is named.
pub async fn collect_tree<S>(mut events: S, policy: PartialListingPolicy) -> Result<TreeListing, SyncError>
where
    S: futures::Stream<Item = Result<WalkEvent, SyncError>> + Unpin,
{
    let mut listing = TreeListing {
        root_exists: true,
        ..Default::default()
    };

    while let Some(event) = events.next().await {
        match event? {
            WalkEvent::Entry(entry) => {
                if listing.entries.contains_key(&entry.path) {
                    return Err(SyncError::WalkConsistency {
                        path: entry.path,
                        reason: "listed twice".to_string(),
                    });
                }
                listing.entries.insert(entry.path.clone(), entry);
            }
            WalkEvent::Unreachable { path, .. } => listing.unreachable.push(path),
            WalkEvent::Excluded(path) => listing.excluded.push(path),
        }
    }

    if policy == PartialListingPolicy::Fail && !listing.unreachable.is_empty() {
        return Err(SyncError::PartialListing {
            paths: listing.unreachable,
        });
    }
    Ok(listing)
}
