use crate::core::path::RelPath;
use crate::core::progress::ActionKind;
use crate::core::scanner::TreeListing;
use crate::storage::{Entry, ResourceKind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// How the destination is reconciled with the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Add what is missing; never overwrite or delete.
    #[default]
    Additive,
    /// Overwrite plus deletion of destination extras.
    Mirror,
    /// Add what is missing and replace files that differ.
    Overwrite,
}

impl SyncMode {
    fn replaces_files(self) -> bool {
        matches!(self, SyncMode::Overwrite | SyncMode::Mirror)
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "additive" | "add" => Ok(SyncMode::Additive),
            "mirror" => Ok(SyncMode::Mirror),
            "overwrite" => Ok(SyncMode::Overwrite),
            other => Err(format!("unknown sync mode: {}", other)),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Additive => write!(f, "additive"),
            SyncMode::Mirror => write!(f, "mirror"),
            SyncMode::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// One planned reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateDirectory(RelPath),
    Transfer {
        path: RelPath,
        /// Source size, for byte accounting.
        size: u64,
        source_is_remote: bool,
    },
    Delete {
        path: RelPath,
        kind: ResourceKind,
    },
}

impl Action {
    pub fn path(&self) -> &RelPath {
        match self {
            Action::CreateDirectory(path) => path,
            Action::Transfer { path, .. } => path,
            Action::Delete { path, .. } => path,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::CreateDirectory(_) => ActionKind::CreateDirectory,
            Action::Transfer { .. } => ActionKind::Transfer,
            Action::Delete { .. } => ActionKind::Delete,
        }
    }
}

/// Ordered actions: creates by ascending depth, then transfers, then
/// deletes by descending depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Paths that are a file on one side and a directory on the other.
    /// Nothing at or below them is planned.
    pub conflicts: Vec<RelPath>,
    /// Destination-only directories kept by Mirror because they hold
    /// something the listing did not see.
    pub retained: Vec<RelPath>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn summary(&self) -> ActionSummary {
        let mut summary = ActionSummary {
            conflict_count: self.conflicts.len(),
            ..Default::default()
        };
        for action in &self.actions {
            match action {
                Action::CreateDirectory(_) => summary.create_count += 1,
                Action::Transfer { size, .. } => {
                    summary.transfer_count += 1;
                    summary.transfer_bytes += size;
                }
                Action::Delete { .. } => summary.delete_count += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSummary {
    pub create_count: usize,
    pub transfer_count: usize,
    pub transfer_bytes: u64,
    pub delete_count: usize,
    pub conflict_count: usize,
}

impl ActionSummary {
    pub fn total_actions(&self) -> usize {
        self.create_count + self.transfer_count + self.delete_count
    }
}

/// Result of comparing two files with the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    Equal,
    /// Same size, source modified later than the destination.
    SourceNewer,
    /// Same size, destination modified later than the source.
    DestNewer,
    /// Sizes differ.
    Different,
}

#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// Timestamps closer than this are considered equal.
    pub time_tolerance_seconds: i64,
    /// Use modification times when sizes match. Size is always compared.
    pub compare_mtime: bool,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance_seconds: 2,
            compare_mtime: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn new(config: CompareConfig) -> Self {
        Self { config }
    }

    pub fn compare_files(&self, source: &Entry, dest: &Entry) -> FileRelation {
        if source.size != dest.size {
            debug!(
                "size differs: {} (src={}, dst={})",
                source.path, source.size, dest.size
            );
            return FileRelation::Different;
        }

        if !self.config.compare_mtime {
            return FileRelation::Equal;
        }
        let (Some(src_time), Some(dst_time)) = (source.modified, dest.modified) else {
            return FileRelation::Equal;
        };

        let diff = (src_time - dst_time).num_seconds();
        if diff.abs() <= self.config.time_tolerance_seconds {
            FileRelation::Equal
        } else if diff > 0 {
            FileRelation::SourceNewer
        } else {
            FileRelation::DestNewer
        }
    }

    /// Merge-join two listings into a [`Plan`].
    ///
    /// Paths at or below an unreachable subtree of either side, or below a
    /// kind conflict, get no action.
    pub fn diff(
        &self,
        source: &TreeListing,
        dest: &TreeListing,
        mode: SyncMode,
        source_is_remote: bool,
    ) -> Plan {
        let conflicts: BTreeSet<RelPath> = source
            .entries
            .iter()
            .filter_map(|(path, src)| match dest.entries.get(path) {
                Some(dst) if dst.kind != src.kind => Some(path.clone()),
                _ => None,
            })
            .collect();
        for path in &conflicts {
            warn!("{}: file on one side, directory on the other; leaving it alone", path);
        }

        let blocked = |path: &RelPath| {
            source.is_unreachable(path)
                || dest.is_unreachable(path)
                || has_ancestor_in(path, &conflicts)
        };

        let hidden = if mode == SyncMode::Mirror {
            dest.hidden_content_dirs()
        } else {
            BTreeSet::new()
        };

        let mut creates = Vec::new();
        let mut transfers = Vec::new();
        let mut deletes = Vec::new();
        let mut retained = Vec::new();

        for (path, src, dst) in merge_join(&source.entries, &dest.entries) {
            if blocked(path) {
                continue;
            }
            match (src, dst) {
                (Some(src), None) => {
                    if src.is_dir() {
                        creates.push(Action::CreateDirectory(path.clone()));
                    } else {
                        transfers.push(Action::Transfer {
                            path: path.clone(),
                            size: src.size,
                            source_is_remote,
                        });
                    }
                }
                (Some(src), Some(dst)) => {
                    if src.is_dir() || dst.is_dir() || !mode.replaces_files() {
                        continue;
                    }
                    match self.compare_files(src, dst) {
                        FileRelation::Different | FileRelation::SourceNewer => {
                            transfers.push(Action::Transfer {
                                path: path.clone(),
                                size: src.size,
                                source_is_remote,
                            })
                        }
                        FileRelation::Equal | FileRelation::DestNewer => {}
                    }
                }
                (None, Some(dst)) => {
                    if mode != SyncMode::Mirror {
                        continue;
                    }
                    if dst.is_dir() && hidden.contains(path) {
                        info!("{}: keeping directory with unlisted content", path);
                        retained.push(path.clone());
                    } else {
                        deletes.push(Action::Delete {
                            path: path.clone(),
                            kind: dst.kind,
                        });
                    }
                }
                (None, None) => {}
            }
        }

        creates.sort_by(|a, b| by_depth(a.path(), b.path()));
        transfers.sort_by(|a, b| a.path().cmp(b.path()));
        deletes.sort_by(|a, b| {
            b.path()
                .depth()
                .cmp(&a.path().depth())
                .then_with(|| a.path().cmp(b.path()))
        });

        let mut actions = creates;
        actions.extend(transfers);
        actions.extend(deletes);

        Plan {
            actions,
            conflicts: conflicts.into_iter().collect(),
            retained,
        }
    }
}

fn by_depth(a: &RelPath, b: &RelPath) -> Ordering {
    a.depth().cmp(&b.depth()).then_with(|| a.cmp(b))
}

/// `path` or one of its ancestors is in `set`.
fn has_ancestor_in(path: &RelPath, set: &BTreeSet<RelPath>) -> bool {
    if set.is_empty() {
        return false;
    }
    let mut current = Some(path.clone());
    while let Some(p) = current {
        if set.contains(&p) {
            return true;
        }
        current = p.parent();
    }
    false
}

type Joined<'a> = (&'a RelPath, Option<&'a Entry>, Option<&'a Entry>);

/// Walk two sorted maps in lockstep.
fn merge_join<'a>(
    left: &'a BTreeMap<RelPath, Entry>,
    right: &'a BTreeMap<RelPath, Entry>,
) -> impl Iterator<Item = Joined<'a>> {
    let mut left = left.iter().peekable();
    let mut right = right.iter().peekable();

    std::iter::from_fn(move || match (left.peek(), right.peek()) {
        (Some((lp, _)), Some((rp, _))) => match lp.cmp(rp) {
            Ordering::Less => left.next().map(|(p, e)| (p, Some(e), None)),
            Ordering::Greater => right.next().map(|(p, e)| (p, None, Some(e))),
            Ordering::Equal => {
                let (p, l) = left.next()?;
                let (_, r) = right.next()?;
                Some((p, Some(l), Some(r)))
            }
        },
        (Some(_), None) => left.next().map(|(p, e)| (p, Some(e), None)),
        (None, Some(_)) => right.next().map(|(p, e)| (p, None, Some(e))),
        (None, None) => None,
    })
}
