//! Relative path model shared by both sides of a sync.
//!
//! Every path the engine handles is a [`RelPath`]: POSIX separators, no
//! leading or trailing `/`, no empty, `.` or `..` segments. The empty path is
//! the root of the tree being synchronized.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path escapes its root: {0}")]
    EscapesRoot(String),

    #[error("path {path} is outside root {root}")]
    OutsideRoot { path: String, root: String },

    #[error("invalid path segment {segment:?} in {path}")]
    InvalidSegment { path: String, segment: String },
}

/// A normalized path relative to a sync root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse a path that is already relative to the root.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        normalize("", path).map(|(rel, _)| rel)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches(SEPARATOR).count() + 1
        }
    }

    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind(SEPARATOR) {
            Some(idx) => RelPath(self.0[..idx].to_string()),
            None => RelPath::root(),
        })
    }

    pub fn file_name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Append a single segment, as returned by a directory listing.
    pub fn child(&self, name: &str) -> Result<RelPath, PathError> {
        let name = name.trim_end_matches(SEPARATOR);
        if name.is_empty() || name == "." || name == ".." || name.contains(SEPARATOR) {
            return Err(PathError::InvalidSegment {
                path: self.0.clone(),
                segment: name.to_string(),
            });
        }
        if self.is_root() {
            Ok(RelPath(name.to_string()))
        } else {
            Ok(RelPath(format!("{}{}{}", self.0, SEPARATOR, name)))
        }
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &RelPath) -> bool {
        if self == ancestor {
            return false;
        }
        if ancestor.is_root() {
            return true;
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == SEPARATOR as u8
    }

    /// `self` is `other` or below it.
    pub fn is_within(&self, other: &RelPath) -> bool {
        self == other || self.is_descendant_of(other)
    }

    /// Directory form used by backends that mark collections with a trailing
    /// separator. The root becomes `/`.
    pub fn as_dir(&self) -> String {
        if self.is_root() {
            SEPARATOR.to_string()
        } else {
            format!("{}{}", self.0, SEPARATOR)
        }
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty() && *s != ".")
}

/// Normalize `path` against `root`.
///
/// Backslashes become `/`, duplicate separators collapse and `.` segments
/// are dropped. An absolute `path` must lie under `root` and has it stripped;
/// a relative `path` is taken as relative to `root` already. The returned
/// flag is the directory hint carried by a trailing separator.
///
/// A `..` segment anywhere is rejected rather than resolved.
pub fn normalize(root: &str, path: &str) -> Result<(RelPath, bool), PathError> {
    let path = path.replace('\\', "/");
    let root = root.replace('\\', "/");
    let dir_hint = path.ends_with(SEPARATOR);

    let root_segments: Vec<&str> = segments(&root).collect();
    if let Some(bad) = root_segments.iter().find(|s| **s == "..") {
        return Err(PathError::InvalidSegment {
            path: root.clone(),
            segment: bad.to_string(),
        });
    }

    let path_segments: Vec<&str> = segments(&path).collect();
    if path_segments.iter().any(|s| *s == "..") {
        return Err(PathError::EscapesRoot(path.clone()));
    }

    let relative = if path.starts_with(SEPARATOR) {
        if path_segments.len() < root_segments.len()
            || path_segments[..root_segments.len()] != root_segments[..]
        {
            return Err(PathError::OutsideRoot {
                path: path.clone(),
                root: root.clone(),
            });
        }
        &path_segments[root_segments.len()..]
    } else {
        &path_segments[..]
    };

    Ok((RelPath(relative.join("/")), dir_hint))
}

/// Inverse of [`normalize`]: the absolute form of `rel` under `root`.
pub fn join(root: &str, rel: &RelPath) -> String {
    let root = root.trim_end_matches(SEPARATOR);
    match (root.is_empty(), rel.is_root()) {
        (true, true) => SEPARATOR.to_string(),
        (true, false) => format!("{}{}", SEPARATOR, rel.as_str()),
        (false, true) => root.to_string(),
        (false, false) => format!("{}{}{}", root, SEPARATOR, rel.as_str()),
    }
}
