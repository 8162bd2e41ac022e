//! Single-resource commands: ls, info, mkdir, rm, cp, mv, get, put, free,
//! publish, unpublish.

use super::Context;
use crate::core::path::RelPath;
use crate::storage::{ByteStream, Entry, LocalStorage, ResourceKind, Storage};
use anyhow::{bail, Context as _, Result};
use futures::TryStreamExt;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

#[derive(Debug, clap::Subcommand)]
pub enum ResourceCommand {
    /// List a remote directory
    Ls {
        #[arg(default_value = "")]
        path: String,
        /// Show kind, size and modification time
        #[arg(short, long)]
        long: bool,
    },
    /// Show metadata of a remote resource as JSON
    Info { path: String },
    /// Create a remote directory
    Mkdir {
        path: String,
        /// Create missing parents too
        #[arg(short, long)]
        parents: bool,
    },
    /// Remove a remote file or empty directory
    Rm {
        path: String,
        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },
    /// Copy a resource on the server
    Cp { from: String, to: String },
    /// Move a resource on the server
    Mv { from: String, to: String },
    /// Download a single file
    Get {
        remote: String,
        /// Local file or directory (defaults to the current directory)
        local: Option<PathBuf>,
    },
    /// Upload a single file
    Put {
        local: PathBuf,
        /// Remote file or directory (defaults to the remote root)
        remote: Option<String>,
    },
    /// Show the available quota
    Free,
    /// Publish a resource and print its public link
    Publish { path: String },
    /// Revoke the public link of a resource
    Unpublish { path: String },
}

pub async fn run(ctx: &Context, command: ResourceCommand) -> Result<()> {
    let remote = ctx.connect(&RelPath::root())?;
    let remote = remote.as_ref();

    match command {
        ResourceCommand::Ls { path, long } => ls(remote, &ctx.remote_path(&path)?, long).await,
        ResourceCommand::Info { path } => {
            let entry = remote.stat(&ctx.remote_path(&path)?).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        ResourceCommand::Mkdir { path, parents } => {
            mkdir(remote, &ctx.remote_path(&path)?, parents).await
        }
        ResourceCommand::Rm { path, recursive } => rm(remote, &ctx.remote_path(&path)?, recursive).await,
        ResourceCommand::Cp { from, to } => {
            remote.copy(&ctx.remote_path(&from)?, &ctx.remote_path(&to)?).await?;
            Ok(())
        }
        ResourceCommand::Mv { from, to } => {
            remote
                .rename(&ctx.remote_path(&from)?, &ctx.remote_path(&to)?)
                .await?;
            Ok(())
        }
        ResourceCommand::Get { remote: path, local } => {
            get(remote, &ctx.remote_path(&path)?, local).await
        }
        ResourceCommand::Put { local, remote: path } => {
            let (target, is_dir) = match path {
                Some(raw) => {
                    let (path, hint) = crate::core::path::normalize(ctx.remote_root(), &raw)?;
                    (path, hint)
                }
                None => (RelPath::root(), true),
            };
            put(remote, &local, target, is_dir).await
        }
        ResourceCommand::Free => {
            match remote.free_space().await? {
                Some(bytes) => println!("{} available", HumanBytes(bytes)),
                None => println!("quota not reported by {}", remote.name()),
            }
            Ok(())
        }
        ResourceCommand::Publish { path } => {
            let link = remote.publish(&ctx.remote_path(&path)?).await?;
            println!("{}", link);
            Ok(())
        }
        ResourceCommand::Unpublish { path } => {
            remote.unpublish(&ctx.remote_path(&path)?).await?;
            Ok(())
        }
    }
}

async fn ls(remote: &dyn Storage, dir: &RelPath, long: bool) -> Result<()> {
    let mut children = remote.list_children(dir).await?;
    children.sort_by(|a, b| a.path.cmp(&b.path));
    for child in &children {
        println!("{}", format_entry(child, long));
    }
    Ok(())
}

fn format_entry(entry: &Entry, long: bool) -> String {
    let name = if entry.is_dir() {
        format!("{}/", entry.path.file_name())
    } else {
        entry.path.file_name().to_string()
    };
    if !long {
        return name;
    }
    let modified = entry
        .modified
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16));
    let kind = if entry.is_dir() { 'd' } else { '-' };
    format!("{} {:>12} {} {}", kind, entry.size, modified, name)
}

async fn mkdir(remote: &dyn Storage, path: &RelPath, parents: bool) -> Result<()> {
    if !parents {
        remote.create_dir(path).await?;
        return Ok(());
    }
    let mut ancestors = Vec::new();
    let mut current = Some(path.clone());
    while let Some(p) = current {
        if p.is_root() {
            break;
        }
        current = p.parent();
        ancestors.push(p);
    }
    for dir in ancestors.iter().rev() {
        remote.create_dir(dir).await?;
    }
    Ok(())
}

async fn rm(remote: &dyn Storage, path: &RelPath, recursive: bool) -> Result<()> {
    if path.is_root() {
        bail!("refusing to remove the remote root");
    }
    let entry = remote.stat(path).await?;
    match (entry.kind, recursive) {
        (ResourceKind::File, _) => remote.delete(path, ResourceKind::File).await?,
        (ResourceKind::Directory, true) => remote.delete_all(path).await?,
        (ResourceKind::Directory, false) => remote.delete(path, ResourceKind::Directory).await?,
    }
    Ok(())
}

fn byte_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} {msg}",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

fn with_progress(data: ByteStream, bar: ProgressBar) -> ByteStream {
    Box::pin(data.inspect_ok(move |chunk| bar.inc(chunk.len() as u64)))
}

/// Split a local file path into a storage over its directory and the file
/// name relative to it.
fn local_parts(path: &Path) -> Result<(LocalStorage, RelPath)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((LocalStorage::new(parent), RelPath::root().child(name)?))
}

async fn get(remote: &dyn Storage, path: &RelPath, local: Option<PathBuf>) -> Result<()> {
    let entry = remote.stat(path).await?;
    if entry.is_dir() {
        bail!("{} is a directory; use `pull` to download trees", path);
    }

    let mut target = local.unwrap_or_else(|| PathBuf::from("."));
    if target.is_dir() {
        target.push(path.file_name());
    }
    let (storage, name) = local_parts(&target)?;

    let bar = byte_bar(entry.size);
    bar.set_message(path.to_string());
    let data = with_progress(remote.fetch(path).await?, bar.clone());
    let written = storage.store(&name, data).await?;
    bar.finish_and_clear();

    println!("{} -> {} ({})", path, target.display(), HumanBytes(written));
    Ok(())
}

async fn put(remote: &dyn Storage, local: &Path, target: RelPath, is_dir_hint: bool) -> Result<()> {
    let (storage, name) = local_parts(local)?;
    let entry = storage
        .stat(&name)
        .await
        .with_context(|| format!("cannot read {}", local.display()))?;
    if entry.is_dir() {
        bail!("{} is a directory; use `push` to upload trees", local.display());
    }

    let into_dir = is_dir_hint
        || target.is_root()
        || matches!(remote.stat(&target).await, Ok(e) if e.is_dir());
    let target = if into_dir {
        target.child(name.file_name())?
    } else {
        target
    };

    let bar = byte_bar(entry.size);
    bar.set_message(target.to_string());
    let data = with_progress(storage.fetch(&name).await?, bar.clone());
    let written = remote.store(&target, data).await?;
    bar.finish_and_clear();

    println!("{} -> {} ({})", local.display(), target, HumanBytes(written));
    Ok(())
}
