//! Command-line front end. Each submodule handles one group of subcommands.

pub mod resource;
pub mod sync;

use crate::config::{AppConfig, ConnectionConfig};
use crate::core::path::{normalize, RelPath};
use crate::storage::{self, Storage};
use anyhow::{Context as _, Result};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Connection flags; each falls back to its environment variable and then to
/// the `webdav` section of the config file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConnectionArgs {
    /// Server URL, e.g. https://cloud.example.com/remote.php/dav/files/alice
    #[arg(long, global = true, env = "DAVSYNC_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, short = 'u', global = true, env = "DAVSYNC_USERNAME")]
    pub username: Option<String>,

    #[arg(long, global = true, env = "DAVSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Bearer token instead of username and password
    #[arg(long, global = true, env = "DAVSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path prefix on the server that remote paths are relative to
    #[arg(long, global = true, env = "DAVSYNC_ROOT")]
    pub root: Option<String>,
}

impl ConnectionArgs {
    pub fn apply(&self, config: &mut ConnectionConfig) {
        if let Some(ref endpoint) = self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if self.username.is_some() {
            config.username = self.username.clone();
        }
        if self.password.is_some() {
            config.password = self.password.clone();
        }
        if self.token.is_some() {
            config.token = self.token.clone();
        }
        if self.root.is_some() {
            config.root = self.root.clone();
        }
    }
}

/// Everything a command needs: merged configuration and the data directory.
pub struct Context {
    pub config: AppConfig,
    pub data_dir: PathBuf,
}

impl Context {
    pub fn new(mut config: AppConfig, data_dir: PathBuf, connection: &ConnectionArgs) -> Self {
        connection.apply(&mut config.webdav);
        Self { config, data_dir }
    }

    pub fn remote_root(&self) -> &str {
        self.config.webdav.root.as_deref().unwrap_or("")
    }

    /// Parse a path given on the command line. Absolute paths must lie under
    /// the configured root.
    pub fn remote_path(&self, raw: &str) -> Result<RelPath> {
        let (path, _) = normalize(self.remote_root(), raw)
            .with_context(|| format!("invalid remote path {:?}", raw))?;
        Ok(path)
    }

    /// Open the remote tree rooted at `subdir`.
    pub fn connect(&self, subdir: &RelPath) -> Result<Arc<dyn Storage>> {
        self.config.webdav.validate()?;
        storage::create_remote(&self.config.webdav, subdir).context("cannot connect to server")
    }
}

/// Cancel `token` on the first Ctrl-C; exit with 130 on the second.
pub fn spawn_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("cannot listen for Ctrl-C");
            return;
        }

        let is_tty = std::io::stderr().is_terminal();
        if is_tty {
            eprintln!("\nCancelling, waiting for transfers to stop...");
            eprintln!("Press Ctrl-C again to force quit.");
        } else {
            tracing::warn!("cancellation requested");
        }
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            if is_tty {
                eprintln!("Force quit!");
            }
            std::process::exit(130);
        }
    });
}
