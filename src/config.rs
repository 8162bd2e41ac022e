//! Application configuration, stored as `config.json` in the data directory.

use crate::core::comparator::CompareConfig;
use crate::core::engine::SyncConfig;
use crate::core::scanner::{PartialListingPolicy, ScanConfig};
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

/// Default data directory: `<config dir>/davsync`.
pub fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("davsync"))
        .unwrap_or_else(|| PathBuf::from(".davsync"))
}

/// Remote server connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Bearer token, used instead of basic auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Path prefix on the server that every remote path is relative to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            anyhow::bail!("no WebDAV endpoint configured");
        }
        if self.password.is_some() && self.username.is_none() {
            anyhow::bail!("a password requires a username");
        }
        if self.username.is_none() && self.token.is_none() {
            anyhow::bail!("either a username or a token is required");
        }
        Ok(())
    }
}

/// Sync defaults; every value can be overridden per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Bytes per second while pulling, 0 for unlimited.
    #[serde(default)]
    pub download_limit: u64,
    /// Bytes per second while pushing, 0 for unlimited.
    #[serde(default)]
    pub upload_limit: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub partial_listing: PartialListingPolicy,
    #[serde(default = "default_true")]
    pub auto_create_dir: bool,
    #[serde(default = "default_true")]
    pub compare_mtime: bool,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            download_limit: 0,
            upload_limit: 0,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_delay_ms(),
            exclude_patterns: Vec::new(),
            partial_listing: PartialListingPolicy::default(),
            auto_create_dir: true,
            compare_mtime: true,
        }
    }
}

impl SyncSettings {
    pub fn to_sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            max_concurrent_transfers: self.concurrency.max(1),
            download_limit: (self.download_limit > 0).then_some(self.download_limit),
            upload_limit: (self.upload_limit > 0).then_some(self.upload_limit),
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            scan_config: ScanConfig {
                exclude_patterns: self.exclude_patterns.clone(),
                partial_listing: self.partial_listing,
                ..defaults.scan_config
            },
            compare_config: CompareConfig {
                compare_mtime: self.compare_mtime,
                ..defaults.compare_config
            },
            auto_create_dir: self.auto_create_dir,
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub webdav: ConnectionConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load `config.json` from `data_dir`. A missing file yields defaults,
    /// a malformed one is an error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        Self::load_file(&data_dir.join(CONFIG_FILE))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(data_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }
}
