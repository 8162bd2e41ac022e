use crate::core::comparator::{CompareConfig, FileComparator, Plan, SyncMode};
use crate::core::error::SyncError;
use crate::core::path::RelPath;
use crate::core::progress::ProgressReporter;
use crate::core::scanner::{FileScanner, ScanConfig, TreeListing};
use crate::core::transfer::{ExecutionSummary, ExecutorConfig, FailedItem, TransferExecutor};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Pull => write!(f, "pull"),
            Direction::Push => write!(f, "push"),
        }
    }
}

/// One sync invocation.
#[derive(Clone)]
pub struct SyncRequest {
    pub direction: Direction,
    pub remote: Arc<dyn Storage>,
    pub local: Arc<dyn Storage>,
    pub mode: SyncMode,
}

impl SyncRequest {
    pub fn source(&self) -> &Arc<dyn Storage> {
        match self.direction {
            Direction::Pull => &self.remote,
            Direction::Push => &self.local,
        }
    }

    pub fn dest(&self) -> &Arc<dyn Storage> {
        match self.direction {
            Direction::Pull => &self.local,
            Direction::Push => &self.remote,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_concurrent_transfers: usize,
    /// Bytes per second while pulling.
    pub download_limit: Option<u64>,
    /// Bytes per second while pushing.
    pub upload_limit: Option<u64>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub scan_config: ScanConfig,
    pub compare_config: CompareConfig,
    /// Create the destination root when it does not exist.
    pub auto_create_dir: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            download_limit: None,
            upload_limit: None,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            scan_config: ScanConfig::default(),
            compare_config: CompareConfig::default(),
            auto_create_dir: true,
        }
    }
}

impl SyncConfig {
    pub fn rate_limit(&self, direction: Direction) -> Option<u64> {
        match direction {
            Direction::Pull => self.download_limit,
            Direction::Push => self.upload_limit,
        }
        .filter(|limit| *limit > 0)
    }

    pub fn executor_config(&self, direction: Direction) -> ExecutorConfig {
        ExecutorConfig {
            concurrency: self.max_concurrent_transfers.max(1),
            rate_limit: self.rate_limit(direction),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            list_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..self.scan_config.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Completed,
    CompletedWithFailures,
    Cancelled,
}

/// Outcome of a sync that got past its fatal checks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub direction: Direction,
    pub mode: SyncMode,
    pub status: SyncStatus,
    pub created: usize,
    pub transferred: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_transferred: u64,
    pub failures: Vec<FailedItem>,
    /// Paths that are a file on one side and a directory on the other.
    pub conflicts: Vec<RelPath>,
    /// Subtrees that were not listed and therefore not synchronized.
    pub unreachable: Vec<RelPath>,
    /// Destination-only directories Mirror left in place.
    pub retained: Vec<RelPath>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(
        request: &SyncRequest,
        summary: ExecutionSummary,
        planned: SyncPlan,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> Self {
        let status = if summary.cancelled {
            SyncStatus::Cancelled
        } else if summary.failed > 0 {
            SyncStatus::CompletedWithFailures
        } else {
            SyncStatus::Completed
        };

        Self {
            direction: request.direction,
            mode: request.mode,
            status,
            created: summary.created,
            transferred: summary.transferred,
            deleted: summary.deleted,
            skipped: summary.skipped,
            failed: summary.failed,
            bytes_transferred: summary.bytes_transferred,
            failures: summary.failures,
            conflicts: planned.plan.conflicts,
            unreachable: planned.unreachable,
            retained: planned.plan.retained,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn cancelled(request: &SyncRequest, started_at: DateTime<Utc>, started: Instant) -> Self {
        let summary = ExecutionSummary {
            cancelled: true,
            ..Default::default()
        };
        Self::new(request, summary, SyncPlan::default(), started_at, started)
    }
}

/// What a sync would do, computed without changing either side.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub plan: Plan,
    /// False when the destination root has to be created first.
    pub dest_root_exists: bool,
    pub unreachable: Vec<RelPath>,
}

/// Walk both sides and diff them.
///
/// Used by dry runs and by [`synchronize`], so both see the same listing
/// settings. Cancellation while scanning is `Err(SyncError::Cancelled)`.
pub async fn plan(
    request: &SyncRequest,
    config: &SyncConfig,
    cancel: CancellationToken,
) -> Result<SyncPlan, SyncError> {
    let source = request.source();
    let dest = request.dest();

    let scanner = FileScanner::new(config.scan_config())?.with_cancel(cancel);
    let (source_tree, dest_tree) = tokio::try_join!(
        scanner.scan_storage(source.clone()),
        scanner.scan_storage(dest.clone())
    )?;

    if !source_tree.root_exists {
        return Err(SyncError::SourceRootMissing {
            storage: source.name().to_string(),
        });
    }
    if !dest_tree.root_exists && !config.auto_create_dir {
        return Err(SyncError::DestinationRootMissing {
            storage: dest.name().to_string(),
        });
    }

    let plan = FileComparator::new(config.compare_config.clone()).diff(
        &source_tree,
        &dest_tree,
        request.mode,
        request.direction == Direction::Pull,
    );
    for path in &plan.conflicts {
        warn!("not synchronizing {}: kinds differ", path);
    }

    Ok(SyncPlan {
        plan,
        dest_root_exists: dest_tree.root_exists,
        unreachable: unreachable_paths(&source_tree, &dest_tree),
    })
}

/// Walk both sides, diff them and execute the plan.
///
/// `Err` is returned only for problems found before anything was changed;
/// per-item failures and cancellation are reported in the [`SyncReport`].
pub async fn synchronize(
    request: SyncRequest,
    config: &SyncConfig,
    reporter: &ProgressReporter,
    cancel: CancellationToken,
) -> Result<SyncReport, SyncError> {
    let started_at = Utc::now();
    let started = Instant::now();
    let source = request.source().clone();
    let dest = request.dest().clone();

    info!(
        "{} ({}): {} -> {}",
        request.direction,
        request.mode,
        source.name(),
        dest.name()
    );

    let planned = match plan(&request, config, cancel.clone()).await {
        Ok(planned) => planned,
        Err(SyncError::Cancelled) => {
            info!("cancelled while scanning");
            return Ok(SyncReport::cancelled(&request, started_at, started));
        }
        Err(e) => return Err(e),
    };

    if !planned.dest_root_exists {
        info!("creating destination root on {}", dest.name());
        dest.create_dir(&RelPath::root())
            .await
            .map_err(|source| SyncError::CreateRoot {
                storage: dest.name().to_string(),
                source,
            })?;
    }

    let executor = TransferExecutor::new(
        config.executor_config(request.direction),
        reporter.clone(),
        cancel,
    );
    let summary = executor.execute(&planned.plan, source, dest).await;

    let report = SyncReport::new(&request, summary, planned, started_at, started);
    info!(
        "sync finished ({:?}) in {} ms: {} bytes",
        report.status, report.duration_ms, report.bytes_transferred
    );
    Ok(report)
}

fn unreachable_paths(source: &TreeListing, dest: &TreeListing) -> Vec<RelPath> {
    let mut paths: Vec<RelPath> = source
        .unreachable
        .iter()
        .chain(dest.unreachable.iter())
        .cloned()
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

/// Reusable sync runner with a cancel handle.
pub struct SyncEngine {
    config: SyncConfig,
    cancel: Mutex<CancellationToken>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancel the sync currently running, if any.
    pub fn cancel(&self) {
        self.current_token().cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.current_token()
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run one sync with a fresh cancel token.
    pub async fn run_sync(
        &self,
        request: SyncRequest,
        reporter: &ProgressReporter,
    ) -> Result<SyncReport, SyncError> {
        let token = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        synchronize(request, &self.config, reporter, token).await
    }
}
