//! Plan execution: directory creation, concurrent transfers, deletions.

use crate::core::comparator::{Action, Plan};
use crate::core::path::RelPath;
use crate::core::progress::{ActionKind, ProgressEvent, ProgressReporter};
use crate::core::throttle::Throttle;
use crate::storage::{ByteStream, ResourceKind, Storage, StorageError};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PARENT_FAILED: &str = "parent directory failed";
const NOT_EMPTY: &str = "a delete below this directory did not succeed";
const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Transfers in flight at once.
    pub concurrency: usize,
    /// Bytes per second across all transfers; `None` is unlimited.
    pub rate_limit: Option<u64>,
    /// Extra attempts for a transfer that failed with a transport error.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_limit: None,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub path: RelPath,
    pub action: ActionKind,
    pub error: String,
}

/// Accounting of one plan execution. Every action lands in exactly one of
/// the succeeded counters, `skipped` or `failed`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub created: usize,
    pub transferred: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_transferred: u64,
    /// In plan order.
    pub failures: Vec<FailedItem>,
    pub cancelled: bool,
}

impl ExecutionSummary {
    pub fn settled(&self) -> usize {
        self.created + self.transferred + self.deleted + self.skipped + self.failed
    }
}

enum TransferOutcome {
    Done(u64),
    Failed(StorageError),
    Cancelled,
}

pub struct TransferExecutor {
    config: ExecutorConfig,
    throttle: Option<Throttle>,
    reporter: ProgressReporter,
    cancel: CancellationToken,
}

impl TransferExecutor {
    pub fn new(config: ExecutorConfig, reporter: ProgressReporter, cancel: CancellationToken) -> Self {
        let throttle = config.rate_limit.and_then(Throttle::new);
        Self {
            config,
            throttle,
            reporter,
            cancel,
        }
    }

    /// Run `plan` in three phases and return once every action has settled.
    pub async fn execute(
        &self,
        plan: &Plan,
        source: Arc<dyn Storage>,
        dest: Arc<dyn Storage>,
    ) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        let summary_of = plan.summary();
        info!(
            "executing plan: {} directories, {} transfers ({} bytes), {} deletes",
            summary_of.create_count,
            summary_of.transfer_count,
            summary_of.transfer_bytes,
            summary_of.delete_count
        );

        let failed_dirs = self.create_phase(plan, dest.as_ref(), &mut summary).await;
        self.transfer_phase(plan, &source, &dest, &failed_dirs, &mut summary)
            .await;
        self.delete_phase(plan, dest.as_ref(), &mut summary).await;

        summary.cancelled = self.cancel.is_cancelled();
        info!(
            "plan finished: {} created, {} transferred, {} deleted, {} skipped, {} failed{}",
            summary.created,
            summary.transferred,
            summary.deleted,
            summary.skipped,
            summary.failed,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    /// Returns the directories whose subtrees must not be touched.
    async fn create_phase(
        &self,
        plan: &Plan,
        dest: &dyn Storage,
        summary: &mut ExecutionSummary,
    ) -> Vec<RelPath> {
        let mut failed_dirs: Vec<RelPath> = Vec::new();

        for action in &plan.actions {
            let Action::CreateDirectory(path) = action else {
                continue;
            };

            if self.cancel.is_cancelled() {
                self.skip(summary, path, ActionKind::CreateDirectory, CANCELLED);
                continue;
            }
            if failed_dirs.iter().any(|dir| path.is_descendant_of(dir)) {
                self.skip(summary, path, ActionKind::CreateDirectory, PARENT_FAILED);
                failed_dirs.push(path.clone());
                continue;
            }

            self.reporter
                .emit(ProgressEvent::started(path, ActionKind::CreateDirectory));
            match dest.create_dir(path).await {
                Ok(()) => {
                    debug!("created {}", path);
                    summary.created += 1;
                    self.reporter.emit(ProgressEvent::succeeded(
                        path,
                        ActionKind::CreateDirectory,
                        None,
                    ));
                }
                Err(e) => {
                    error!("mkdir {} failed: {}", path, e);
                    self.fail(summary, path, ActionKind::CreateDirectory, e.to_string());
                    failed_dirs.push(path.clone());
                }
            }
        }

        failed_dirs
    }

    async fn transfer_phase(
        &self,
        plan: &Plan,
        source: &Arc<dyn Storage>,
        dest: &Arc<dyn Storage>,
        failed_dirs: &[RelPath],
        summary: &mut ExecutionSummary,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();

        for action in &plan.actions {
            let Action::Transfer { path, size, .. } = action else {
                continue;
            };

            if failed_dirs.iter().any(|dir| path.is_descendant_of(dir)) {
                self.skip(summary, path, ActionKind::Transfer, PARENT_FAILED);
                continue;
            }

            let permit = if self.cancel.is_cancelled() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                }
            };
            let Some(permit) = permit else {
                self.skip(summary, path, ActionKind::Transfer, CANCELLED);
                continue;
            };

            debug!("dispatching {} ({} bytes)", path, size);
            self.reporter
                .emit(ProgressEvent::started(path, ActionKind::Transfer));

            let task_path = path.clone();
            let source = source.clone();
            let dest = dest.clone();
            let throttle = self.throttle.clone();
            let reporter = self.reporter.clone();
            let cancel = self.cancel.clone();
            let config = self.config.clone();

            let handle = tokio::spawn(async move {
                let path = task_path;
                let outcome = transfer_with_retry(
                    &path,
                    source.as_ref(),
                    dest.as_ref(),
                    throttle,
                    &cancel,
                    &config,
                )
                .await;
                let event = match &outcome {
                    TransferOutcome::Done(bytes) => {
                        ProgressEvent::succeeded(&path, ActionKind::Transfer, Some(*bytes))
                    }
                    TransferOutcome::Failed(e) => {
                        ProgressEvent::failed(&path, ActionKind::Transfer, e.to_string())
                    }
                    TransferOutcome::Cancelled => {
                        ProgressEvent::skipped(&path, ActionKind::Transfer, CANCELLED)
                    }
                };
                // the slot is released only after the outcome is reported
                reporter.emit(event);
                drop(permit);
                outcome
            });
            handles.push((path.clone(), handle));
        }

        for (path, handle) in handles {
            match handle.await {
                Ok(TransferOutcome::Done(bytes)) => {
                    summary.transferred += 1;
                    summary.bytes_transferred += bytes;
                }
                Ok(TransferOutcome::Failed(e)) => {
                    summary.failed += 1;
                    summary.failures.push(FailedItem {
                        path,
                        action: ActionKind::Transfer,
                        error: e.to_string(),
                    });
                }
                Ok(TransferOutcome::Cancelled) => summary.skipped += 1,
                Err(e) => {
                    error!("transfer task for {} died: {}", path, e);
                    self.fail(summary, &path, ActionKind::Transfer, format!("task failed: {}", e));
                }
            }
        }
    }

    async fn delete_phase(&self, plan: &Plan, dest: &dyn Storage, summary: &mut ExecutionSummary) {
        let mut left_behind: Vec<RelPath> = Vec::new();

        for action in &plan.actions {
            let Action::Delete { path, kind } = action else {
                continue;
            };

            if self.cancel.is_cancelled() {
                self.skip(summary, path, ActionKind::Delete, CANCELLED);
                left_behind.push(path.clone());
                continue;
            }
            if *kind == ResourceKind::Directory
                && left_behind.iter().any(|p| p.is_descendant_of(path))
            {
                self.skip(summary, path, ActionKind::Delete, NOT_EMPTY);
                left_behind.push(path.clone());
                continue;
            }

            self.reporter.emit(ProgressEvent::started(path, ActionKind::Delete));
            match dest.delete(path, *kind).await {
                Ok(()) => {
                    debug!("deleted {}", path);
                    summary.deleted += 1;
                    self.reporter
                        .emit(ProgressEvent::succeeded(path, ActionKind::Delete, None));
                }
                Err(e) if e.is_not_found() => {
                    debug!("{} already gone", path);
                    summary.deleted += 1;
                    self.reporter
                        .emit(ProgressEvent::succeeded(path, ActionKind::Delete, None));
                }
                Err(e) => {
                    error!("delete {} failed: {}", path, e);
                    self.fail(summary, path, ActionKind::Delete, e.to_string());
                    left_behind.push(path.clone());
                }
            }
        }
    }

    fn skip(&self, summary: &mut ExecutionSummary, path: &RelPath, action: ActionKind, reason: &str) {
        debug!("skipping {} {}: {}", action, path, reason);
        summary.skipped += 1;
        self.reporter.emit(ProgressEvent::skipped(path, action, reason));
    }

    fn fail(&self, summary: &mut ExecutionSummary, path: &RelPath, action: ActionKind, error: String) {
        summary.failed += 1;
        self.reporter
            .emit(ProgressEvent::failed(path, action, error.clone()));
        summary.failures.push(FailedItem {
            path: path.clone(),
            action,
            error,
        });
    }
}

/// Backoff before retry number `attempt` (0-based).
fn backoff(config: &ExecutorConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    config
        .retry_base_delay
        .saturating_mul(factor)
        .min(config.retry_max_delay)
}

async fn transfer_with_retry(
    path: &RelPath,
    source: &dyn Storage,
    dest: &dyn Storage,
    throttle: Option<Throttle>,
    cancel: &CancellationToken,
    config: &ExecutorConfig,
) -> TransferOutcome {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return TransferOutcome::Cancelled;
        }

        match transfer_once(path, source, dest, throttle.clone(), cancel).await {
            Ok(bytes) => {
                debug!("transferred {} ({} bytes)", path, bytes);
                return TransferOutcome::Done(bytes);
            }
            Err(StorageError::Cancelled) => return TransferOutcome::Cancelled,
            Err(_) if cancel.is_cancelled() => return TransferOutcome::Cancelled,
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = backoff(config, attempt);
                attempt += 1;
                warn!(
                    "transfer of {} failed, retrying in {:?} ({}/{}): {}",
                    path, delay, attempt, config.max_retries, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return TransferOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!("transfer of {} failed: {}", path, e);
                return TransferOutcome::Failed(e);
            }
        }
    }
}

async fn transfer_once(
    path: &RelPath,
    source: &dyn Storage,
    dest: &dyn Storage,
    throttle: Option<Throttle>,
    cancel: &CancellationToken,
) -> Result<u64, StorageError> {
    let data = source.fetch(path).await?;
    dest.store(path, gate(data, throttle, cancel.clone())).await
}

/// Make every chunk wait for the throttle and stop at the first chunk after
/// cancellation, which aborts the store.
fn gate(data: ByteStream, throttle: Option<Throttle>, cancel: CancellationToken) -> ByteStream {
    let gated = data.then(move |chunk| {
        let throttle = throttle.clone();
        let cancel = cancel.clone();
        async move {
            let chunk = chunk?;
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if let Some(throttle) = throttle {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                    _ = throttle.acquire(chunk.len()) => {}
                }
            }
            Ok(chunk)
        }
    });
    Box::pin(gated)
}
