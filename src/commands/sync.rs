//! `pull` and `push`.

use super::Context;
use crate::config::SyncSettings;
use crate::core::comparator::{Action, SyncMode};
use crate::core::engine::{plan, synchronize, Direction, SyncPlan, SyncReport, SyncRequest, SyncStatus};
use crate::core::progress::{ActionKind, Outcome, ProgressEvent, ProgressReporter};
use crate::core::scanner::PartialListingPolicy;
use crate::core::SyncError;
use crate::storage::{LocalStorage, Storage};
use anyhow::{Context as _, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, clap::Args)]
pub struct SyncArgs {
    /// Remote directory
    pub remote: String,

    /// Local directory
    pub local: PathBuf,

    /// additive (add missing), overwrite (also replace changed) or mirror
    /// (also delete extras)
    #[arg(long, short, default_value_t = SyncMode::Additive)]
    pub mode: SyncMode,

    /// Parallel transfers
    #[arg(long, short)]
    pub concurrency: Option<usize>,

    /// Bandwidth cap, e.g. 500K or 2M (bytes per second)
    #[arg(long, value_parser = parse_rate)]
    pub limit: Option<u64>,

    /// Glob of paths to leave out; repeatable
    #[arg(long, short = 'x')]
    pub exclude: Vec<String>,

    /// Sync what can be listed instead of failing on unreadable directories
    #[arg(long)]
    pub skip_unreadable: bool,

    /// Print the plan without changing anything
    #[arg(long, short = 'n')]
    pub dry_run: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse a byte rate with an optional K, M or G suffix (powers of 1024).
pub fn parse_rate(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1024,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                other => return Err(format!("unknown rate suffix {:?}", other)),
            };
            (&raw[..idx], multiplier)
        }
        _ => (raw, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid rate {:?}", raw))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("rate {:?} is too large", raw))
}

impl SyncArgs {
    /// Layer the flags over the configured defaults.
    fn settings(&self, base: &SyncSettings, direction: Direction) -> SyncSettings {
        let mut settings = base.clone();
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency;
        }
        if let Some(limit) = self.limit {
            match direction {
                Direction::Pull => settings.download_limit = limit,
                Direction::Push => settings.upload_limit = limit,
            }
        }
        settings.exclude_patterns.extend(self.exclude.iter().cloned());
        if self.skip_unreadable {
            settings.partial_listing = PartialListingPolicy::Skip;
        }
        settings
    }
}

pub async fn run(
    ctx: &Context,
    direction: Direction,
    args: SyncArgs,
    cancel: CancellationToken,
) -> Result<SyncStatus> {
    let settings = args.settings(&ctx.config.sync, direction);
    let config = settings.to_sync_config();

    let remote = ctx.connect(&ctx.remote_path(&args.remote)?)?;
    if direction == Direction::Pull && config.auto_create_dir && !args.dry_run {
        tokio::fs::create_dir_all(&args.local)
            .await
            .with_context(|| format!("cannot create {}", args.local.display()))?;
    }
    let local: Arc<dyn Storage> = Arc::new(LocalStorage::new(&args.local));

    let request = SyncRequest {
        direction,
        remote,
        local,
        mode: args.mode,
    };

    if args.dry_run {
        return match plan(&request, &config, cancel).await {
            Ok(planned) => {
                print_plan(&planned, args.json)?;
                Ok(SyncStatus::Completed)
            }
            Err(SyncError::Cancelled) => Ok(SyncStatus::Cancelled),
            Err(e) => Err(e.into()),
        };
    }

    let (reporter, events) = ProgressReporter::channel();
    let display = tokio::spawn(show_progress(events, args.json));
    let result = synchronize(request, &config, &reporter, cancel).await;
    drop(reporter);
    let _ = display.await;

    let report = result?;
    print_report(&report, args.json)?;
    Ok(report.status)
}

fn print_plan(planned: &SyncPlan, json: bool) -> Result<()> {
    let plan = &planned.plan;
    let summary = plan.summary();
    if json {
        let out = serde_json::json!({
            "summary": summary,
            "conflicts": plan.conflicts,
            "retained": plan.retained,
            "unreachable": planned.unreachable,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if !planned.dest_root_exists {
        println!("mkdir    /");
    }
    for action in &plan.actions {
        match action {
            Action::CreateDirectory(path) => println!("mkdir    {}", path),
            Action::Transfer { path, size, .. } => {
                println!("transfer {} ({})", path, HumanBytes(*size))
            }
            Action::Delete { path, .. } => println!("delete   {}", path),
        }
    }
    for path in &plan.conflicts {
        println!("conflict {}", path);
    }
    for path in &plan.retained {
        println!("keep     {} (holds unlisted entries)", path);
    }
    for path in &planned.unreachable {
        println!("skip     {} (unreachable)", path);
    }
    println!(
        "{} actions: {} directories, {} transfers ({}), {} deletes",
        summary.total_actions(),
        summary.create_count,
        summary.transfer_count,
        HumanBytes(summary.transfer_bytes),
        summary.delete_count
    );
    Ok(())
}

async fn show_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>, quiet: bool) {
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    if let Ok(style) = ProgressStyle::with_template("{spinner} {prefix} {wide_msg}") {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut done = 0usize;
    let mut failed = 0usize;
    let mut bytes = 0u64;
    while let Some(event) = events.recv().await {
        match event.outcome {
            Outcome::Started => {
                bar.set_message(format!("{} {}", event.action, event.path));
                continue;
            }
            Outcome::Succeeded => {
                done += 1;
                bytes += event.bytes_transferred.unwrap_or(0);
            }
            Outcome::Failed => {
                failed += 1;
                bar.suspend(|| {
                    eprintln!(
                        "failed: {} {}: {}",
                        event.action,
                        event.path,
                        event.error.as_deref().unwrap_or("unknown error")
                    )
                });
            }
            Outcome::Skipped => {
                if event.action == ActionKind::Transfer {
                    info!("skipped {}: {}", event.path, event.error.as_deref().unwrap_or(""));
                }
            }
        }
        bar.set_prefix(format!("{} done, {} failed, {}", done, failed, HumanBytes(bytes)));
    }
    bar.finish_and_clear();
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "{} {}: {} created, {} transferred ({}), {} deleted, {} skipped, {} failed in {:.1}s",
        report.direction,
        match report.status {
            SyncStatus::Completed => "completed",
            SyncStatus::CompletedWithFailures => "completed with failures",
            SyncStatus::Cancelled => "cancelled",
        },
        report.created,
        report.transferred,
        HumanBytes(report.bytes_transferred),
        report.deleted,
        report.skipped,
        report.failed,
        report.duration_ms as f64 / 1000.0
    );
    for failure in &report.failures {
        println!("  failed {} {}: {}", failure.action, failure.path, failure.error);
    }
    for path in &report.conflicts {
        println!("  conflict {}: file on one side, directory on the other", path);
    }
    for path in &report.unreachable {
        println!("  unreachable {}", path);
    }
    for path in &report.retained {
        println!("  kept {}: holds entries that were not listed", path);
    }
    Ok(())
}
