mod common;

use common::{fast_config, rel, run, MemoryStorage, Node};
use davsync_lib::core::{
    synchronize, ActionKind, Direction, Outcome, PartialListingPolicy, ProgressEvent,
    ProgressReporter, SyncConfig, SyncError, SyncMode, SyncRequest, SyncStatus,
};
use davsync_lib::storage::Storage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn recorder() -> (ProgressReporter, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let reporter = ProgressReporter::from_callback(move |e| sink.lock().unwrap().push(e.clone()));
    (reporter, events)
}

#[tokio::test]
async fn additive_pull_copies_what_is_missing() {
    let remote = MemoryStorage::new("remote")
        .dir("a")
        .file("a/f1", b"0123456789")
        .file("b", b"hello")
        .shared();
    let local = MemoryStorage::new("local").shared();

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.created, 1);
    assert_eq!(report.transferred, 2);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.bytes_transferred, 15);
    assert_eq!(local.node("a"), Some(Node::Dir));
    assert_eq!(local.node("a/f1"), Some(Node::File(b"0123456789".to_vec())));
    assert_eq!(local.node("b"), Some(Node::File(b"hello".to_vec())));
    // the source is never written to
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn additive_leaves_existing_files_alone() {
    let remote = MemoryStorage::new("remote").file("f", b"new content").shared();
    let local = MemoryStorage::new("local")
        .file("f", b"old")
        .file("extra", b"x")
        .shared();

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.transferred, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(local.node("f"), Some(Node::File(b"old".to_vec())));
    assert_eq!(local.node("extra"), Some(Node::File(b"x".to_vec())));
}

#[tokio::test]
async fn overwrite_replaces_files_that_differ_in_size() {
    let remote = MemoryStorage::new("remote").file("f", b"new content").shared();
    let local = MemoryStorage::new("local")
        .file("f", b"old")
        .file("extra", b"x")
        .shared();

    let report = run(
        Direction::Pull,
        SyncMode::Overwrite,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.transferred, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(local.node("f"), Some(Node::File(b"new content".to_vec())));
    assert_eq!(local.node("extra"), Some(Node::File(b"x".to_vec())));
}

#[tokio::test]
async fn mirror_push_deletes_children_before_parents() {
    let local = MemoryStorage::new("local").shared();
    let remote = MemoryStorage::new("remote")
        .dir("a")
        .dir("a/b")
        .file("a/b/deep", b"1")
        .file("a/f1", b"2")
        .file("top", b"3")
        .shared();
    let (reporter, events) = recorder();

    let report = run(
        Direction::Push,
        SyncMode::Mirror,
        &remote,
        &local,
        &fast_config(),
        &reporter,
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.deleted, 5);
    assert!(remote.paths().is_empty());
    assert_eq!(
        remote.calls(),
        vec![
            "delete a/b/deep",
            "delete a/b",
            "delete a/f1",
            "delete a",
            "delete top",
        ]
    );

    let deletes: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action == ActionKind::Delete && e.outcome == Outcome::Succeeded)
        .map(|e| e.path.to_string())
        .collect();
    let pos = |p: &str| deletes.iter().position(|d| d == p).unwrap();
    assert!(pos("a/b/deep") < pos("a/b"));
    assert!(pos("a/b") < pos("a"));
    assert!(pos("a/f1") < pos("a"));
}

#[tokio::test]
async fn failed_delete_keeps_its_parent() {
    let local = MemoryStorage::new("local").shared();
    let remote = MemoryStorage::new("remote")
        .dir("a")
        .file("a/locked", b"1")
        .fail_delete("a/locked")
        .shared();

    let report = run(
        Direction::Push,
        SyncMode::Mirror,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::CompletedWithFailures);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(remote.calls(), vec!["delete a/locked"]);
    assert_eq!(remote.node("a"), Some(Node::Dir));
}

#[tokio::test]
async fn failed_directory_skips_its_subtree() {
    let remote = MemoryStorage::new("remote")
        .dir("a")
        .dir("a/b")
        .file("a/b/f", b"1")
        .file("a/g", b"2")
        .file("c", b"3")
        .shared();
    let local = MemoryStorage::new("local").fail_create("a").shared();
    let (reporter, events) = recorder();

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &reporter,
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::CompletedWithFailures);
    assert_eq!(report.created, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.transferred, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, rel("a"));
    assert_eq!(report.failures[0].action, ActionKind::CreateDirectory);

    // nothing under the failed directory was attempted
    assert_eq!(local.count_calls("mkdir a/b"), 0);
    assert_eq!(local.count_calls("store a/"), 0);
    assert_eq!(local.node("c"), Some(Node::File(b"3".to_vec())));

    let events = events.lock().unwrap();
    for e in events.iter().filter(|e| e.path.is_descendant_of(&rel("a"))) {
        assert_eq!(e.outcome, Outcome::Skipped, "{:?}", e);
    }
}

#[tokio::test]
async fn every_action_gets_one_terminal_event_after_its_start() {
    let local = MemoryStorage::new("local")
        .dir("d")
        .file("d/1", b"a")
        .file("d/2", b"b")
        .file("3", b"c")
        .shared();
    let remote = MemoryStorage::new("remote")
        .file("old", b"z")
        .full_store("d/2")
        .shared();
    let (reporter, events) = recorder();

    let report = run(
        Direction::Push,
        SyncMode::Mirror,
        &remote,
        &local,
        &fast_config(),
        &reporter,
    )
    .await
    .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.deleted, 1);

    let events = events.lock().unwrap();
    let mut started: HashMap<String, usize> = HashMap::new();
    let mut terminal: HashMap<String, usize> = HashMap::new();
    for e in events.iter() {
        let key = format!("{} {}", e.action, e.path);
        if e.outcome == Outcome::Started {
            assert!(!terminal.contains_key(&key), "start after end: {}", key);
            *started.entry(key).or_default() += 1;
        } else {
            assert!(e.outcome.is_terminal());
            *terminal.entry(key).or_default() += 1;
        }
    }
    assert!(terminal.values().all(|n| *n == 1));
    assert!(started.keys().all(|k| terminal.contains_key(k)));
    let settled = report.created + report.transferred + report.deleted + report.skipped + report.failed;
    assert_eq!(terminal.len(), settled);
}

#[tokio::test]
async fn cancelling_mid_run_stops_dispatching() {
    let mut remote = MemoryStorage::new("remote");
    for i in 0..6 {
        remote = remote.file(&format!("f{}", i), b"payload");
    }
    let remote = remote.shared();
    let local = MemoryStorage::new("local").shared();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let reporter = ProgressReporter::from_callback(move |e| {
        if e.action == ActionKind::Transfer && e.outcome == Outcome::Succeeded
            && counter.fetch_add(1, Ordering::SeqCst) + 1 == 2
        {
            trigger.cancel();
        }
    });

    let config = SyncConfig {
        max_concurrent_transfers: 1,
        ..fast_config()
    };
    let request = SyncRequest {
        direction: Direction::Pull,
        remote: remote.clone() as Arc<dyn Storage>,
        local: local.clone() as Arc<dyn Storage>,
        mode: SyncMode::Additive,
    };
    let report = synchronize(request, &config, &reporter, cancel).await.unwrap();

    assert_eq!(report.status, SyncStatus::Cancelled);
    assert_eq!(report.transferred, 2);
    assert_eq!(report.skipped, 4);
    assert_eq!(local.count_calls("store"), 2);
    assert_eq!(local.paths(), vec!["f0", "f1"]);
}

#[tokio::test]
async fn cancelled_before_start_changes_nothing() {
    let remote = MemoryStorage::new("remote").file("f", b"x").shared();
    let local = MemoryStorage::new("local").shared();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let request = SyncRequest {
        direction: Direction::Pull,
        remote: remote.clone() as Arc<dyn Storage>,
        local: local.clone() as Arc<dyn Storage>,
        mode: SyncMode::Mirror,
    };
    let report = synchronize(request, &fast_config(), &ProgressReporter::disabled(), cancel)
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Cancelled);
    assert!(local.calls().is_empty());
}

#[tokio::test]
async fn transport_errors_are_retried() {
    let remote = MemoryStorage::new("remote").file("f", b"data").shared();
    let local = MemoryStorage::new("local").flaky_store("f", 2).shared();

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.transferred, 1);
    assert_eq!(local.count_calls("store f"), 3);
    assert_eq!(local.node("f"), Some(Node::File(b"data".to_vec())));
}

#[tokio::test]
async fn retries_give_up_after_the_limit() {
    let remote = MemoryStorage::new("remote").file("f", b"data").shared();
    let local = MemoryStorage::new("local").flaky_store("f", 10).shared();
    let config = SyncConfig {
        max_retries: 2,
        ..fast_config()
    };

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(local.count_calls("store f"), 3);
    assert!(report.failures[0].error.contains("transport"));
}

#[tokio::test]
async fn domain_errors_are_not_retried() {
    let remote = MemoryStorage::new("remote").file("f", b"data").shared();
    let local = MemoryStorage::new("local").full_store("f").shared();

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::CompletedWithFailures);
    assert_eq!(report.failed, 1);
    assert_eq!(local.count_calls("store f"), 1);
    assert!(local.node("f").is_none());
}

#[tokio::test]
async fn rate_limit_bounds_throughput() {
    let remote = MemoryStorage::new("remote")
        .file("a", &[1u8; 30_000])
        .file("b", &[2u8; 30_000])
        .shared();
    let local = MemoryStorage::new("local").shared();
    let config = SyncConfig {
        download_limit: Some(100_000),
        max_concurrent_transfers: 2,
        ..fast_config()
    };

    let started = Instant::now();
    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.bytes_transferred, 60_000);
    assert!(started.elapsed() >= Duration::from_millis(500), "{:?}", started.elapsed());
}

#[tokio::test]
async fn second_run_has_nothing_to_do() {
    let remote = MemoryStorage::new("remote")
        .dir("a")
        .dir("a/b")
        .file("a/b/c", b"abc")
        .file("x", b"x")
        .shared();
    let local = MemoryStorage::new("local").file("stale", b"s").shared();

    for mode in [SyncMode::Additive, SyncMode::Overwrite, SyncMode::Mirror] {
        run(
            Direction::Pull,
            mode,
            &remote,
            &local,
            &fast_config(),
            &ProgressReporter::disabled(),
        )
        .await
        .unwrap();
        let again = run(
            Direction::Pull,
            mode,
            &remote,
            &local,
            &fast_config(),
            &ProgressReporter::disabled(),
        )
        .await
        .unwrap();
        assert_eq!(
            again.created + again.transferred + again.deleted + again.skipped + again.failed,
            0,
            "{} was not idempotent",
            mode
        );
    }
    assert_eq!(local.paths(), remote.paths());
}

#[tokio::test]
async fn kind_mismatch_is_a_conflict_not_an_action() {
    let remote = MemoryStorage::new("remote")
        .file("same", b"file here")
        .file("ok", b"1")
        .shared();
    let local = MemoryStorage::new("local")
        .dir("same")
        .file("same/inner", b"2")
        .shared();

    let report = run(
        Direction::Pull,
        SyncMode::Mirror,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.conflicts, vec![rel("same")]);
    assert_eq!(report.transferred, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(local.node("same/inner"), Some(Node::File(b"2".to_vec())));
}

#[tokio::test]
async fn missing_source_root_is_fatal() {
    let remote = MemoryStorage::without_root("remote").shared();
    let local = MemoryStorage::new("local").file("f", b"keep").shared();

    let err = run(
        Direction::Pull,
        SyncMode::Mirror,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SyncError::SourceRootMissing { .. }), "{}", err);
    assert!(local.calls().is_empty());
}

#[tokio::test]
async fn missing_destination_root_is_created_when_allowed() {
    let remote = MemoryStorage::without_root("remote").shared();
    let local = MemoryStorage::new("local").file("f", b"up").shared();

    let report = run(
        Direction::Push,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.transferred, 1);
    assert_eq!(remote.node(""), Some(Node::Dir));
    assert_eq!(remote.node("f"), Some(Node::File(b"up".to_vec())));
}

#[tokio::test]
async fn missing_destination_root_is_fatal_without_auto_create() {
    let remote = MemoryStorage::without_root("remote").shared();
    let local = MemoryStorage::new("local").file("f", b"up").shared();
    let config = SyncConfig {
        auto_create_dir: false,
        ..fast_config()
    };

    let err = run(
        Direction::Push,
        SyncMode::Additive,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SyncError::DestinationRootMissing { .. }), "{}", err);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn unreadable_directory_fails_the_sync_by_default() {
    let remote = MemoryStorage::new("remote")
        .dir("private")
        .file("private/secret", b"s")
        .file("public", b"p")
        .deny_list("private")
        .shared();
    let local = MemoryStorage::new("local").shared();

    let err = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &fast_config(),
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap_err();

    match err {
        SyncError::PartialListing { paths } => assert_eq!(paths, vec![rel("private")]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(local.calls().is_empty());
}

#[tokio::test]
async fn unreadable_directory_is_left_alone_when_skipping() {
    let remote = MemoryStorage::new("remote")
        .dir("private")
        .file("private/secret", b"s")
        .file("public", b"p")
        .deny_list("private")
        .shared();
    let local = MemoryStorage::new("local")
        .dir("private")
        .file("private/mine", b"m")
        .shared();
    let mut config = fast_config();
    config.scan_config.partial_listing = PartialListingPolicy::Skip;

    let report = run(
        Direction::Pull,
        SyncMode::Mirror,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.unreachable, vec![rel("private")]);
    assert_eq!(report.transferred, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(local.node("private/mine"), Some(Node::File(b"m".to_vec())));
}

#[tokio::test]
async fn excluded_paths_are_neither_copied_nor_deleted() {
    let remote = MemoryStorage::new("remote")
        .dir(".git")
        .file(".git/HEAD", b"ref")
        .file("notes.tmp", b"t")
        .file("keep.txt", b"k")
        .shared();
    let local = MemoryStorage::new("local").file("local.tmp", b"l").shared();
    let mut config = fast_config();
    config.scan_config.exclude_patterns = vec![".git".into(), "*.tmp".into()];

    let report = run(
        Direction::Pull,
        SyncMode::Mirror,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.transferred, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(local.paths(), vec!["keep.txt", "local.tmp"]);
}

#[tokio::test]
async fn mirror_keeps_directories_that_hold_excluded_entries() {
    let remote = MemoryStorage::new("remote").shared();
    let local = MemoryStorage::new("local")
        .dir("proj")
        .dir("proj/.git")
        .file("proj/.git/HEAD", b"ref")
        .file("proj/readme", b"r")
        .shared();
    let mut config = fast_config();
    config.scan_config.exclude_patterns = vec![".git".into()];

    let report = run(
        Direction::Pull,
        SyncMode::Mirror,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::Completed, "{:?}", report.failures);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.retained, vec![rel("proj")]);
    assert_eq!(local.calls(), vec!["delete proj/readme"]);
    assert_eq!(local.node("proj/.git/HEAD"), Some(Node::File(b"ref".to_vec())));
}

#[tokio::test]
async fn mirror_keeps_directories_above_an_unreadable_subtree() {
    let remote = MemoryStorage::new("remote").shared();
    let local = MemoryStorage::new("local")
        .dir("old")
        .dir("old/locked")
        .file("old/locked/x", b"x")
        .file("old/f", b"f")
        .deny_list("old/locked")
        .shared();
    let mut config = fast_config();
    config.scan_config.partial_listing = PartialListingPolicy::Skip;

    let report = run(
        Direction::Pull,
        SyncMode::Mirror,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::Completed, "{:?}", report.failures);
    assert_eq!(report.unreachable, vec![rel("old/locked")]);
    assert_eq!(report.retained, vec![rel("old")]);
    assert_eq!(report.deleted, 1);
    assert_eq!(local.calls(), vec!["delete old/f"]);
    assert_eq!(local.node("old/locked/x"), Some(Node::File(b"x".to_vec())));
}

#[tokio::test]
async fn transfers_never_exceed_the_concurrency_limit() {
    let mut remote = MemoryStorage::new("remote");
    for i in 0..8 {
        remote = remote.file(&format!("f{}", i), b"data");
    }
    let remote = remote.shared();
    let local = MemoryStorage::new("local")
        .slow_store(Duration::from_millis(50))
        .shared();
    let config = SyncConfig {
        max_concurrent_transfers: 3,
        ..fast_config()
    };

    let report = run(
        Direction::Pull,
        SyncMode::Additive,
        &remote,
        &local,
        &config,
        &ProgressReporter::disabled(),
    )
    .await
    .unwrap();

    assert_eq!(report.transferred, 8);
    assert_eq!(local.peak_stores(), 3);
}
