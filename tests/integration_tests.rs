//! Integration tests for course-sync
//!
//! These tests drive a full engine over a scripted transport and the local
//! filesystem: course syncs, pause/resume mid-transfer, retries, server
//! errors, deletion of in-flight content, crash recovery and halting on
//! storage failures.


use course_sync::{
    ContentKind, ContentUnit, CourseId, Disk, EntryId, EntryStatus, EntryStore, JobOutcome,
    LocalDisk, ManifestSource, MemoryEntryStore, OfflineLayout, SqliteEntryStore, SyncEntry,
    StatusChangeEvent, Subscription, SyncError, SyncEvent,
};
use mock_transport::{Failure, MockTransport};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::*;
use tokio::time::timeout;

/// Every queued status change of `id`
fn drain_changes(events: &mut Subscription, id: &EntryId) -> Vec<StatusChangeEvent> {
    let mut changes = Vec::new();
    while let Some(event) = events.try_recv() {
        if let Some(change) = event.as_status_change() {
            if &change.entry_id == id {
                changes.push(change.clone());
            }
        }
    }
    changes
}

/// An entry may restart lower on a new claim, but never loses bytes
/// while it stays active
fn assert_active_progress_monotonic(changes: &[StatusChangeEvent]) {
    let mut last = None;
    for change in changes {
        if change.new_status != Some(EntryStatus::Active) {
            continue;
        }
        if change.old_status == Some(EntryStatus::Active) {
            if let Some(previous) = last {
                assert!(
                    change.bytes_transferred >= previous,
                    "active progress of {} dropped from {} to {}",
                    change.entry_id,
                    previous,
                    change.bytes_transferred
                );
            }
        }
        last = Some(change.bytes_transferred);
    }
}

// =============================================================================
// Course Sync Tests
// =============================================================================

#[tokio::test]
async fn test_course_sync_completes_all_entries() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    for (name, len) in [("a", 100), ("b", 35), ("c", 7)] {
        transport.serve(&locator(name), payload(len));
    }
    let source = source_with(
        &course,
        vec![file_unit("a"), file_unit("b"), file_unit("c")],
    );

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut job = engine.start_sync(&course).await.expect("start sync");
    assert_eq!(job.entry_ids().len(), 3);

    let outcome = timeout(WAIT, job.wait()).await.expect("job finished").unwrap();
    assert_eq!(
        outcome,
        JobOutcome {
            completed: 3,
            ..Default::default()
        }
    );

    let entries = engine.entries(&course).await.unwrap();
    let positions: Vec<u32> = entries.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
    for entry in &entries {
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(Some(entry.bytes_transferred), entry.size_bytes);
        let content = tokio::fs::read(&entry.local_path).await.expect("file on disk");
        assert_eq!(content, payload(entry.bytes_transferred as usize));
        assert!(entry
            .local_path
            .starts_with(temp_dir.path().join("tester").join("Offline").join("course-101")));
    }

    let summary = engine.summarize(&course).await.unwrap();
    assert_eq!(summary.completed_count, 3);
    assert_eq!(summary.total_bytes, 142);
    assert_eq!(summary.transferred_bytes, 142);
    assert!(summary.is_settled());
    assert_eq!(transport.bytes_served(), 142);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_units_without_payload_are_skipped() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("7");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("doc"), payload(20));

    let mut no_locator = ContentUnit::new("intro", ContentKind::Page, "unused");
    no_locator.remote_locator = None;
    let source = source_with(
        &course,
        vec![
            no_locator,
            ContentUnit::new("lti", ContentKind::ExternalTool, "https://tool.example"),
            file_unit("doc"),
            file_unit("doc"),
        ],
    );

    let engine = create_test_engine(test_config(&temp_dir), source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    assert_eq!(job.entry_ids(), &[file_id(&course, "doc")]);
    timeout(WAIT, job.wait()).await.unwrap().unwrap();

    assert_eq!(engine.entries(&course).await.unwrap().len(), 1);
    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_composition_error_commits_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let known = CourseId::new("1");
    let source = source_with(&known, vec![file_unit("a")]);
    let engine = create_test_engine(
        test_config(&temp_dir),
        source,
        Arc::new(MockTransport::new()),
    )
    .await;

    let unknown = CourseId::new("404");
    let result = engine.start_sync(&unknown).await;
    assert!(matches!(result, Err(SyncError::Composition { .. })));
    assert!(engine.entries(&unknown).await.unwrap().is_empty());
    assert!(engine
        .entries_with_status(EntryStatus::Queued)
        .await
        .unwrap()
        .is_empty());

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_recompose_is_idempotent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("a"), payload(30));
    transport.serve(&locator("b"), payload(30));
    let source = source_with(&course, vec![file_unit("a"), file_unit("b")]);

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut first = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, first.wait()).await.unwrap().unwrap();
    let before = engine.entries(&course).await.unwrap();

    // Nothing changed remotely: the job settles at once, nothing refetched
    let mut second = engine.start_sync(&course).await.unwrap();
    let outcome = timeout(WAIT, second.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 2);
    assert_eq!(transport.fetch_count(&locator("a")), 1);

    let after = engine.entries(&course).await.unwrap();
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.id, new.id);
        assert_eq!(new.status, EntryStatus::Completed);
        assert_eq!(old.local_path, new.local_path);
        assert!(new.touched_at >= old.touched_at);
    }

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_changed_version_is_downloaded_again() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("a"), payload(30));
    let source = source_with(&course, vec![file_unit("a")]);

    let engine = create_test_engine(test_config(&temp_dir), source.clone(), transport.clone()).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();
    let id = file_id(&course, "a");
    engine.acknowledge(&id).await.unwrap();

    transport.serve(&locator("a"), payload(50));
    source.set_course(course.clone(), vec![file_unit("a").with_version("v2")]);

    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.version.as_deref(), Some("v2"));
    assert_eq!(entry.bytes_transferred, 50);
    assert!(!entry.is_hidden_from_user);
    assert_eq!(transport.fetch_count(&locator("a")), 2);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_stale_entries_are_removed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("keep"), payload(10));
    transport.serve(&locator("gone"), payload(10));
    let source = source_with(&course, vec![file_unit("keep"), file_unit("gone")]);

    let engine = create_test_engine(test_config(&temp_dir), source.clone(), transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();

    let gone = engine
        .entry(&file_id(&course, "gone"))
        .await
        .unwrap()
        .unwrap();
    assert!(gone.local_path.exists());

    source.set_course(course.clone(), vec![file_unit("keep")]);
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();

    let removal = wait_for_change(&mut events, |c| c.entry_id == gone.id).await.unwrap();
    assert!(removal.is_removal());
    assert!(!gone.local_path.exists());
    assert_eq!(engine.entries(&course).await.unwrap().len(), 1);

    engine.shutdown().await.ok();
}

// =============================================================================
// Pause / Resume Tests
// =============================================================================

#[tokio::test]
async fn test_pause_mid_transfer_and_resume() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("video"), payload(100));
    let _gate = transport.gate_at(&locator("video"), 40);
    let source = source_with(&course, vec![file_unit("video")]);
    let id = file_id(&course, "video");

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();

    let progress = wait_for_change(&mut events, |c| {
        c.entry_id == id && c.bytes_transferred == 40
    })
    .await
    .expect("progress at 40");
    assert_eq!(progress.new_status, Some(EntryStatus::Active));
    assert_eq!(progress.size_bytes, Some(100));

    engine.pause(&id).await.unwrap();
    let paused = wait_for_status(&engine, &id, EntryStatus::Paused).await;
    assert_eq!(paused.bytes_transferred, 40);
    assert!(!paused.pause_requested);
    assert_eq!(
        tokio::fs::metadata(&paused.local_path).await.unwrap().len(),
        40
    );
    assert!(!job.is_finished());

    engine.resume(&id).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 1);

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    assert_eq!(entry.bytes_transferred, 100);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(
        tokio::fs::read(&entry.local_path).await.unwrap(),
        payload(100)
    );

    // The resumed fetch asked for the remainder only
    assert_eq!(
        transport.requests(),
        vec![(locator("video"), 0), (locator("video"), 40)]
    );
    assert_eq!(transport.bytes_served(), 100);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_pause_queued_entry_keeps_progress() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("first"), payload(50));
    transport.serve(&locator("second"), payload(50));
    let gate = transport.gate_at(&locator("first"), 20);
    let source = source_with(&course, vec![file_unit("first"), file_unit("second")]);
    let second = file_id(&course, "second");

    let config = test_config(&temp_dir).max_concurrent_transfers(1);
    let engine = create_test_engine(config, source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();

    wait_for_status(&engine, &file_id(&course, "first"), EntryStatus::Active).await;
    engine.pause(&second).await.unwrap();
    let paused = engine.entry(&second).await.unwrap().unwrap();
    assert_eq!(paused.status, EntryStatus::Paused);

    // Pausing twice is a no-op
    engine.pause(&second).await.unwrap();

    engine.resume(&second).await.unwrap();
    let resumed = engine.entry(&second).await.unwrap().unwrap();
    assert_eq!(resumed.status, EntryStatus::Queued);
    assert_eq!(resumed.retry_count, 0);
    assert_eq!(resumed.bytes_transferred, paused.bytes_transferred);

    gate.send_replace(true);
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 2);

    // Completed entries can be neither paused nor resumed
    assert!(matches!(
        engine.pause(&second).await,
        Err(SyncError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.resume(&second).await,
        Err(SyncError::InvalidState { .. })
    ));

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_pause_all_and_resume_all() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    let mut gates = Vec::new();
    let mut units = Vec::new();
    for name in ["a", "b", "c", "d"] {
        transport.serve(&locator(name), payload(40));
        gates.push(transport.gate_at(&locator(name), 20));
        units.push(file_unit(name));
    }
    let source = source_with(&course, units);

    let config = test_config(&temp_dir).max_concurrent_transfers(2);
    let engine = create_test_engine(config, source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    wait_for_status(&engine, &file_id(&course, "a"), EntryStatus::Active).await;

    assert_eq!(engine.pause_all(&course).await.unwrap(), 4);
    for name in ["a", "b", "c", "d"] {
        wait_for_status(&engine, &file_id(&course, name), EntryStatus::Paused).await;
    }
    assert_eq!(engine.summarize(&course).await.unwrap().paused_count, 4);

    for gate in &gates {
        gate.send_replace(true);
    }
    assert_eq!(engine.resume_all(&course).await.unwrap(), 4);
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 4);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_pause_without_range_support_restarts_from_zero() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::without_ranges());
    transport.serve(&locator("blob"), payload(60));
    let gate = transport.gate_at(&locator("blob"), 30);
    let source = source_with(&course, vec![file_unit("blob")]);
    let id = file_id(&course, "blob");

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();
    wait_for_change(&mut events, |c| c.entry_id == id && c.bytes_transferred == 30)
        .await
        .unwrap();

    engine.pause(&id).await.unwrap();
    let paused = wait_for_status(&engine, &id, EntryStatus::Paused).await;
    assert_eq!(paused.bytes_transferred, 0);
    assert!(!paused.local_path.exists());

    gate.send_replace(true);
    engine.resume(&id).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(
        transport.requests(),
        vec![(locator("blob"), 0), (locator("blob"), 0)]
    );

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_resume_after_partial_file_shrank() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("video"), payload(100));
    let gate = transport.gate_at(&locator("video"), 60);
    let source = source_with(&course, vec![file_unit("video")]);
    let id = file_id(&course, "video");

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();
    wait_for_change(&mut events, |c| c.entry_id == id && c.bytes_transferred == 60)
        .await
        .expect("progress at 60");

    engine.pause(&id).await.unwrap();
    let paused = wait_for_status(&engine, &id, EntryStatus::Paused).await;
    assert_eq!(paused.bytes_transferred, 60);
    gate.send_replace(true);

    // Something outside the engine cut the partial file short
    LocalDisk::new().truncate(&paused.local_path, 30).await.unwrap();

    engine.resume(&id).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 1);

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.bytes_transferred, 100);
    assert_eq!(
        tokio::fs::read(&entry.local_path).await.unwrap(),
        payload(100)
    );
    assert_eq!(
        transport.requests(),
        vec![(locator("video"), 0), (locator("video"), 30)]
    );

    let changes = drain_changes(&mut events, &id);
    let claim = changes
        .iter()
        .find(|c| {
            c.old_status == Some(EntryStatus::Queued) && c.new_status == Some(EntryStatus::Active)
        })
        .expect("claim event");
    assert_eq!(claim.bytes_transferred, 30);
    assert_active_progress_monotonic(&changes);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_ignored_range_never_lowers_active_progress() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::ignoring_ranges());
    transport.serve(&locator("video"), payload(100));
    let gate = transport.gate_at(&locator("video"), 40);
    let source = source_with(&course, vec![file_unit("video")]);
    let id = file_id(&course, "video");

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();
    wait_for_change(&mut events, |c| c.entry_id == id && c.bytes_transferred == 40)
        .await
        .expect("progress at 40");

    engine.pause(&id).await.unwrap();
    wait_for_status(&engine, &id, EntryStatus::Paused).await;
    gate.send_replace(true);
    engine.resume(&id).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 1);

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.bytes_transferred, 100);
    assert_eq!(
        tokio::fs::read(&entry.local_path).await.unwrap(),
        payload(100)
    );

    // The second fetch came back from byte 0 and the stored prefix was skipped
    assert_eq!(
        transport.requests(),
        vec![(locator("video"), 0), (locator("video"), 40)]
    );
    assert_eq!(transport.bytes_served(), 140);

    let changes = drain_changes(&mut events, &id);
    assert!(changes
        .iter()
        .filter(|c| c.new_status == Some(EntryStatus::Active))
        .all(|c| c.bytes_transferred >= 40));
    assert_active_progress_monotonic(&changes);

    engine.shutdown().await.ok();
}

// =============================================================================
// Failure Handling Tests
// =============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("flaky"), payload(80));
    transport.fail_next(&locator("flaky"), Failure::Transient);
    transport.fail_next(&locator("flaky"), Failure::MidStream(50));
    let source = source_with(&course, vec![file_unit("flaky")]);
    let id = file_id(&course, "flaky");

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 1);

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.last_error, None);
    assert_eq!(
        tokio::fs::read(&entry.local_path).await.unwrap(),
        payload(80)
    );

    // Third attempt resumed after the 50 bytes kept from the broken stream
    assert_eq!(
        transport.requests(),
        vec![
            (locator("flaky"), 0),
            (locator("flaky"), 0),
            (locator("flaky"), 50)
        ]
    );

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_retry_budget_exhausted_fails_entry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("down"), payload(10));
    for _ in 0..3 {
        transport.fail_next(&locator("down"), Failure::Transient);
    }
    let source = source_with(&course, vec![file_unit("down")]);
    let id = file_id(&course, "down");

    let mut config = test_config(&temp_dir);
    config.retry.max_retries = 2;
    let engine = create_test_engine(config, source, transport.clone()).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.failed, 1);
    assert!(outcome.has_error());

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.retry_count, 2);
    assert!(entry.last_error.as_deref().unwrap().contains("reset"));
    assert_eq!(transport.fetch_count(&locator("down")), 3);

    // Failed entries stay visible until the user acts
    let summary = engine.summarize(&course).await.unwrap();
    assert_eq!(summary.failed_count, 1);

    // A manual resume starts a fresh retry budget
    engine.resume(&id).await.unwrap();
    wait_for_status(&engine, &id, EntryStatus::Completed).await;
    assert_eq!(engine.entry(&id).await.unwrap().unwrap().retry_count, 0);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("revoked"), payload(10));
    transport.fail_next(&locator("revoked"), Failure::Server(403));
    let source = source_with(&course, vec![file_unit("revoked")]);
    let id = file_id(&course, "revoked");

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.server_error, 1);

    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::ServerError);
    assert_eq!(entry.retry_count, 0);
    assert!(entry.last_error.as_deref().unwrap().contains("403"));

    // Nothing retries it automatically
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.fetch_count(&locator("revoked")), 1);

    let summary = engine.summarize(&course).await.unwrap();
    assert_eq!(summary.failed_count, 1);
    assert_eq!(summary.server_error_count, 1);

    engine.resume(&id).await.unwrap();
    wait_for_status(&engine, &id, EntryStatus::Completed).await;

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_storage_failures_halt_scheduling() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    let mut units = Vec::new();
    for name in ["a", "b", "c"] {
        transport.serve(&locator(name), payload(30));
        units.push(file_unit(name));
    }
    let source = source_with(&course, units);
    let disk = Arc::new(FailingDisk::new(true));

    let mut config = test_config(&temp_dir).storage_failure_threshold(2);
    config.retry.max_retries = 10;
    let engine = create_engine_with(
        config,
        Arc::new(MemoryEntryStore::new()),
        disk.clone(),
        source,
        transport,
    )
    .await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();

    let halted = wait_for_event(&mut events, |e| matches!(e, SyncEvent::SyncHalted { .. }))
        .await
        .expect("halt event");
    match halted {
        SyncEvent::SyncHalted { reason } => assert!(reason.contains("No space left")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(engine.is_halted());
    assert!(matches!(
        engine.start_sync(&course).await,
        Err(SyncError::SyncHalted(_))
    ));

    // No new work is pulled while halted
    tokio::time::sleep(Duration::from_millis(200)).await;
    let failed_while_halted = disk.failed_writes();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(disk.failed_writes(), failed_while_halted);
    assert_eq!(engine.active_transfers(), 0);

    disk.set_failing(false);
    engine.resume_scheduling().await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::SyncResumed))
        .await
        .expect("resume event");

    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 3);
    assert!(!engine.is_halted());

    engine.shutdown().await.ok();
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[tokio::test]
async fn test_delete_all_while_transfers_active() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    let mut gates = Vec::new();
    let mut units = Vec::new();
    for name in ["a", "b", "c", "d"] {
        transport.serve(&locator(name), payload(100));
        gates.push(transport.gate_at(&locator(name), 30));
        units.push(file_unit(name));
    }
    let source = source_with(&course, units);

    let engine = create_test_engine(test_config(&temp_dir), source, transport.clone()).await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();
    wait_for_change(&mut events, |c| c.bytes_transferred == 30)
        .await
        .expect("transfer in flight");

    let course_dir = engine.layout().course_dir(&course);
    assert!(course_dir.exists());

    let removed = engine.delete_all(&course).await.unwrap();
    assert_eq!(removed, 4);
    assert!(engine.entries(&course).await.unwrap().is_empty());
    assert!(!course_dir.exists());

    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.removed, 4);

    // Released gates must not bring files or rows back
    for gate in &gates {
        gate.send_replace(true);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!course_dir.exists());
    assert!(engine.entries(&course).await.unwrap().is_empty());
    assert_eq!(engine.active_transfers(), 0);

    // Each deleted entry is announced once and never mentioned again
    let deleted: HashSet<EntryId> = ["a", "b", "c", "d"]
        .iter()
        .map(|name| file_id(&course, name))
        .collect();
    let mut announced = HashSet::new();
    while let Some(event) = events.try_recv() {
        let Some(change) = event.as_status_change() else {
            continue;
        };
        if !deleted.contains(&change.entry_id) {
            continue;
        }
        assert!(
            !announced.contains(&change.entry_id),
            "{} changed to {:?} after its removal",
            change.entry_id,
            change.new_status
        );
        if change.new_status.is_none() {
            announced.insert(change.entry_id.clone());
        }
    }
    assert_eq!(announced, deleted);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("a"), payload(20));
    let source = source_with(&course, vec![file_unit("a")]);
    let id = file_id(&course, "a");

    let engine = create_test_engine(test_config(&temp_dir), source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();
    let path = engine.entry(&id).await.unwrap().unwrap().local_path;

    engine.delete(&id).await.unwrap();
    assert!(engine.entry(&id).await.unwrap().is_none());
    assert!(!path.exists());

    engine.delete(&id).await.expect("second delete is not an error");
    assert!(matches!(
        engine.pause(&id).await,
        Err(SyncError::NotFound(_))
    ));

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_ids_differing_in_escaped_characters_keep_separate_files() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("a/b"), payload(30));
    transport.serve(&locator("a_b"), payload(70));
    let source = source_with(&course, vec![file_unit("a/b"), file_unit("a_b")]);

    let engine = create_test_engine(test_config(&temp_dir), source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 2);

    let slash = engine
        .entry(&file_id(&course, "a/b"))
        .await
        .unwrap()
        .unwrap();
    let underscore = engine
        .entry(&file_id(&course, "a_b"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(slash.local_path, underscore.local_path);
    assert!(engine.layout().contains(&slash.local_path));
    assert_eq!(tokio::fs::read(&slash.local_path).await.unwrap(), payload(30));
    assert_eq!(
        tokio::fs::read(&underscore.local_path).await.unwrap(),
        payload(70)
    );

    engine.delete(&slash.id).await.unwrap();
    assert!(!slash.local_path.exists());

    let survivor = engine.entry(&underscore.id).await.unwrap().unwrap();
    assert_eq!(survivor.status, EntryStatus::Completed);
    assert_eq!(
        tokio::fs::read(&survivor.local_path).await.unwrap(),
        payload(70)
    );

    engine.shutdown().await.ok();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_startup_reconciliation() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let config = test_config(&temp_dir);
    let layout = OfflineLayout::new(&config.root_dir, &config.session_id);
    let db_path = config.get_database_path();

    let row = |name: &str, status: EntryStatus, size: u64, transferred: u64| {
        let mut entry = SyncEntry::new(
            course.clone(),
            ContentKind::File,
            name,
            locator(name),
            layout.entry_path(&course, ContentKind::File, name),
        );
        entry.status = status;
        entry.size_bytes = Some(size);
        entry.bytes_transferred = transferred;
        entry
    };

    // State a crashed process could leave behind
    let mut paused_crash = row("paused", EntryStatus::Active, 100, 40);
    paused_crash.pause_requested = true;
    let rows = vec![
        row("active", EntryStatus::Active, 100, 40),
        paused_crash,
        row("lost", EntryStatus::Completed, 30, 30),
    ];
    let disk = LocalDisk::new();
    disk.write(&rows[0].local_path, 0, &payload(60)).await.unwrap();
    disk.write(&rows[1].local_path, 0, &payload(70)).await.unwrap();
    let orphan = layout.course_dir(&course).join("file").join("orphan");
    disk.write(&orphan, 0, b"left over").await.unwrap();
    {
        let store = SqliteEntryStore::new(&db_path).await.unwrap();
        store.upsert(&rows).await.unwrap();
    }

    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("active"), payload(100));
    transport.serve(&locator("paused"), payload(100));
    transport.serve(&locator("lost"), payload(30));
    let source = source_with(
        &course,
        vec![file_unit("active"), file_unit("paused"), file_unit("lost")],
    );

    let store = Arc::new(SqliteEntryStore::new(&db_path).await.unwrap());
    let engine = create_engine_with(
        config,
        store,
        Arc::new(LocalDisk::new()),
        source,
        transport.clone(),
    )
    .await;

    let report = engine.recovery_report().clone();
    assert_eq!(report.requeued, 2);
    assert_eq!(report.invalidated, 1);
    assert_eq!(report.truncated, 2);
    assert_eq!(report.orphans_removed, 1);
    assert!(!orphan.exists());

    // The paused intent survived the crash
    let paused = engine
        .entry(&file_id(&course, "paused"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, EntryStatus::Paused);
    assert_eq!(paused.bytes_transferred, 40);
    assert!(!paused.pause_requested);
    assert_eq!(
        tokio::fs::metadata(&paused.local_path).await.unwrap().len(),
        40
    );

    wait_for_status(&engine, &file_id(&course, "active"), EntryStatus::Completed).await;
    wait_for_status(&engine, &file_id(&course, "lost"), EntryStatus::Completed).await;
    assert!(transport
        .requests()
        .contains(&(locator("active"), 40)));
    assert!(transport.requests().contains(&(locator("lost"), 0)));

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_shutdown_and_restart_resumes_from_checkpoint() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let config = test_config(&temp_dir);
    let db_path = config.get_database_path();
    let id = file_id(&course, "big");

    {
        let transport = Arc::new(MockTransport::new());
        transport.serve(&locator("big"), payload(100));
        let _gate = transport.gate_at(&locator("big"), 60);
        let source = source_with(&course, vec![file_unit("big")]);
        let store = Arc::new(SqliteEntryStore::new(&db_path).await.unwrap());
        let engine = create_engine_with(
            config.clone(),
            store,
            Arc::new(LocalDisk::new()),
            source,
            transport,
        )
        .await;

        let mut events = engine.subscribe();
        engine.start_sync(&course).await.unwrap();
        wait_for_change(&mut events, |c| c.bytes_transferred == 60)
            .await
            .unwrap();
        engine.shutdown().await.unwrap();

        let entry = engine.entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Queued);
        assert_eq!(entry.bytes_transferred, 60);
    }

    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("big"), payload(100));
    let source = source_with(&course, vec![file_unit("big")]);
    let store = Arc::new(SqliteEntryStore::new(&db_path).await.unwrap());
    let engine = create_engine_with(config, store, Arc::new(LocalDisk::new()), source, transport.clone()).await;

    let entry = wait_for_status(&engine, &id, EntryStatus::Completed).await;
    assert_eq!(entry.bytes_transferred, 100);
    assert_eq!(transport.requests(), vec![(locator("big"), 60)]);
    assert_eq!(transport.bytes_served(), 40);
    assert_eq!(
        tokio::fs::read(&entry.local_path).await.unwrap(),
        payload(100)
    );

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_empty_payload_completes_and_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let config = test_config(&temp_dir);
    let db_path = config.get_database_path();
    let id = file_id(&course, "empty");

    {
        let transport = Arc::new(MockTransport::new());
        transport.serve(&locator("empty"), Vec::new());
        let source = source_with(&course, vec![file_unit("empty")]);
        let store = Arc::new(SqliteEntryStore::new(&db_path).await.unwrap());
        let engine = create_engine_with(
            config.clone(),
            store,
            Arc::new(LocalDisk::new()),
            source,
            transport,
        )
        .await;

        let mut job = engine.start_sync(&course).await.unwrap();
        let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
        assert_eq!(outcome.completed, 1);

        let entry = engine.entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.size_bytes, Some(0));
        assert_eq!(entry.bytes_transferred, 0);
        assert_eq!(
            tokio::fs::metadata(&entry.local_path).await.unwrap().len(),
            0
        );
        engine.shutdown().await.unwrap();
    }

    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("empty"), Vec::new());
    let source = source_with(&course, vec![file_unit("empty")]);
    let store = Arc::new(SqliteEntryStore::new(&db_path).await.unwrap());
    let engine = create_engine_with(config, store, Arc::new(LocalDisk::new()), source, transport.clone()).await;

    let report = engine.recovery_report().clone();
    assert_eq!(report.invalidated, 0);
    assert_eq!(report.requeued, 0);
    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    assert_eq!(transport.fetch_count(&locator("empty")), 0);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_interrupt_fails_active_transfers() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("a"), payload(50));
    let gate = transport.gate_at(&locator("a"), 20);
    let source = source_with(&course, vec![file_unit("a")]);
    let id = file_id(&course, "a");

    let engine = create_test_engine(test_config(&temp_dir), source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    wait_for_status(&engine, &id, EntryStatus::Active).await;

    assert_eq!(engine.interrupt().await, 1);
    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.last_error.as_deref(), Some("interrupted"));
    assert_eq!(engine.halt_reason().as_deref(), Some("interrupted"));
    let outcome = timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.failed, 1);

    gate.send_replace(true);
    engine.resume_scheduling().await.unwrap();
    engine.resume(&id).await.unwrap();
    wait_for_status(&engine, &id, EntryStatus::Completed).await;

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_courses_share_the_pool_fairly() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let busy = CourseId::new("busy");
    let small = CourseId::new("small");
    let transport = Arc::new(MockTransport::new());
    let source = ManifestSource::new();

    let mut gates = Vec::new();
    let mut units = Vec::new();
    for i in 0..4 {
        let name = format!("busy-{}", i);
        transport.serve(&locator(&name), payload(40));
        gates.push(transport.gate_at(&locator(&name), 10));
        units.push(file_unit(&name));
    }
    source.set_course(busy.clone(), units);
    transport.serve(&locator("small-0"), payload(40));
    source.set_course(small.clone(), vec![file_unit("small-0")]);

    let config = test_config(&temp_dir)
        .max_concurrent_transfers(3)
        .max_transfers_per_course(2);
    let engine = create_test_engine(config, Arc::new(source), transport).await;

    let mut busy_job = engine.start_sync(&busy).await.unwrap();
    let mut small_job = engine.start_sync(&small).await.unwrap();

    // The busy course holds at most two slots, so the small one gets through
    let outcome = timeout(WAIT, small_job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 1);
    let summary = engine.summarize(&busy).await.unwrap();
    assert_eq!(summary.active_count, 2);
    assert_eq!(summary.queued_count, 2);

    for gate in &gates {
        gate.send_replace(true);
    }
    let outcome = timeout(WAIT, busy_job.wait()).await.unwrap().unwrap();
    assert_eq!(outcome.completed, 4);

    engine.shutdown().await.ok();
}

#[tokio::test]
async fn test_acknowledge_hides_completed_entries() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    transport.serve(&locator("a"), payload(10));
    let source = source_with(&course, vec![file_unit("a")]);
    let id = file_id(&course, "a");

    let engine = create_test_engine(test_config(&temp_dir), source, transport).await;
    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();

    engine.acknowledge(&id).await.unwrap();
    let entry = engine.entry(&id).await.unwrap().unwrap();
    assert!(entry.is_hidden_from_user);
    assert!(entry.local_path.exists());

    // Re-syncing an unchanged course keeps it hidden
    let mut job = engine.start_sync(&course).await.unwrap();
    timeout(WAIT, job.wait()).await.unwrap().unwrap();
    assert!(engine.entry(&id).await.unwrap().unwrap().is_hidden_from_user);

    engine.shutdown().await.ok();
}

// =============================================================================
// Event Ordering Tests
// =============================================================================

#[tokio::test]
async fn test_events_are_monotonic_per_entry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let course = CourseId::new("101");
    let transport = Arc::new(MockTransport::new());
    let mut units = Vec::new();
    for i in 0..6 {
        let name = format!("f{}", i);
        transport.serve(&locator(&name), payload(200));
        units.push(file_unit(&name));
    }
    let source = source_with(&course, units);

    let engine = create_test_engine(test_config(&temp_dir), source, transport).await;
    let mut events = engine.subscribe();
    let mut job = engine.start_sync(&course).await.unwrap();

    let mut last: HashMap<EntryId, (u64, u64)> = HashMap::new();
    let mut completed = 0;
    while completed < 6 {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event")
            .expect("bus open");
        let Some(change) = event.as_status_change() else {
            continue;
        };
        if let Some((revision, bytes)) = last.get(&change.entry_id) {
            assert!(change.revision > *revision, "stale state for {}", change.entry_id);
            if change.new_status == Some(EntryStatus::Active) {
                assert!(change.bytes_transferred >= *bytes);
            }
        }
        if let Some(size) = change.size_bytes {
            assert!(change.bytes_transferred <= size);
        }
        last.insert(
            change.entry_id.clone(),
            (change.revision, change.bytes_transferred),
        );
        if change.new_status == Some(EntryStatus::Completed) {
            completed += 1;
        }
    }
    timeout(WAIT, job.wait()).await.unwrap().unwrap();

    engine.shutdown().await.ok();
}

#[test]
fn test_progress_invariant_holds_for_random_sequences() {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let mut entry = SyncEntry::new(
            CourseId::new("1"),
            ContentKind::File,
            "r",
            "mock://r",
            "/tmp/r",
        );
        if rng.gen_bool(0.5) {
            entry.size_bytes = Some(rng.gen_range(0..1_000));
        }
        for _ in 0..50 {
            match rng.gen_range(0..3) {
                0 => entry.record_progress(rng.gen_range(0..2_000)),
                1 => entry.record_size(rng.gen_range(0..2_000)),
                _ => entry.reset_progress(),
            }
            assert!(entry.validate().is_ok(), "invariant broken: {:?}", entry);
            if let Some(size) = entry.size_bytes {
                assert!(entry.bytes_transferred <= size);
            }
        }
    }
}

#[tokio::test]
async fn test_memory_store_is_usable_directly() {
    let store = MemoryEntryStore::new();
    let course = CourseId::new("1");
    let entry = SyncEntry::new(course.clone(), ContentKind::File, "x", "mock://x", "/tmp/x");
    store.upsert(&[entry]).await.unwrap();
    assert_eq!(store.find_by_course(&course).await.unwrap().len(), 1);
}
