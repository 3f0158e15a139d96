// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the message handler against an in-memory repository.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{RecordingNotifier, Seen, TestWorld, job, recording_extractor, terminal};
use extractor_repository::{DatasetRecord, FileRecord, MockUpload};
use extractor_worker::handler::{HandlerError, MessageHandler};
use extractor_worker::mount::{MountEntry, MountTable};
use extractor_worker::outbox::{ControlMessage, JobStatus, Outbox};
use extractor_worker::resolver::upload_to_dataset;
use extractor_worker::retry::Verdict;
use extractor_worker::{Decision, Extractor, ExtractorInfo, ProcessError, ResourceKind};
use serde_json::json;

fn statuses(messages: &[ControlMessage]) -> Vec<JobStatus> {
    messages
        .iter()
        .filter_map(|m| match m {
            ControlMessage::Status(update) => Some(update.status),
            _ => None,
        })
        .collect()
}

fn status_text(messages: &[ControlMessage], status: JobStatus) -> String {
    messages
        .iter()
        .find_map(|m| match m {
            ControlMessage::Status(update) if update.status == status => {
                Some(update.message.clone())
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Extractor whose Process always fails with `error`. Inputs are not
/// staged.
fn failing_extractor(calls: Arc<AtomicUsize>, error: fn() -> ProcessError) -> Extractor {
    Extractor::new(ExtractorInfo::new("failing"), move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(error())
    })
    .with_check(|_, _| Decision::Bypass)
}

fn bypassing_extractor(name: &str, seen: &Seen) -> Extractor {
    recording_extractor(name, seen).with_check(|_, _| Decision::Bypass)
}

// ============================================================================
// Download path
// ============================================================================

#[tokio::test]
async fn test_file_is_downloaded_processed_and_cleaned_up() {
    let world = TestWorld::new();
    world
        .repository
        .add_file(FileRecord::new("f1", "a.tif"), b"pixels".to_vec());
    let seen = Seen::default();
    let context = world.context(recording_extractor("wordcount", &seen));

    let outbox = Outbox::new();
    let verdict = MessageHandler::new(
        context,
        job(json!({
            "id": "f1",
            "datasetId": "d1",
            "routing_key": "*.file.added",
            "filename": "a.tif"
        })),
        outbox.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    let resource = seen.only();
    assert_eq!(resource.kind, ResourceKind::File);
    assert_eq!(resource.file_ext, ".tif");
    assert_eq!(resource.parent.as_ref().unwrap().id, "d1");
    assert_eq!(resource.local_paths.len(), 1);
    assert!(resource.local_paths[0].to_string_lossy().ends_with(".tif"));
    assert_eq!(seen.present(), 1);

    // Staged temporaries are gone once the handler returns.
    assert!(!resource.local_paths[0].exists());
    assert_eq!(world.staged_entries(), 0);

    let messages = outbox.drain();
    assert_eq!(
        statuses(&messages),
        vec![JobStatus::Started, JobStatus::Processing, JobStatus::Succeeded]
    );
    assert_eq!(status_text(&messages, JobStatus::Succeeded), "Done.");
    assert_eq!(terminal(&messages), ControlMessage::Ok);
    assert_eq!(messages.last(), Some(&ControlMessage::Ok));
}

#[tokio::test]
async fn test_file_name_is_looked_up_when_missing() {
    let world = TestWorld::new();
    world
        .repository
        .add_file(FileRecord::new("f1", "scan.png"), b"png".to_vec());
    let seen = Seen::default();
    let context = world.context(recording_extractor("wordcount", &seen));

    MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "clowder.file.added"})),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    let resource = seen.only();
    assert_eq!(resource.name, "scan.png");
    assert_eq!(resource.file_ext, ".png");
    assert!(resource.parent.is_none());
}

#[tokio::test]
async fn test_mounted_file_is_used_in_place_and_kept() {
    let mount_root = tempfile::tempdir().unwrap();
    let local = mount_root.path().join("ab/f1.tif");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"pixels").unwrap();

    let mut world = TestWorld::new();
    world.mounts = MountTable::new(vec![MountEntry::new(
        "/srv/data",
        mount_root.path().to_string_lossy(),
    )]);
    world.repository.add_file(
        FileRecord::new("f1", "a.tif").with_filepath("/srv/data/ab/f1.tif"),
        b"pixels".to_vec(),
    );
    let seen = Seen::default();
    let context = world.context(recording_extractor("wordcount", &seen));

    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.tif"})),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    assert_eq!(seen.only().local_paths, vec![local.clone()]);
    assert!(local.exists());
    assert_eq!(world.repository.call_count("download_file"), 0);
}

#[tokio::test]
async fn test_unmounted_path_is_downloaded_even_if_present() {
    let elsewhere = tempfile::tempdir().unwrap();
    let blob = elsewhere.path().join("blob-0001");
    std::fs::write(&blob, b"pixels").unwrap();

    let world = TestWorld::new();
    world.repository.add_file(
        FileRecord::new("f1", "a.tif").with_filepath(blob.to_string_lossy()),
        b"pixels".to_vec(),
    );
    let seen = Seen::default();
    let context = world.context(recording_extractor("wordcount", &seen));

    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.tif"})),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    let resource = seen.only();
    assert_eq!(resource.local_paths.len(), 1);
    let staged = &resource.local_paths[0];
    assert_ne!(staged, &blob);
    assert!(staged.starts_with(world.staging.path()));
    assert!(staged.to_string_lossy().ends_with(".tif"));
    assert_eq!(world.repository.call_count("download_file"), 1);

    assert!(!staged.exists());
    assert!(blob.exists());
}

// ============================================================================
// Check decisions
// ============================================================================

#[tokio::test]
async fn test_ignore_skips_processing() {
    let world = TestWorld::new();
    let seen = Seen::default();
    let extractor = recording_extractor("wordcount", &seen).with_check(|_, _| Decision::Ignore);
    let context = world.context(extractor);

    let outbox = Outbox::new();
    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.tif"})),
        outbox.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    assert!(seen.all().is_empty());
    assert_eq!(world.repository.call_count("download_file"), 0);

    let messages = outbox.drain();
    assert_eq!(statuses(&messages), vec![JobStatus::Started, JobStatus::Skipped]);
    assert_eq!(terminal(&messages), ControlMessage::Ok);
}

#[tokio::test]
async fn test_bypass_processes_without_staging() {
    let world = TestWorld::new();
    let seen = Seen::default();
    let extractor = recording_extractor("wordcount", &seen).with_check(|resource, _| {
        if resource.file_ext == ".tif" {
            Decision::Bypass
        } else {
            Decision::Ignore
        }
    });
    let context = world.context(extractor);

    let outbox = Outbox::new();
    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.tif"})),
        outbox.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    assert!(seen.only().local_paths.is_empty());
    assert!(world.repository.calls().is_empty());
    assert_eq!(
        statuses(&outbox.drain()),
        vec![JobStatus::Started, JobStatus::Succeeded]
    );
}

#[tokio::test]
async fn test_metadata_message_is_processed_without_inputs() {
    let world = TestWorld::new();
    let seen = Seen::default();
    let context = world.context(recording_extractor("tagger", &seen));

    let verdict = MessageHandler::new(
        context,
        job(json!({
            "id": "f7",
            "routing_key": "clowder.metadata.added",
            "resourceType": "file",
            "metadata": {"tag": "x"}
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    let resource = seen.only();
    assert_eq!(resource.kind, ResourceKind::Metadata);
    assert!(resource.local_paths.is_empty());
    assert_eq!(resource.metadata, Some(json!({"tag": "x"})));
}

// ============================================================================
// Failure classification
// ============================================================================

#[tokio::test]
async fn test_unclassified_failure_resubmits_until_budget_is_spent() {
    let mut world = TestWorld::new();
    world.max_retry = 2;
    let calls = Arc::new(AtomicUsize::new(0));
    let context = world.context(failing_extractor(calls.clone(), || {
        ProcessError::other("flaky backend")
    }));

    let mut terminals = Vec::new();
    for retry_count in 0..3 {
        let outbox = Outbox::new();
        let verdict = MessageHandler::new(
            context.clone(),
            job(json!({
                "id": "f1",
                "routing_key": "*.file.added",
                "filename": "a.txt",
                "retry_count": retry_count
            })),
            outbox.clone(),
        )
        .run()
        .await
        .unwrap();
        terminals.push((verdict, terminal(&outbox.drain())));
    }

    assert_eq!(
        terminals,
        vec![
            (
                Verdict::Resubmit { retry_count: 1 },
                ControlMessage::Resubmit { retry_count: 1 }
            ),
            (
                Verdict::Resubmit { retry_count: 2 },
                ControlMessage::Resubmit { retry_count: 2 }
            ),
            (Verdict::Error, ControlMessage::Error),
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_abort_goes_straight_to_error() {
    let world = TestWorld::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let context = world.context(failing_extractor(calls.clone(), || {
        ProcessError::Abort("corrupt input".to_string())
    }));

    let outbox = Outbox::new();
    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.txt"})),
        outbox.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Error);
    let messages = outbox.drain();
    assert_eq!(terminal(&messages), ControlMessage::Error);
    assert!(status_text(&messages, JobStatus::Error).contains("corrupt input"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_interrupt_resubmits_with_same_count_and_fails_handler() {
    let world = TestWorld::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let context = world.context(failing_extractor(calls, || {
        ProcessError::Interrupted("SIGTERM".to_string())
    }));

    let outbox = Outbox::new();
    let result = MessageHandler::new(
        context,
        job(json!({
            "id": "f1",
            "routing_key": "*.file.added",
            "filename": "a.txt",
            "retry_count": 4
        })),
        outbox.clone(),
    )
    .run()
    .await;

    assert!(matches!(result, Err(HandlerError::Interrupted(_))));
    let messages = outbox.drain();
    assert_eq!(terminal(&messages), ControlMessage::Resubmit { retry_count: 4 });
    assert_eq!(statuses(&messages).last(), Some(&JobStatus::Resubmitted));
}

#[tokio::test]
async fn test_panicking_process_is_retryable() {
    let world = TestWorld::new();
    let extractor = Extractor::new(ExtractorInfo::new("x"), |_, _| panic!("bug in extractor"))
        .with_check(|_, _| Decision::Bypass);
    let context = world.context(extractor);

    let outbox = Outbox::new();
    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.txt"})),
        outbox.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Resubmit { retry_count: 1 });
}

#[tokio::test]
async fn test_missing_dataset_is_an_error_without_processing() {
    let world = TestWorld::new();
    let seen = Seen::default();
    let context = world.context(recording_extractor("wordcount", &seen));

    let outbox = Outbox::new();
    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "d404", "routing_key": "*.dataset.file.added"})),
        outbox.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Error);
    assert!(seen.all().is_empty());
    let messages = outbox.drain();
    assert_eq!(statuses(&messages), vec![JobStatus::Started, JobStatus::Error]);
    assert_eq!(terminal(&messages), ControlMessage::Error);
}

#[tokio::test]
async fn test_staging_failure_is_retryable_and_cleans_up() {
    let world = TestWorld::new();
    let seen = Seen::default();
    let context = world.context(recording_extractor("wordcount", &seen));

    // f1 is unknown to the repository: staging fails after enrichment.
    let verdict = MessageHandler::new(
        context,
        job(json!({"id": "f1", "routing_key": "*.file.added", "filename": "a.tif"})),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Resubmit { retry_count: 1 });
    assert!(seen.all().is_empty());
    assert_eq!(world.staged_entries(), 0);
}

// ============================================================================
// Datasets and notifications
// ============================================================================

#[tokio::test]
async fn test_dataset_message_enriches_resource() {
    let world = TestWorld::new();
    world
        .repository
        .add_file(FileRecord::new("f1", "a.txt"), b"one".to_vec());
    world
        .repository
        .add_file(FileRecord::new("f2", "b.txt"), b"two".to_vec());
    world
        .repository
        .add_dataset(DatasetRecord::new("d1", "survey"), &["f1", "f2"]);
    let seen = Seen::default();
    let context = world.context(recording_extractor("zipper", &seen));

    let verdict = MessageHandler::new(
        context,
        job(json!({
            "id": "f2",
            "datasetId": "d1",
            "filename": "b.txt",
            "routing_key": "clowder.dataset.file.added"
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    let resource = seen.only();
    assert_eq!(resource.kind, ResourceKind::Dataset);
    assert_eq!(resource.id, "d1");
    assert_eq!(resource.name, "survey");
    assert_eq!(resource.files.len(), 2);
    assert_eq!(resource.triggering_file.as_deref(), Some("b.txt"));
    assert_eq!(resource.local_paths.len(), 2);
    assert_eq!(world.repository.call_count("download_dataset"), 1);
}

#[tokio::test]
async fn test_success_notifies_recipients() {
    let world = TestWorld::new();
    let seen = Seen::default();
    let context = world.context(bypassing_extractor("wordcount", &seen));

    MessageHandler::new(
        context,
        job(json!({
            "id": "f1",
            "routing_key": "*.file.added",
            "filename": "a.tif",
            "host": "https://repo.example.org/",
            "notifies": ["owner@example.org"]
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    let notices = world.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].recipients, vec!["owner@example.org".to_string()]);
    assert_eq!(notices[0].subject, "[wordcount] a.tif processed");
    assert!(
        notices[0]
            .body
            .contains("https://repo.example.org/files/f1")
    );
}

#[tokio::test]
async fn test_notification_failure_does_not_change_outcome() {
    let world = TestWorld::with_notifier(RecordingNotifier::failing());
    let seen = Seen::default();
    let context = world.context(bypassing_extractor("wordcount", &seen));

    let verdict = MessageHandler::new(
        context,
        job(json!({
            "id": "f1",
            "routing_key": "*.file.added",
            "filename": "a.tif",
            "notifies": ["owner@example.org"]
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    assert_eq!(world.notifier.notices().len(), 1);
}

#[tokio::test]
async fn test_failure_sends_no_notice() {
    let world = TestWorld::new();
    let context = world.context(failing_extractor(Arc::default(), || {
        ProcessError::Abort("no".to_string())
    }));

    MessageHandler::new(
        context,
        job(json!({
            "id": "f1",
            "routing_key": "*.file.added",
            "filename": "a.tif",
            "notifies": ["owner@example.org"]
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert!(world.notifier.notices().is_empty());
}

// ============================================================================
// Host override
// ============================================================================

#[tokio::test]
async fn test_host_override_reaches_process() {
    let mut world = TestWorld::new();
    world.host_override = Some("https://override.internal".to_string());
    let hosts = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = hosts.clone();
    let extractor = Extractor::new(ExtractorInfo::new("wordcount"), move |_, descriptor| {
        recorded.lock().unwrap().push(descriptor.host.clone());
        Ok(())
    })
    .with_check(|_, _| Decision::Bypass);

    let verdict = MessageHandler::new(
        world.context(extractor),
        job(json!({
            "id": "f1",
            "host": "http://stale-host",
            "routing_key": "*.file.added",
            "filename": "a.tif"
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    assert_eq!(*hosts.lock().unwrap(), vec!["https://override.internal".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_uploads_mounted_output_by_reference() {
    let mount_root = tempfile::tempdir().unwrap();
    let output = mount_root.path().join("summary.csv");
    std::fs::write(&output, "words,3\n").unwrap();

    let mut world = TestWorld::new();
    world.host_override = Some("https://override.internal".to_string());
    world.mounts = MountTable::new(vec![MountEntry::new(
        "/srv/data",
        mount_root.path().to_string_lossy(),
    )]);
    world
        .repository
        .add_dataset(DatasetRecord::new("d1", "survey"), &[]);

    let repository = world.repository.clone();
    let mounts = world.mounts.clone();
    let extractor = Extractor::new(ExtractorInfo::new("wordcount"), move |_, descriptor| {
        let endpoint = descriptor.endpoint(None);
        assert_eq!(endpoint.host, "https://override.internal");
        tokio::runtime::Handle::current()
            .block_on(upload_to_dataset(
                repository.as_ref(),
                &mounts,
                &endpoint,
                "d1",
                &output,
            ))
            .map(|_| ())
            .map_err(ProcessError::other)
    })
    .with_check(|_, _| Decision::Bypass);

    let verdict = MessageHandler::new(
        world.context(extractor),
        job(json!({
            "id": "f1",
            "datasetId": "d1",
            "host": "http://stale-host",
            "routing_key": "*.file.added",
            "filename": "a.txt"
        })),
        Outbox::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(verdict, Verdict::Ok);
    assert_eq!(
        world.repository.uploads(),
        vec![MockUpload::Reference {
            dataset_id: "d1".to_string(),
            remote_path: "/srv/data/summary.csv".to_string(),
        }]
    );
}
