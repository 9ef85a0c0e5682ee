//! End-to-end reconciliation runs against the in-memory stores.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use notes_sync::{run, PollPolicy, RunStatus, SyncContext, SyncSettings};
use notes_sync_core::fingerprint::digest_bytes;
use notes_sync_core::models::{document_metadata, IndexedDocument, IndexingStatus};
use notes_sync_core::store::memory::{
    EtagMode, InMemoryIndexStore, InMemoryLockStore, InMemorySourceStore,
};
use notes_sync_core::store::LockStore;
use notes_sync_core::{ActionKind, RunPhase, SyncError};

const MARKER: &str = "notes-sync.STARTING";

struct Fixture {
    source: Arc<InMemorySourceStore>,
    index: Arc<InMemoryIndexStore>,
    lock: Arc<InMemoryLockStore>,
    ctx: SyncContext,
}

fn fast_settings() -> SyncSettings {
    let mut settings = SyncSettings::new("notes/");
    settings.concurrency = 4;
    settings.poll = PollPolicy {
        interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        backoff: 2.0,
        timeout: Duration::from_millis(300),
    };
    settings
}

fn fixture_with(etag_mode: EtagMode, index: InMemoryIndexStore, settings: SyncSettings) -> Fixture {
    let source = Arc::new(InMemorySourceStore::new(etag_mode));
    let index = Arc::new(index);
    let lock = Arc::new(InMemoryLockStore::new());
    let ctx = SyncContext::new(source.clone(), index.clone(), lock.clone(), settings);
    Fixture {
        source,
        index,
        lock,
        ctx,
    }
}

fn fixture() -> Fixture {
    fixture_with(EtagMode::SinglePart, InMemoryIndexStore::new(), fast_settings())
}

/// identifier → content hash of every document in the index.
fn index_state(index: &InMemoryIndexStore) -> BTreeMap<String, String> {
    index
        .documents()
        .iter()
        .filter_map(|d| Some((d.identifier()?.to_string(), d.content_hash()?.to_string())))
        .collect()
}

fn seed(index: &InMemoryIndexStore, resource: &str, identifier: &str, body: &[u8]) {
    index.insert(
        IndexedDocument {
            resource_name: resource.to_string(),
            display_name: identifier.to_string(),
            metadata: document_metadata(identifier, &digest_bytes(body), identifier),
            status: IndexingStatus::Active,
        },
        body,
    );
}

#[tokio::test]
async fn test_converges_and_is_idempotent() {
    let mut settings = fast_settings();
    settings.exclude =
        notes_sync::config::build_globset(&["**/*.ignore.md".to_string()]).unwrap();
    let h = fixture_with(EtagMode::SinglePart, InMemoryIndexStore::new(), settings);
    h.source.put("notes/arc-1/s1.md", b"Session one");
    h.source.put("notes/arc-1/s2.md", b"Session two");
    h.source.put("notes/npcs.md", b"Vexarion, a red dragon");
    h.source.put("notes/map.png", b"\x89PNG");
    h.source.put("notes/draft.ignore.md", b"ignored");

    let first = run(&h.ctx).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.uploaded, vec!["arc-1/s1.md", "arc-1/s2.md", "npcs.md"]);

    let expected: BTreeMap<String, String> = [
        ("arc-1/s1.md", b"Session one".as_slice()),
        ("arc-1/s2.md", b"Session two".as_slice()),
        ("npcs.md", b"Vexarion, a red dragon".as_slice()),
    ]
    .into_iter()
    .map(|(id, body)| (id.to_string(), digest_bytes(body)))
    .collect();
    assert_eq!(index_state(&h.index), expected);

    let before = h.index.call_counts();
    let second = run(&h.ctx).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.mutations(), 0);
    assert_eq!(second.skipped, 3);
    let after = h.index.call_counts();
    assert_eq!(after.uploads, before.uploads);
    assert_eq!(after.deletes, before.deletes);
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_scenario_a_new_note_is_uploaded() {
    let h = fixture();
    h.source.put("notes/a.md", b"h1 content");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.uploaded, vec!["a.md"]);
    assert_eq!(
        index_state(&h.index),
        BTreeMap::from([("a.md".to_string(), digest_bytes(b"h1 content"))])
    );
}

#[tokio::test]
async fn test_scenario_b_changed_note_is_replaced() {
    let h = fixture();
    seed(&h.index, "r1", "a.md", b"old text");
    h.source.put("notes/a.md", b"new text");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.replaced, vec!["a.md"]);
    let docs = h.index.documents();
    assert_eq!(docs.len(), 1);
    assert_ne!(docs[0].resource_name, "r1");
    assert_eq!(docs[0].content_hash(), Some(digest_bytes(b"new text").as_str()));
    assert_eq!(h.index.body_of(&docs[0].resource_name).unwrap(), b"new text");
}

#[tokio::test]
async fn test_scenario_c_removed_note_is_deleted() {
    let h = fixture();
    seed(&h.index, "r2", "b.md", b"gone");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.deleted, vec!["b.md"]);
    assert!(h.index.documents().is_empty());
}

#[tokio::test]
async fn test_scenario_d_concurrent_run_is_skipped() {
    let mut settings = fast_settings();
    settings.poll.timeout = Duration::from_millis(500);
    let h = fixture_with(EtagMode::SinglePart, InMemoryIndexStore::new(), settings);
    h.source.put("notes/a.md", b"slow to index");
    h.index.stall_indexing_of("a.md");

    let first_ctx = h.ctx.clone();
    let first = tokio::spawn(async move { run(&first_ctx).await });

    while !h.lock.is_held(MARKER) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let second = run(&h.ctx).await.unwrap();
    assert_eq!(second.status, RunStatus::SkippedAlreadyRunning);
    assert_eq!(second.mutations(), 0);
    assert!(h.lock.is_held(MARKER), "the skipped run must not release the lock");

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::CompletedWithFailures);
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_held_lock_means_no_store_calls() {
    let h = fixture();
    h.source.put("notes/a.md", b"x");
    h.lock.create(MARKER).await.unwrap();

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.status, RunStatus::SkippedAlreadyRunning);
    assert_eq!(h.index.call_counts().uploads, 0);
    assert_eq!(h.source.open_count(), 0);
    assert!(h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_replace_keeps_old_copy_when_delete_fails() {
    let h = fixture();
    seed(&h.index, "r1", "a.md", b"old");
    h.source.put("notes/a.md", b"new");
    h.index.fail_delete_of("r1");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].identifier, "a.md");
    assert_eq!(report.failures[0].action, ActionKind::Replace);
    assert_eq!(report.failures[0].kind, "delete");
    assert_eq!(h.index.call_counts().uploads, 0);
    assert_eq!(
        index_state(&h.index),
        BTreeMap::from([("a.md".to_string(), digest_bytes(b"old"))])
    );
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_partial_failures_do_not_stop_the_run() {
    let h = fixture();
    h.source.put("notes/ok.md", b"fine");
    h.source.put("notes/rejected.md", b"nope");
    h.source.put("notes/broken.md", b"bad");
    h.source.put("notes/slow.md", b"zzz");
    h.index.reject_upload_of("rejected.md");
    h.index.fail_indexing_of("broken.md");
    h.index.stall_indexing_of("slow.md");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.uploaded, vec!["ok.md"]);
    let kinds: Vec<(&str, &str)> = report
        .failures
        .iter()
        .map(|f| (f.identifier.as_str(), f.kind.as_str()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("broken.md", "indexing"),
            ("rejected.md", "upload"),
            ("slow.md", "indexing_timeout"),
        ]
    );
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_index_outage_aborts_and_releases_lock() {
    let h = fixture();
    h.source.put("notes/a.md", b"x");
    h.index.set_list_fails(true);

    let err = run(&h.ctx).await.unwrap_err();

    match err {
        SyncError::Aborted { phase, source } => {
            assert_eq!(phase, RunPhase::Scanning);
            assert!(matches!(*source, SyncError::IndexUnavailable(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.index.call_counts().uploads, 0);
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_source_outage_never_deletes_the_index() {
    let h = fixture();
    seed(&h.index, "r1", "a.md", b"keep me");
    h.source.set_list_fails(true);

    let err = run(&h.ctx).await.unwrap_err();

    assert!(matches!(
        err,
        SyncError::Aborted { ref source, .. } if matches!(**source, SyncError::SourceUnavailable(_))
    ));
    assert_eq!(h.index.call_counts().deletes, 0);
    assert_eq!(h.index.documents().len(), 1);
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_lock_store_outage_aborts_before_scanning() {
    let h = fixture();
    h.source.put("notes/a.md", b"x");
    h.lock.set_unavailable(true);

    let err = run(&h.ctx).await.unwrap_err();

    match err {
        SyncError::Aborted { phase, source } => {
            assert_eq!(phase, RunPhase::Idle);
            assert!(matches!(*source, SyncError::Lock(_)), "{:?}", source);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.source.open_count(), 0);
    assert_eq!(h.index.call_counts().uploads, 0);
}

#[tokio::test]
async fn test_run_timeout_aborts_and_releases_lock() {
    let mut settings = fast_settings();
    settings.poll.timeout = Duration::from_secs(60);
    settings.run_timeout = Some(Duration::from_millis(100));
    let h = fixture_with(EtagMode::SinglePart, InMemoryIndexStore::new(), settings);
    h.source.put("notes/a.md", b"never indexed");
    h.index.stall_indexing_of("a.md");

    let err = run(&h.ctx).await.unwrap_err();

    match err {
        SyncError::Aborted { phase, source } => {
            assert_eq!(phase, RunPhase::Applying);
            assert!(matches!(*source, SyncError::RunTimeout(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_unreadable_note_is_reported_and_kept() {
    let h = fixture();
    seed(&h.index, "r1", "a.md", b"indexed earlier");
    h.source.put("notes/a.md", b"indexed earlier, now edited");
    h.source.put("notes/b.md", b"fine");
    h.source.fail_reads_for("notes/a.md");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.scan_failures.len(), 1);
    assert_eq!(report.scan_failures[0].identifier, "a.md");
    assert!(report.deleted.is_empty());
    assert_eq!(report.uploaded, vec!["b.md"]);
    assert!(h.index.documents().iter().any(|d| d.resource_name == "r1"));
}

#[tokio::test]
async fn test_unlistable_entries_do_not_abort_or_delete() {
    let h = fixture();
    seed(&h.index, "r1", "a.md", b"dangling now");
    seed(&h.index, "r2", "arc-2/s1.md", b"behind a locked directory");
    seed(&h.index, "r3", "c.md", b"really removed");
    h.source.put("notes/a.md", b"dangling now");
    h.source.put("notes/arc-2/s1.md", b"behind a locked directory");
    h.source.put("notes/b.md", b"readable");
    h.source.fail_listing_of("notes/a.md", false);
    h.source.fail_listing_of("notes/arc-2", true);

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    let failed: Vec<_> = report
        .scan_failures
        .iter()
        .map(|f| f.identifier.as_str())
        .collect();
    assert_eq!(failed, vec!["a.md", "arc-2/"]);
    assert_eq!(report.uploaded, vec!["b.md"]);
    assert_eq!(report.deleted, vec!["c.md"]);

    let remaining: Vec<_> = h
        .index
        .documents()
        .iter()
        .map(|d| d.resource_name.clone())
        .collect();
    assert!(remaining.contains(&"r1".to_string()));
    assert!(remaining.contains(&"r2".to_string()));
    assert!(!remaining.contains(&"r3".to_string()));
}

#[tokio::test]
async fn test_listing_etags_skip_metadata_lookups() {
    let h = fixture();
    h.source.set_listing_etags(true);
    h.source.put("notes/a.md", b"one");
    h.source.put("notes/b.md", b"two");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.uploaded, vec!["a.md", "b.md"]);
    assert_eq!(h.source.metadata_count(), 0);
}

#[tokio::test]
async fn test_lock_release_failure_fails_a_completed_run() {
    let h = fixture();
    h.source.put("notes/a.md", b"uploaded before the release failed");
    h.lock.set_remove_fails(true);

    let err = run(&h.ctx).await.unwrap_err();

    assert!(matches!(err, SyncError::Lock(_)), "{:?}", err);
    assert_eq!(index_state(&h.index).len(), 1);
    assert!(h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_lock_release_failure_keeps_the_abort_reason() {
    let h = fixture();
    h.source.set_list_fails(true);
    h.lock.set_remove_fails(true);

    let err = run(&h.ctx).await.unwrap_err();

    match err {
        SyncError::Aborted { phase, source } => {
            assert_eq!(phase, RunPhase::Scanning);
            assert!(matches!(*source, SyncError::SourceUnavailable(_)), "{:?}", source);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.lock.is_held(MARKER));
}

#[tokio::test]
async fn test_duplicates_and_failed_documents_are_cleaned_up() {
    let h = fixture();
    h.source.put("notes/a.md", b"same");
    h.source.put("notes/b.md", b"retry me");
    seed(&h.index, "documents/1", "a.md", b"same");
    seed(&h.index, "documents/2", "a.md", b"same");
    h.index.insert(
        IndexedDocument {
            resource_name: "documents/3".into(),
            display_name: "b.md".into(),
            metadata: document_metadata("b.md", &digest_bytes(b"retry me"), "notes/b.md"),
            status: IndexingStatus::Failed,
        },
        b"retry me",
    );

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.duplicates_removed, vec!["documents/2"]);
    assert_eq!(report.failed_removed, vec!["documents/3"]);
    assert_eq!(report.uploaded, vec!["b.md"]);
    assert_eq!(report.skipped, 1);

    let docs = h.index.documents();
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().all(|d| d.status == IndexingStatus::Active));
}

#[tokio::test]
async fn test_documents_without_metadata_are_untouched() {
    let h = fixture();
    h.index.insert(
        IndexedDocument {
            resource_name: "documents/manual".into(),
            display_name: "uploaded by hand".into(),
            metadata: BTreeMap::new(),
            status: IndexingStatus::Active,
        },
        b"manual",
    );

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(h.index.documents().len(), 1);
}

#[tokio::test]
async fn test_multipart_etags_are_streamed() {
    let h = fixture_with(EtagMode::Multipart, InMemoryIndexStore::new(), fast_settings());
    h.source.put("notes/a.md", b"big note");

    let report = run(&h.ctx).await.unwrap();
    assert_eq!(report.uploaded, vec!["a.md"]);
    // One open to fingerprint, one to upload.
    assert_eq!(h.source.open_count(), 2);
    assert_eq!(
        index_state(&h.index)["a.md"],
        digest_bytes(b"big note")
    );

    // An unchanged note hashes the same on the next run.
    let again = run(&h.ctx).await.unwrap();
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn test_scratch_files_are_removed() {
    let scratch = tempfile::tempdir().unwrap();
    let mut settings = fast_settings();
    settings.scratch_dir = Some(scratch.path().to_path_buf());
    let h = fixture_with(
        EtagMode::SinglePart,
        InMemoryIndexStore::requiring_local_file(),
        settings,
    );
    h.source.put("notes/a.md", b"one");
    h.source.put("notes/b.md", b"two");
    h.source.put("notes/c.md", b"three");
    h.index.reject_upload_of("b.md");
    h.index.fail_indexing_of("c.md");

    let report = run(&h.ctx).await.unwrap();

    assert_eq!(report.uploaded, vec!["a.md"]);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}
