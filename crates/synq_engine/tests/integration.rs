//! End-to-end engine scenarios driven through the facade against the
//! in-memory adapters.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synq_engine::{
    ChangeDetail, ChangeOrigin, DataMigration, FieldMap, LocalAdapter, MutationOptions,
    OperationKind, RemoteAdapter, SyncEvent, SyncMiddleware, SyncObserver, SyncOptions,
    SyncRequest, SyncScope, SynqConfig, SynqError, SynqManager, SynqResult, UserSwitchStrategy,
};
use synq_testkit::{MemoryLocalAdapter, MemoryRemoteAdapter, Note};

type NoteManager = SynqManager<Note, MemoryLocalAdapter<Note>, MemoryRemoteAdapter<Note>>;

struct Harness {
    manager: Arc<NoteManager>,
    local: Arc<MemoryLocalAdapter<Note>>,
    remote: Arc<MemoryRemoteAdapter<Note>>,
}

/// Builds a manager over fresh in-memory adapters and keeps shared handles
/// to both for assertions.
async fn harness(config: SynqConfig<Note>) -> Harness {
    harness_from(config, MemoryLocalAdapter::new(), MemoryRemoteAdapter::new()).await
}

async fn harness_from(
    config: SynqConfig<Note>,
    local: MemoryLocalAdapter<Note>,
    remote: MemoryRemoteAdapter<Note>,
) -> Harness {
    let manager = SynqManager::new(config, local, remote).unwrap();
    manager.initialize().await.unwrap();
    let local = manager.local_adapter();
    let remote = manager.remote_adapter();
    Harness {
        manager,
        local,
        remote,
    }
}

fn fast_config() -> SynqConfig<Note> {
    SynqConfig::new().with_retry_delay(Duration::ZERO)
}

fn ts(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

// === Scenario 1: single create roundtrip ===

#[tokio::test]
async fn single_create_roundtrip() {
    let h = harness(fast_config()).await;
    let note = Note::new("e1", "u1", "A", "body").at(ts(0));

    h.manager.save(note.clone(), "u1").await.unwrap();
    let report = h.manager.sync("u1").await.unwrap();

    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);
    assert!(!report.was_cancelled);
    assert!(h.manager.pending_operations("u1").await.unwrap().is_empty());

    let remote_copy = h.remote.fetch_by_id("e1", "u1").await.unwrap().unwrap();
    assert_eq!(remote_copy.title, "A");
    assert!(synq_engine::equivalent(&note, &remote_copy));
}

// === Scenario 2: last-write-wins conflict ===

#[tokio::test]
async fn last_write_wins_prefers_newer_remote() {
    let h = harness(fast_config()).await;

    let local = Note::new("e1", "u1", "Local", "body").at(ts(0));
    h.manager
        .save_with(local, "u1", MutationOptions::from_origin(ChangeOrigin::Remote))
        .await
        .unwrap();

    let mut remote = Note::new("e1", "u1", "Remote", "body").at(ts(10));
    remote.version = 2;
    h.remote.seed(remote);

    let report = h.manager.sync("u1").await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);

    let stored = h.manager.get("e1", "u1").await.unwrap().unwrap();
    assert_eq!(stored.title, "Remote");

    let stats = h.manager.statistics();
    assert_eq!(stats.conflicts_detected, 1);
    assert_eq!(stats.conflicts_auto_resolved, 1);
}

#[tokio::test]
async fn last_write_wins_pushes_newer_local() {
    let h = harness(fast_config()).await;

    let local = Note::new("e1", "u1", "Local", "body").at(ts(10));
    h.manager
        .save_with(local, "u1", MutationOptions::from_origin(ChangeOrigin::Remote))
        .await
        .unwrap();

    let mut remote = Note::new("e1", "u1", "Remote", "body").at(ts(0));
    remote.version = 2;
    h.remote.seed(remote);

    let report = h.manager.sync("u1").await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);

    // Local won and was pushed to the remote.
    let stored = h.manager.get("e1", "u1").await.unwrap().unwrap();
    assert_eq!(stored.title, "Local");
    let remote_copy = h.remote.fetch_by_id("e1", "u1").await.unwrap().unwrap();
    assert_eq!(remote_copy.title, "Local");
}

// === Scenario 3: retryable failure then recovery ===

#[tokio::test]
async fn retryable_failure_then_recovery() {
    let h = harness(fast_config().with_max_retries(1)).await;

    h.manager
        .save(Note::new("e1", "u1", "A", "body"), "u1")
        .await
        .unwrap();
    h.remote.fail_next_pushes(1);

    let first = h.manager.sync("u1").await.unwrap();
    assert_eq!(first.synced, 0);
    let pending = h.manager.pending_operations("u1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);

    let second = h.manager.sync("u1").await.unwrap();
    assert_eq!(second.synced, 1);
    assert!(h.manager.pending_operations("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_as_failed() {
    let h = harness(fast_config().with_max_retries(1)).await;

    h.manager
        .save(Note::new("e1", "u1", "A", "body"), "u1")
        .await
        .unwrap();
    h.remote.fail_next_pushes(3);

    let first = h.manager.sync("u1").await.unwrap();
    assert_eq!(first.failed, 0); // requeued, not failed yet

    let second = h.manager.sync("u1").await.unwrap();
    assert_eq!(second.failed, 1);
    assert!(!second.errors.is_empty());

    // The operation is never lost: it stays queued at its retry cap.
    let pending = h.manager.pending_operations("u1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
}

// === Scenario 4: external change dedup ===

#[derive(Default)]
struct CountingObserver {
    external_changes: AtomicU32,
    switch_ends: parking_lot::Mutex<Vec<bool>>,
}

#[async_trait]
impl SyncObserver<Note> for CountingObserver {
    async fn on_external_change(&self, _change: &ChangeDetail<Note>) -> SynqResult<()> {
        self.external_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_user_switch_end(
        &self,
        _from: Option<&str>,
        _to: &str,
        success: bool,
    ) -> SynqResult<()> {
        self.switch_ends.lock().push(success);
        Ok(())
    }
}

#[tokio::test]
async fn external_change_applied_once_observed_twice() {
    let h = harness(fast_config()).await;
    let observer = Arc::new(CountingObserver::default());
    h.manager.register_observer(observer.clone());

    let entity = Note::new("e1", "u1", "A", "body").at(ts(0));
    let change = ChangeDetail::create("u1", entity, ts(0));

    let saves_before = h.local.save_call_count();
    h.manager
        .ingest_external_change(change.clone(), ChangeOrigin::Remote)
        .await
        .unwrap();
    h.manager
        .ingest_external_change(change, ChangeOrigin::Remote)
        .await
        .unwrap();

    // Observer saw both deliveries; storage saw one write; nothing queued.
    assert_eq!(observer.external_changes.load(Ordering::SeqCst), 2);
    assert_eq!(h.local.save_call_count() - saves_before, 1);
    assert!(h.manager.pending_operations("u1").await.unwrap().is_empty());
    assert!(h.manager.get("e1", "u1").await.unwrap().is_some());
}

#[tokio::test]
async fn external_change_matching_pending_operation_is_skipped() {
    let h = harness(fast_config()).await;

    let note = Note::new("e1", "u1", "A", "body").at(ts(0));
    h.manager.save(note.clone(), "u1").await.unwrap(); // queues a create

    let saves_before = h.local.save_call_count();
    let change = ChangeDetail::create("u1", note, ts(0));
    h.manager
        .ingest_external_change(change, ChangeOrigin::Local)
        .await
        .unwrap();

    // The echo of our own queued create does not write or enqueue again.
    assert_eq!(h.local.save_call_count(), saves_before);
    assert_eq!(h.manager.pending_operations("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn external_delete_of_absent_entity_is_skipped() {
    let h = harness(fast_config()).await;
    let deletes_before = h.local.delete_call_count();

    let change: ChangeDetail<Note> = ChangeDetail::delete("u1", "ghost", ts(0));
    h.manager
        .ingest_external_change(change, ChangeOrigin::Remote)
        .await
        .unwrap();

    assert_eq!(h.local.delete_call_count(), deletes_before);
}

// === Scenario 5: scoped pull preserves out-of-scope and local-only items ===

#[tokio::test]
async fn scoped_pull_is_partial_and_never_deletes() {
    let h = harness(fast_config()).await;
    h.remote.set_scope_filter(|scope, note: &Note| {
        scope.name == "recent" && note.title == "in-scope"
    });

    h.remote.seed(Note::new("r1", "u1", "in-scope", "b").at(ts(0)));
    h.remote.seed(Note::new("r2", "u1", "out-of-scope", "b").at(ts(0)));

    // A third, local-only item that the remote does not know.
    h.manager
        .save_with(
            Note::new("l1", "u1", "local-item", "b").at(ts(0)),
            "u1",
            MutationOptions::from_origin(ChangeOrigin::Remote),
        )
        .await
        .unwrap();

    let report = h
        .manager
        .sync_with("u1", SyncRequest::new().with_scope(SyncScope::named("recent")))
        .await
        .unwrap();
    assert_eq!(report.failed, 0);

    // In-scope item arrived, out-of-scope did not, local item survived.
    assert!(h.manager.get("r1", "u1").await.unwrap().is_some());
    assert!(h.manager.get("r2", "u1").await.unwrap().is_none());
    assert!(h.manager.get("l1", "u1").await.unwrap().is_some());
}

#[tokio::test]
async fn full_sync_deletes_unknown_non_pending_locals() {
    let h = harness(fast_config()).await;

    h.remote.seed(Note::new("r1", "u1", "remote", "b").at(ts(0)));
    h.manager
        .save_with(
            Note::new("stale", "u1", "stale", "b").at(ts(0)),
            "u1",
            MutationOptions::from_origin(ChangeOrigin::Remote),
        )
        .await
        .unwrap();

    h.manager.sync("u1").await.unwrap();

    assert!(h.manager.get("r1", "u1").await.unwrap().is_some());
    assert!(h.manager.get("stale", "u1").await.unwrap().is_none());
}

#[tokio::test]
async fn pending_items_survive_full_sync_deletion() {
    let h = harness(fast_config()).await;
    h.remote.seed(Note::new("r1", "u1", "remote", "b").at(ts(0)));

    // Saved locally through the normal path: queued for push.
    h.manager
        .save(Note::new("mine", "u1", "mine", "b").at(ts(0)), "u1")
        .await
        .unwrap();
    h.remote.fail_next_pushes(1); // keep it pending through this cycle

    h.manager.sync("u1").await.unwrap();
    assert!(h.manager.get("mine", "u1").await.unwrap().is_some());
}

// === Scenario 6: user switch with unsynced data and prompt strategy ===

#[tokio::test]
async fn prompt_strategy_rejects_switch_with_unsynced_data() {
    let h = harness(fast_config().with_initial_user("u1")).await;
    let observer = Arc::new(CountingObserver::default());
    h.manager.register_observer(observer.clone());

    h.manager
        .save(Note::new("e1", "u1", "A", "b"), "u1")
        .await
        .unwrap();

    let mut events = h.manager.events();
    let result = h
        .manager
        .switch_user_with("u2", UserSwitchStrategy::PromptIfUnsyncedData)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.message.as_deref(), Some("Unsynced data present"));
    assert!(result.had_unsynced_data);
    assert_eq!(h.manager.active_user().as_deref(), Some("u1"));
    assert_eq!(*observer.switch_ends.lock(), vec![false]);

    // No UserSwitched event was emitted.
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SyncEvent::UserSwitched { .. }));
    }
}

#[tokio::test]
async fn keep_local_switch_succeeds_and_emits() {
    let h = harness(fast_config().with_initial_user("u1")).await;
    let mut events = h.manager.events();

    let result = h.manager.switch_user("u2").await.unwrap();
    assert!(result.success);
    assert_eq!(result.previous_user_id.as_deref(), Some("u1"));
    assert_eq!(h.manager.active_user().as_deref(), Some("u2"));

    let mut saw_switch = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::UserSwitched { previous, new, .. } = event {
            assert_eq!(previous.as_deref(), Some("u1"));
            assert_eq!(new, "u2");
            saw_switch = true;
        }
    }
    assert!(saw_switch);
}

#[tokio::test]
async fn clear_and_fetch_wipes_the_incoming_user() {
    let h = harness(fast_config()).await;
    h.manager
        .save_with(
            Note::new("old", "u2", "left-over", "b"),
            "u2",
            MutationOptions::from_origin(ChangeOrigin::Remote),
        )
        .await
        .unwrap();

    h.manager
        .switch_user_with("u2", UserSwitchStrategy::ClearAndFetch)
        .await
        .unwrap();

    assert!(h.manager.get("old", "u2").await.unwrap().is_none());
}

// === Round-trip laws ===

#[tokio::test]
async fn delete_roundtrip_leaves_remote_absent() {
    let h = harness(fast_config()).await;

    h.manager
        .save(Note::new("e1", "u1", "A", "b"), "u1")
        .await
        .unwrap();
    h.manager.sync("u1").await.unwrap();
    assert!(h.remote.fetch_by_id("e1", "u1").await.unwrap().is_some());

    h.manager.delete("e1", "u1").await.unwrap();
    let report = h.manager.sync("u1").await.unwrap();
    assert_eq!(report.failed, 0);

    assert!(h.remote.fetch_by_id("e1", "u1").await.unwrap().is_none());
    assert!(h.manager.pending_operations("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn second_sync_without_mutation_is_a_no_op() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("e1", "u1", "A", "b"), "u1")
        .await
        .unwrap();
    h.manager.sync("u1").await.unwrap();

    let fetches = h.remote.fetch_count();
    let report = h.manager.sync("u1").await.unwrap();

    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 0);
    // Metadata matched, so the pull phase never fetched.
    assert_eq!(h.remote.fetch_count(), fetches);
}

#[tokio::test]
async fn metadata_agrees_on_both_sides_after_success() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("e1", "u1", "A", "b"), "u1")
        .await
        .unwrap();
    h.manager
        .save(Note::new("e2", "u1", "B", "b"), "u1")
        .await
        .unwrap();
    h.manager.sync("u1").await.unwrap();

    let local_meta = h.local.get_sync_metadata("u1").await.unwrap().unwrap();
    let remote_meta = h.remote.get_sync_metadata("u1").await.unwrap().unwrap();
    assert_eq!(local_meta.data_hash, remote_meta.data_hash);
    assert_eq!(local_meta.item_count, remote_meta.item_count);
    assert_eq!(local_meta.item_count, 2);
    assert_eq!(h.manager.metadata("u1").unwrap().data_hash, local_meta.data_hash);
}

// === Tombstones, restore, partial updates ===

#[tokio::test]
async fn remote_tombstone_collects_local_copy() {
    let h = harness(fast_config()).await;

    h.manager
        .save_with(
            Note::new("e1", "u1", "A", "b").at(ts(0)),
            "u1",
            MutationOptions::from_origin(ChangeOrigin::Remote),
        )
        .await
        .unwrap();
    let tombstone = Note::new("e1", "u1", "A", "b").at(ts(0)).tombstoned(ts(5));
    h.remote.seed(tombstone);

    h.manager.sync("u1").await.unwrap();
    assert!(h.manager.get("e1", "u1").await.unwrap().is_none());
}

#[tokio::test]
async fn empty_remote_is_restored_from_local_on_full_sync() {
    let h = harness(fast_config()).await;

    for id in ["a", "b", "c"] {
        h.manager
            .save_with(
                Note::new(id, "u1", id, "body").at(ts(0)),
                "u1",
                MutationOptions::from_origin(ChangeOrigin::Remote),
            )
            .await
            .unwrap();
    }

    let report = h.manager.sync("u1").await.unwrap();
    assert_eq!(report.failed, 0);

    for id in ["a", "b", "c"] {
        assert!(h.remote.fetch_by_id(id, "u1").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn partial_update_goes_through_patch_when_supported() {
    let h = harness(fast_config()).await;
    h.remote.enable_patch();

    let note = Note::new("e1", "u1", "A", "b").at(ts(0));
    h.manager.save(note.clone(), "u1").await.unwrap();
    h.manager.sync("u1").await.unwrap();
    assert_eq!(h.remote.patch_count(), 0);

    let edited = note.edited("new body", ts(10));
    h.manager.save(edited, "u1").await.unwrap();
    h.manager.sync("u1").await.unwrap();

    assert_eq!(h.remote.patch_count(), 1);
    let remote_copy = h.remote.fetch_by_id("e1", "u1").await.unwrap().unwrap();
    assert_eq!(remote_copy.body, "new body");
}

// === Cancellation, pause, concurrency, timeout ===

#[tokio::test]
async fn pause_blocks_cycle_until_cancel() {
    let h = harness(fast_config()).await;
    for id in ["a", "b"] {
        h.manager
            .save(Note::new(id, "u1", id, "b"), "u1")
            .await
            .unwrap();
    }

    h.manager.pause_sync("u1");
    let manager = Arc::clone(&h.manager);
    let cycle = tokio::spawn(async move { manager.sync("u1").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.manager.is_syncing("u1"));

    // A second sync for the same user is rejected while one is in flight.
    let concurrent = h.manager.sync("u1").await;
    assert!(matches!(concurrent, Err(SynqError::ConcurrentSync { .. })));

    // Cancellation releases the pause latch; the cycle reports cancelled.
    h.manager.cancel_sync("u1");
    let report = cycle.await.unwrap().unwrap();
    assert!(report.was_cancelled);
    assert_eq!(report.synced, 0);
    assert_eq!(h.manager.pending_operations("u1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn pause_then_resume_lets_the_cycle_finish() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("a", "u1", "a", "b"), "u1")
        .await
        .unwrap();

    h.manager.pause_sync("u1");
    let manager = Arc::clone(&h.manager);
    let cycle = tokio::spawn(async move { manager.sync("u1").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.manager.resume_sync("u1");

    let report = cycle.await.unwrap().unwrap();
    assert!(!report.was_cancelled);
    assert_eq!(report.synced, 1);
}

#[tokio::test]
async fn expired_deadline_surfaces_as_timeout_error() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("a", "u1", "a", "b"), "u1")
        .await
        .unwrap();

    let report = h
        .manager
        .sync_with(
            "u1",
            SyncRequest::new()
                .with_options(SyncOptions::new().with_timeout(Duration::from_nanos(1))),
        )
        .await
        .unwrap();

    assert!(!report.was_cancelled);
    assert_eq!(report.synced, 0);
    assert!(report.errors.iter().any(|e| e.contains("timed out")));
    // The operation survived for the next cycle.
    assert_eq!(h.manager.pending_operations("u1").await.unwrap().len(), 1);
}

// === Events ===

#[tokio::test]
async fn event_order_within_a_cycle() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("a", "u1", "a", "b"), "u1")
        .await
        .unwrap();

    let mut events = h.manager.events();
    h.manager.sync("u1").await.unwrap();

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        order.push(match event {
            SyncEvent::SyncStarted { .. } => "started",
            SyncEvent::SyncProgress { .. } => "progress",
            SyncEvent::DataChanged { .. } => "data",
            SyncEvent::SyncCompleted { .. } => "completed",
            _ => "other",
        });
    }

    let started = order.iter().position(|e| *e == "started").unwrap();
    let progress = order.iter().position(|e| *e == "progress").unwrap();
    let completed = order.iter().position(|e| *e == "completed").unwrap();
    assert!(started < progress);
    assert!(progress < completed);
}

#[tokio::test]
async fn initial_sync_snapshot_for_new_subscribers() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("a", "u1", "a", "b"), "u1")
        .await
        .unwrap();

    let mut subscription = h.manager.events_with_initial("u1").await.unwrap();
    match subscription.recv().await.unwrap() {
        SyncEvent::InitialSync { user_id, data } => {
            assert_eq!(user_id, "u1");
            assert_eq!(data.len(), 1);
        }
        other => panic!("expected initial sync, got {other:?}"),
    }
}

// === Middleware ===

struct Redacting;

#[async_trait]
impl SyncMiddleware<Note> for Redacting {
    async fn to_remote(&self, mut entity: Note) -> SynqResult<Note> {
        entity.body = entity.body.replace("secret", "[redacted]");
        Ok(entity)
    }
}

#[tokio::test]
async fn outbound_middleware_transforms_pushed_entities() {
    let h = harness(fast_config()).await;
    h.manager.register_middleware(Arc::new(Redacting));

    h.manager
        .save(Note::new("e1", "u1", "A", "the secret plan"), "u1")
        .await
        .unwrap();
    h.manager.sync("u1").await.unwrap();

    let remote_copy = h.remote.fetch_by_id("e1", "u1").await.unwrap().unwrap();
    assert_eq!(remote_copy.body, "the [redacted] plan");
}

// === Migrations through the facade ===

struct RenameContent;

impl DataMigration for RenameContent {
    fn from_version(&self) -> u32 {
        1
    }
    fn to_version(&self) -> u32 {
        2
    }
    fn name(&self) -> &str {
        "rename_content_to_body"
    }
    fn migrate(&self, mut row: FieldMap) -> SynqResult<FieldMap> {
        if let Some(content) = row.remove("content") {
            row.insert("body".into(), content);
        }
        Ok(row)
    }
}

#[tokio::test]
async fn initialize_migrates_old_rows() {
    let local = MemoryLocalAdapter::<Note>::new();
    local.set_stored_schema_version(1).await.unwrap();

    let mut row = FieldMap::new();
    row.insert("id".into(), serde_json::Value::String("n1".into()));
    row.insert(
        "owner_user_id".into(),
        serde_json::Value::String("u1".into()),
    );
    row.insert("version".into(), serde_json::Value::from(1));
    row.insert(
        "created_at".into(),
        serde_json::Value::String("2024-01-01T00:00:00Z".into()),
    );
    row.insert(
        "modified_at".into(),
        serde_json::Value::String("2024-01-01T00:00:00Z".into()),
    );
    row.insert("is_deleted".into(), serde_json::Value::Bool(false));
    row.insert("title".into(), serde_json::Value::String("t".into()));
    row.insert(
        "content".into(),
        serde_json::Value::String("old-shape".into()),
    );
    local.seed_raw_row(row);

    let config = fast_config().with_schema(2, vec![Arc::new(RenameContent)]);
    let h = harness_from(config, local, MemoryRemoteAdapter::new()).await;

    let migrated = h.manager.get("n1", "u1").await.unwrap().unwrap();
    assert_eq!(migrated.body, "old-shape");
    assert_eq!(h.local.get_stored_schema_version().await.unwrap(), 2);
}

// === Queue invariants ===

#[tokio::test]
async fn operations_are_exactly_once_resident() {
    let h = harness(fast_config()).await;

    h.manager
        .save(Note::new("e1", "u1", "A", "b"), "u1")
        .await
        .unwrap();

    // Enqueued: present in both the mirror and the adapter.
    let mirrored = h.manager.pending_operations("u1").await.unwrap();
    let persisted = h.local.get_pending_operations("u1").await.unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(persisted.len(), 1);
    assert_eq!(mirrored[0].operation_id, persisted[0].operation_id);

    h.manager.sync("u1").await.unwrap();

    // Completed: gone from both.
    assert!(h.manager.pending_operations("u1").await.unwrap().is_empty());
    assert!(h.local.get_pending_operations("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn push_respects_fifo_order() {
    let h = harness(fast_config()).await;
    for id in ["first", "second", "third"] {
        h.manager
            .save(Note::new(id, "u1", id, "b"), "u1")
            .await
            .unwrap();
    }

    h.manager.sync("u1").await.unwrap();
    assert_eq!(
        h.remote.pushed_ids(),
        vec!["first".to_string(), "second".into(), "third".into()]
    );
}

#[tokio::test]
async fn delete_skipping_keeps_deletes_queued() {
    let h = harness(fast_config()).await;
    h.manager
        .save(Note::new("e1", "u1", "A", "b"), "u1")
        .await
        .unwrap();
    h.manager.sync("u1").await.unwrap();
    h.manager.delete("e1", "u1").await.unwrap();

    let report = h
        .manager
        .sync_with(
            "u1",
            SyncRequest::new().with_options(SyncOptions::new().skip_deletes()),
        )
        .await
        .unwrap();
    assert_eq!(report.synced, 0);

    let pending = h.manager.pending_operations("u1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Delete);
    // The remote copy is untouched until deletes are included again.
    assert!(h.remote.fetch_by_id("e1", "u1").await.unwrap().is_some());
}

// === Real-time ingestion through adapter streams ===

#[tokio::test]
async fn remote_stream_changes_land_locally_without_queueing() {
    let h = harness(fast_config()).await;

    let entity = Note::new("e1", "u1", "streamed", "b").at(ts(0));
    h.remote.emit_change(ChangeDetail::create("u1", entity, ts(0)));

    // The listener task applies the change asynchronously.
    let mut applied = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if h.manager.get("e1", "u1").await.unwrap().is_some() {
            applied = true;
            break;
        }
    }
    assert!(applied, "streamed change never applied");
    assert!(h.manager.pending_operations("u1").await.unwrap().is_empty());
}
