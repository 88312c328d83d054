//! In-memory local adapter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use synq_engine::{
    LocalAdapter, QueryFilter, SynqError, SynqResult, TransactionWork,
};
use synq_protocol::{ChangeDetail, FieldMap, SyncMetadata, SyncOperation, Syncable};
use tokio::sync::broadcast;
use uuid::Uuid;

struct Inner<T: Syncable> {
    // user -> id -> raw record. Raw field maps keep the migration surface
    // honest: reads deserialize, writes serialize.
    rows: Mutex<HashMap<String, BTreeMap<String, FieldMap>>>,
    operations: Mutex<HashMap<String, Vec<SyncOperation<T>>>>,
    metadata: Mutex<HashMap<String, SyncMetadata>>,
    schema_version: Mutex<u32>,
    changed: broadcast::Sender<()>,
    changes: broadcast::Sender<ChangeDetail<T>>,
    fail_saves: AtomicU32,
    fail_operation_writes: AtomicU32,
    save_calls: AtomicU64,
    patch_calls: AtomicU64,
    delete_calls: AtomicU64,
}

/// Local adapter backed by in-process maps.
///
/// Entity records are stored as raw field maps so schema migrations can be
/// exercised end to end. Includes failure injection (`fail_next_saves`,
/// `fail_next_operation_writes`), call counters, and a change stream fed by
/// [`emit_change`](MemoryLocalAdapter::emit_change) to simulate mutations
/// arriving from outside the engine.
pub struct MemoryLocalAdapter<T: Syncable> {
    inner: Arc<Inner<T>>,
}

impl<T: Syncable> MemoryLocalAdapter<T> {
    /// An empty store at schema version zero (fresh install).
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(64);
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(HashMap::new()),
                operations: Mutex::new(HashMap::new()),
                metadata: Mutex::new(HashMap::new()),
                schema_version: Mutex::new(0),
                changed,
                changes,
                fail_saves: AtomicU32::new(0),
                fail_operation_writes: AtomicU32::new(0),
                save_calls: AtomicU64::new(0),
                patch_calls: AtomicU64::new(0),
                delete_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Makes the next `n` save/patch calls fail with a local adapter error.
    pub fn fail_next_saves(&self, n: u32) {
        self.inner.fail_saves.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` pending-operation writes fail.
    pub fn fail_next_operation_writes(&self, n: u32) {
        self.inner.fail_operation_writes.store(n, Ordering::SeqCst);
    }

    /// Number of `save` calls so far.
    pub fn save_call_count(&self) -> u64 {
        self.inner.save_calls.load(Ordering::SeqCst)
    }

    /// Number of `patch` calls so far.
    pub fn patch_call_count(&self) -> u64 {
        self.inner.patch_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls so far.
    pub fn delete_call_count(&self) -> u64 {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    /// Inserts a raw record directly, bypassing serialization. For seeding
    /// old-schema rows in migration tests.
    pub fn seed_raw_row(&self, row: FieldMap) {
        let user = row
            .get("owner_user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let id = row
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        self.inner
            .rows
            .lock()
            .entry(user)
            .or_default()
            .insert(id, row);
        self.notify();
    }

    /// Emits a change on the adapter's change stream, simulating a
    /// mutation made by another process against the same store.
    pub fn emit_change(&self, change: ChangeDetail<T>) {
        let _ = self.inner.changes.send(change);
    }

    fn notify(&self) {
        let _ = self.inner.changed.send(());
    }

    fn take_failure(&self, counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn entity_from_row(row: &FieldMap) -> SynqResult<T> {
        T::from_map(row).map_err(SynqError::from)
    }

    fn spawn_watch<X, F>(&self, compute: F) -> broadcast::Receiver<X>
    where
        X: Clone + Send + 'static,
        F: Fn(&Inner<T>) -> X + Send + 'static,
    {
        let (tx, rx) = broadcast::channel(32);
        let inner = Arc::clone(&self.inner);
        let mut changed = self.inner.changed.subscribe();
        tokio::spawn(async move {
            if tx.send(compute(&inner)).is_err() {
                return;
            }
            loop {
                match changed.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if tx.send(compute(&inner)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

impl<T: Syncable> Default for MemoryLocalAdapter<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_entities<T: Syncable>(inner: &Inner<T>, user_id: &str) -> Vec<T> {
    inner
        .rows
        .lock()
        .get(user_id)
        .map(|rows| {
            rows.values()
                .filter_map(|row| T::from_map(row).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl<T: Syncable> LocalAdapter<T> for MemoryLocalAdapter<T> {
    async fn initialize(&self) -> SynqResult<()> {
        Ok(())
    }

    async fn get_all(&self, user_id: &str) -> SynqResult<Vec<T>> {
        let rows = self.inner.rows.lock();
        let Some(user_rows) = rows.get(user_id) else {
            return Ok(Vec::new());
        };
        user_rows.values().map(Self::entity_from_row).collect()
    }

    async fn get_by_id(&self, id: &str, user_id: &str) -> SynqResult<Option<T>> {
        let rows = self.inner.rows.lock();
        match rows.get(user_id).and_then(|user_rows| user_rows.get(id)) {
            Some(row) => Ok(Some(Self::entity_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn get_by_ids(
        &self,
        ids: &[String],
        user_id: &str,
    ) -> SynqResult<HashMap<String, T>> {
        let rows = self.inner.rows.lock();
        let mut found = HashMap::new();
        if let Some(user_rows) = rows.get(user_id) {
            for id in ids {
                if let Some(row) = user_rows.get(id) {
                    found.insert(id.clone(), Self::entity_from_row(row)?);
                }
            }
        }
        Ok(found)
    }

    async fn save(&self, entity: &T, user_id: &str) -> SynqResult<()> {
        self.inner.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure(&self.inner.fail_saves) {
            return Err(SynqError::local_adapter("simulated save failure"));
        }
        self.inner
            .rows
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(entity.id().to_string(), entity.to_map());
        self.notify();
        Ok(())
    }

    async fn patch(&self, id: &str, user_id: &str, delta: &FieldMap) -> SynqResult<T> {
        self.inner.patch_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure(&self.inner.fail_saves) {
            return Err(SynqError::local_adapter("simulated patch failure"));
        }
        let mut rows = self.inner.rows.lock();
        let row = rows
            .get_mut(user_id)
            .and_then(|user_rows| user_rows.get_mut(id))
            .ok_or_else(|| {
                SynqError::local_adapter(format!("cannot patch missing entity {id}"))
            })?;
        for (key, value) in delta {
            if value.is_null() {
                row.remove(key);
            } else {
                row.insert(key.clone(), value.clone());
            }
        }
        let patched = Self::entity_from_row(row)?;
        drop(rows);
        self.notify();
        Ok(patched)
    }

    async fn delete(&self, id: &str, user_id: &str) -> SynqResult<bool> {
        self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
        let existed = self
            .inner
            .rows
            .lock()
            .get_mut(user_id)
            .map(|user_rows| user_rows.remove(id).is_some())
            .unwrap_or(false);
        if existed {
            self.notify();
        }
        Ok(existed)
    }

    async fn get_pending_operations(&self, user_id: &str) -> SynqResult<Vec<SyncOperation<T>>> {
        Ok(self
            .inner
            .operations
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_pending_operation(
        &self,
        user_id: &str,
        operation: &SyncOperation<T>,
    ) -> SynqResult<()> {
        if self.take_failure(&self.inner.fail_operation_writes) {
            return Err(SynqError::local_adapter("simulated operation write failure"));
        }
        let mut operations = self.inner.operations.lock();
        let queue = operations.entry(user_id.to_string()).or_default();
        match queue
            .iter_mut()
            .find(|op| op.operation_id == operation.operation_id)
        {
            Some(slot) => *slot = operation.clone(),
            None => queue.push(operation.clone()),
        }
        Ok(())
    }

    async fn mark_as_synced(&self, operation_id: Uuid) -> SynqResult<()> {
        let mut operations = self.inner.operations.lock();
        for queue in operations.values_mut() {
            queue.retain(|op| op.operation_id != operation_id);
        }
        Ok(())
    }

    async fn clear_user_data(&self, user_id: &str) -> SynqResult<()> {
        self.inner.rows.lock().remove(user_id);
        self.inner.operations.lock().remove(user_id);
        self.inner.metadata.lock().remove(user_id);
        self.notify();
        Ok(())
    }

    async fn get_sync_metadata(&self, user_id: &str) -> SynqResult<Option<SyncMetadata>> {
        Ok(self.inner.metadata.lock().get(user_id).cloned())
    }

    async fn update_sync_metadata(
        &self,
        metadata: &SyncMetadata,
        user_id: &str,
    ) -> SynqResult<()> {
        self.inner
            .metadata
            .lock()
            .insert(user_id.to_string(), metadata.clone());
        Ok(())
    }

    async fn transaction(&self, work: TransactionWork) -> SynqResult<()> {
        let rows_before = self.inner.rows.lock().clone();
        let version_before = *self.inner.schema_version.lock();

        match work().await {
            Ok(()) => Ok(()),
            Err(error) => {
                *self.inner.rows.lock() = rows_before;
                *self.inner.schema_version.lock() = version_before;
                Err(error)
            }
        }
    }

    async fn get_all_raw_data(&self) -> SynqResult<Vec<FieldMap>> {
        let rows = self.inner.rows.lock();
        Ok(rows
            .values()
            .flat_map(|user_rows| user_rows.values().cloned())
            .collect())
    }

    async fn overwrite_all_raw_data(&self, new_rows: Vec<FieldMap>) -> SynqResult<()> {
        let mut rebuilt: HashMap<String, BTreeMap<String, FieldMap>> = HashMap::new();
        for row in new_rows {
            let user = row
                .get("owner_user_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SynqError::Validation("raw row lacks owner_user_id".into()))?
                .to_string();
            let id = row
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SynqError::Validation("raw row lacks id".into()))?
                .to_string();
            rebuilt.entry(user).or_default().insert(id, row);
        }
        *self.inner.rows.lock() = rebuilt;
        self.notify();
        Ok(())
    }

    async fn get_stored_schema_version(&self) -> SynqResult<u32> {
        Ok(*self.inner.schema_version.lock())
    }

    async fn set_stored_schema_version(&self, version: u32) -> SynqResult<()> {
        *self.inner.schema_version.lock() = version;
        Ok(())
    }

    fn watch_all(&self, user_id: &str) -> broadcast::Receiver<Vec<T>> {
        let user = user_id.to_string();
        self.spawn_watch(move |inner| sorted_entities(inner, &user))
    }

    fn watch_by_id(&self, id: &str, user_id: &str) -> broadcast::Receiver<Option<T>> {
        let id = id.to_string();
        let user = user_id.to_string();
        self.spawn_watch(move |inner| {
            inner
                .rows
                .lock()
                .get(&user)
                .and_then(|rows| rows.get(&id))
                .and_then(|row| T::from_map(row).ok())
        })
    }

    fn watch_all_paginated(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> broadcast::Receiver<Vec<T>> {
        let user = user_id.to_string();
        self.spawn_watch(move |inner| {
            sorted_entities(inner, &user)
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect()
        })
    }

    fn watch_query(&self, user_id: &str, filter: &QueryFilter) -> broadcast::Receiver<Vec<T>> {
        let user = user_id.to_string();
        let filter = filter.clone();
        self.spawn_watch(move |inner| {
            sorted_entities::<T>(inner, &user)
                .into_iter()
                .filter(|entity| entity.to_map().get(&filter.field) == Some(&filter.equals))
                .collect()
        })
    }

    fn watch_count(&self, user_id: &str) -> broadcast::Receiver<u64> {
        let user = user_id.to_string();
        self.spawn_watch(move |inner| {
            inner
                .rows
                .lock()
                .get(&user)
                .map(|rows| rows.len() as u64)
                .unwrap_or(0)
        })
    }

    fn watch_first(&self, user_id: &str) -> broadcast::Receiver<Option<T>> {
        let user = user_id.to_string();
        self.spawn_watch(move |inner| sorted_entities(inner, &user).into_iter().next())
    }

    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeDetail<T>>> {
        Some(self.inner.changes.subscribe())
    }

    async fn dispose(&self) -> SynqResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Note;

    #[tokio::test]
    async fn save_and_read_back() {
        let adapter = MemoryLocalAdapter::<Note>::new();
        let note = Note::new("n1", "u1", "title", "body");

        adapter.save(&note, "u1").await.unwrap();
        let loaded = adapter.get_by_id("n1", "u1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "title");
        assert_eq!(adapter.save_call_count(), 1);
    }

    #[tokio::test]
    async fn patch_merges_and_null_removes() {
        let adapter = MemoryLocalAdapter::<Note>::new();
        let mut note = Note::new("n1", "u1", "title", "body");
        note.server_revision = Some("rev-1".into());
        adapter.save(&note, "u1").await.unwrap();

        let mut delta = FieldMap::new();
        delta.insert("title".into(), serde_json::Value::String("renamed".into()));
        delta.insert("server_revision".into(), serde_json::Value::Null);

        let patched = adapter.patch("n1", "u1", &delta).await.unwrap();
        assert_eq!(patched.title, "renamed");
        assert_eq!(patched.server_revision, None);
    }

    #[tokio::test]
    async fn failure_injection_decrements() {
        let adapter = MemoryLocalAdapter::<Note>::new();
        adapter.fail_next_saves(1);

        let note = Note::new("n1", "u1", "t", "b");
        assert!(adapter.save(&note, "u1").await.is_err());
        assert!(adapter.save(&note, "u1").await.is_ok());
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let adapter = Arc::new(MemoryLocalAdapter::<Note>::new());
        let note = Note::new("n1", "u1", "t", "b");
        adapter.save(&note, "u1").await.unwrap();

        let inner = Arc::clone(&adapter);
        let result = adapter
            .transaction(Box::new(move || {
                Box::pin(async move {
                    inner.overwrite_all_raw_data(Vec::new()).await?;
                    Err(SynqError::Validation("abort".into()))
                })
            }))
            .await;

        assert!(result.is_err());
        assert_eq!(adapter.get_all("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watch_all_sees_mutations() {
        let adapter = MemoryLocalAdapter::<Note>::new();
        let mut rx = adapter.watch_all("u1");
        assert!(rx.recv().await.unwrap().is_empty());

        adapter
            .save(&Note::new("n1", "u1", "t", "b"), "u1")
            .await
            .unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
