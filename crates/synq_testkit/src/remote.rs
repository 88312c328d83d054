//! In-memory remote adapter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use synq_engine::{RemoteAdapter, SyncScope, SynqError, SynqResult};
use synq_protocol::{ChangeDetail, FieldMap, SyncMetadata, Syncable};
use tokio::sync::broadcast;

type ScopeFilter<T> = dyn Fn(&SyncScope, &T) -> bool + Send + Sync;

/// Remote adapter backed by in-process maps.
///
/// Simulates the far side: connectivity toggling, retryable push failures
/// (`fail_next_pushes`), optional `patch` support, scope filtering through
/// a caller-supplied predicate, call counters, and a change stream fed by
/// [`emit_change`](MemoryRemoteAdapter::emit_change).
pub struct MemoryRemoteAdapter<T: Syncable> {
    entities: Mutex<HashMap<String, BTreeMap<String, T>>>,
    metadata: Mutex<HashMap<String, SyncMetadata>>,
    connected: AtomicBool,
    patch_enabled: AtomicBool,
    fail_pushes: AtomicU32,
    push_calls: AtomicU64,
    patch_calls: AtomicU64,
    delete_calls: AtomicU64,
    fetch_calls: AtomicU64,
    pushed_ids: Mutex<Vec<String>>,
    scope_filter: Mutex<Option<Arc<ScopeFilter<T>>>>,
    changes: broadcast::Sender<ChangeDetail<T>>,
}

impl<T: Syncable> MemoryRemoteAdapter<T> {
    /// An empty, connected remote without patch support.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entities: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            patch_enabled: AtomicBool::new(false),
            fail_pushes: AtomicU32::new(0),
            push_calls: AtomicU64::new(0),
            patch_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            fetch_calls: AtomicU64::new(0),
            pushed_ids: Mutex::new(Vec::new()),
            scope_filter: Mutex::new(None),
            changes,
        }
    }

    /// Toggles the simulated link.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Enables the `patch` surface.
    pub fn enable_patch(&self) {
        self.patch_enabled.store(true, Ordering::SeqCst);
    }

    /// Makes the next `n` pushes fail with a retryable remote error.
    pub fn fail_next_pushes(&self, n: u32) {
        self.fail_pushes.store(n, Ordering::SeqCst);
    }

    /// Installs the predicate scoped fetches filter through.
    pub fn set_scope_filter(
        &self,
        filter: impl Fn(&SyncScope, &T) -> bool + Send + Sync + 'static,
    ) {
        *self.scope_filter.lock() = Some(Arc::new(filter));
    }

    /// Seeds an entity directly, bypassing `push` bookkeeping.
    pub fn seed(&self, entity: T) {
        self.entities
            .lock()
            .entry(entity.owner_user_id().to_string())
            .or_default()
            .insert(entity.id().to_string(), entity);
    }

    /// Number of `push` calls so far (including failed ones).
    pub fn push_count(&self) -> u64 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of `patch` calls so far.
    pub fn patch_count(&self) -> u64 {
        self.patch_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_remote` calls so far.
    pub fn delete_count(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_all` calls so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Entity ids successfully pushed, in order.
    pub fn pushed_ids(&self) -> Vec<String> {
        self.pushed_ids.lock().clone()
    }

    /// Emits a change on the adapter's change stream, simulating a
    /// mutation observed at the remote.
    pub fn emit_change(&self, change: ChangeDetail<T>) {
        let _ = self.changes.send(change);
    }
}

impl<T: Syncable> Default for MemoryRemoteAdapter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Syncable> RemoteAdapter<T> for MemoryRemoteAdapter<T> {
    async fn fetch_all(&self, user_id: &str, scope: Option<&SyncScope>) -> SynqResult<Vec<T>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let entities = self.entities.lock();
        let Some(user_entities) = entities.get(user_id) else {
            return Ok(Vec::new());
        };
        let filter = self.scope_filter.lock().clone();
        Ok(user_entities
            .values()
            .filter(|entity| match (scope, &filter) {
                (Some(scope), Some(filter)) => filter(scope, entity),
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn fetch_by_id(&self, id: &str, user_id: &str) -> SynqResult<Option<T>> {
        Ok(self
            .entities
            .lock()
            .get(user_id)
            .and_then(|user_entities| user_entities.get(id))
            .cloned())
    }

    async fn push(&self, entity: &T, user_id: &str) -> SynqResult<T> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SynqError::remote_adapter("simulated network failure"));
        }
        self.entities
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(entity.id().to_string(), entity.clone());
        self.pushed_ids.lock().push(entity.id().to_string());
        Ok(entity.clone())
    }

    fn supports_patch(&self) -> bool {
        self.patch_enabled.load(Ordering::SeqCst)
    }

    async fn patch(&self, id: &str, user_id: &str, delta: &FieldMap) -> SynqResult<T> {
        if !self.supports_patch() {
            return Err(SynqError::remote_adapter("patch not supported"));
        }
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        let mut entities = self.entities.lock();
        let stored = entities
            .get_mut(user_id)
            .and_then(|user_entities| user_entities.get_mut(id))
            .ok_or_else(|| {
                SynqError::remote_adapter(format!("cannot patch missing entity {id}"))
            })?;

        let mut row = stored.to_map();
        for (key, value) in delta {
            if value.is_null() {
                row.remove(key);
            } else {
                row.insert(key.clone(), value.clone());
            }
        }
        let patched = T::from_map(&row)?;
        *stored = patched.clone();
        Ok(patched)
    }

    async fn delete_remote(&self, id: &str, user_id: &str) -> SynqResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(user_entities) = self.entities.lock().get_mut(user_id) {
            user_entities.remove(id);
        }
        Ok(())
    }

    async fn get_sync_metadata(&self, user_id: &str) -> SynqResult<Option<SyncMetadata>> {
        Ok(self.metadata.lock().get(user_id).cloned())
    }

    async fn update_sync_metadata(
        &self,
        metadata: &SyncMetadata,
        user_id: &str,
    ) -> SynqResult<()> {
        self.metadata
            .lock()
            .insert(user_id.to_string(), metadata.clone());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeDetail<T>>> {
        Some(self.changes.subscribe())
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
    async fn push_stores_and_returns_authoritative_copy() {
        let remote = MemoryRemoteAdapter::<Note>::new();
        let note = Note::new("n1", "u1", "t", "b");

        let returned = remote.push(&note, "u1").await.unwrap();
        assert_eq!(returned.id, "n1");
        assert_eq!(remote.push_count(), 1);
        assert_eq!(remote.pushed_ids(), vec!["n1".to_string()]);

        let fetched = remote.fetch_by_id("n1", "u1").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn injected_push_failures_are_retryable() {
        let remote = MemoryRemoteAdapter::<Note>::new();
        remote.fail_next_pushes(1);
        let note = Note::new("n1", "u1", "t", "b");

        let error = remote.push(&note, "u1").await.unwrap_err();
        assert!(error.is_retryable());
        assert!(remote.push(&note, "u1").await.is_ok());
    }

    #[tokio::test]
    async fn patch_requires_opt_in() {
        let remote = MemoryRemoteAdapter::<Note>::new();
        let note = Note::new("n1", "u1", "t", "b");
        remote.seed(note);

        let mut delta = FieldMap::new();
        delta.insert("title".into(), serde_json::Value::String("x".into()));

        assert!(remote.patch("n1", "u1", &delta).await.is_err());

        remote.enable_patch();
        let patched = remote.patch("n1", "u1", &delta).await.unwrap();
        assert_eq!(patched.title, "x");
    }

    #[tokio::test]
    async fn scope_filter_narrows_fetches() {
        let remote = MemoryRemoteAdapter::<Note>::new();
        remote.seed(Note::new("keep", "u1", "recent", "b"));
        remote.seed(Note::new("drop", "u1", "ancient", "b"));
        remote.set_scope_filter(|scope, note: &Note| {
            scope.name == "recent" && note.title == "recent"
        });

        let scoped = remote
            .fetch_all("u1", Some(&SyncScope::named("recent")))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, "keep");

        // Unscoped fetches see everything.
        let all = remote.fetch_all("u1", None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
