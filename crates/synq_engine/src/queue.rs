//! The in-memory mirror of the per-user pending-operation queues.

use crate::adapter::LocalAdapter;
use crate::error::SynqResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use synq_protocol::{SyncOperation, Syncable};
use tokio::sync::watch;
use uuid::Uuid;

struct UserQueue<T: Syncable> {
    operations: Vec<SyncOperation<T>>,
    initialized: bool,
    snapshots: watch::Sender<Vec<SyncOperation<T>>>,
}

impl<T: Syncable> UserQueue<T> {
    fn new() -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self {
            operations: Vec::new(),
            initialized: false,
            snapshots,
        }
    }

    fn broadcast(&self) {
        // send_replace keeps the latest snapshot around for late watchers.
        self.snapshots.send_replace(self.operations.clone());
    }
}

/// Per-user FIFO queues of pending operations, mirrored in memory and
/// persisted through the local adapter.
///
/// The adapter is the source of truth: every mutation persists first and
/// only then updates the mirror, so a persistence failure leaves the
/// mirror matching the adapter. Queues materialize lazily on first touch.
/// Ordering is FIFO within a user; cross-user order is undefined.
pub struct QueueManager<T: Syncable, L: LocalAdapter<T>> {
    local: Arc<L>,
    queues: Mutex<HashMap<String, UserQueue<T>>>,
}

impl<T: Syncable, L: LocalAdapter<T>> QueueManager<T, L> {
    /// Creates a manager over a local adapter.
    pub fn new(local: Arc<L>) -> Self {
        Self {
            local,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Loads a user's persisted queue into the mirror. Idempotent; later
    /// calls are no-ops.
    pub async fn initialize_user(&self, user_id: &str) -> SynqResult<()> {
        if self
            .queues
            .lock()
            .get(user_id)
            .is_some_and(|q| q.initialized)
        {
            return Ok(());
        }

        let operations = self.local.get_pending_operations(user_id).await?;

        let mut queues = self.queues.lock();
        let queue = queues
            .entry(user_id.to_string())
            .or_insert_with(UserQueue::new);
        if !queue.initialized {
            queue.operations = operations;
            queue.initialized = true;
            queue.broadcast();
        }
        Ok(())
    }

    /// Appends an operation: persist, then mirror.
    pub async fn enqueue(&self, user_id: &str, operation: SyncOperation<T>) -> SynqResult<()> {
        self.initialize_user(user_id).await?;
        self.local.add_pending_operation(user_id, &operation).await?;

        let mut queues = self.queues.lock();
        let queue = queues
            .entry(user_id.to_string())
            .or_insert_with(UserQueue::new);
        queue.operations.push(operation);
        queue.broadcast();
        Ok(())
    }

    /// Removes a completed operation: persist the removal, then mirror.
    pub async fn mark_completed(&self, user_id: &str, operation_id: Uuid) -> SynqResult<()> {
        self.local.mark_as_synced(operation_id).await?;

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(user_id) {
            queue.operations.retain(|op| op.operation_id != operation_id);
            queue.broadcast();
        }
        Ok(())
    }

    /// Replaces an operation in place by `operation_id` (retry bumps).
    pub async fn update(&self, user_id: &str, operation: SyncOperation<T>) -> SynqResult<()> {
        self.local.add_pending_operation(user_id, &operation).await?;

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(user_id) {
            if let Some(slot) = queue
                .operations
                .iter_mut()
                .find(|op| op.operation_id == operation.operation_id)
            {
                *slot = operation;
            } else {
                queue.operations.push(operation);
            }
            queue.broadcast();
        }
        Ok(())
    }

    /// Empties a user's queue, persisting each removal.
    pub async fn clear(&self, user_id: &str) -> SynqResult<()> {
        let operations = self.pending(user_id);
        for operation in &operations {
            self.local.mark_as_synced(operation.operation_id).await?;
        }

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(user_id) {
            queue.operations.clear();
            queue.broadcast();
        }
        Ok(())
    }

    /// Current snapshot of a user's queue, FIFO order. Empty when the user
    /// has not been initialized yet.
    pub fn pending(&self, user_id: &str) -> Vec<SyncOperation<T>> {
        self.queues
            .lock()
            .get(user_id)
            .map(|q| q.operations.clone())
            .unwrap_or_default()
    }

    /// Number of queued operations for a user.
    pub fn pending_count(&self, user_id: &str) -> usize {
        self.queues
            .lock()
            .get(user_id)
            .map(|q| q.operations.len())
            .unwrap_or(0)
    }

    /// Watches a user's queue. Each mirror change publishes a full
    /// snapshot; the receiver always starts from the current one.
    pub fn watch(&self, user_id: &str) -> watch::Receiver<Vec<SyncOperation<T>>> {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(user_id.to_string())
            .or_insert_with(UserQueue::new);
        queue.snapshots.subscribe()
    }

    /// Drops a user's mirror so the next touch reloads from the adapter.
    /// Used after `clear_user_data` wipes the persisted queue.
    pub fn forget(&self, user_id: &str) {
        self.queues.lock().remove(user_id);
    }
}
