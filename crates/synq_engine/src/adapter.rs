//! The adapter seams the engine consumes.
//!
//! The engine never talks to a concrete store. It drives a [`LocalAdapter`]
//! (the device-side store that also persists the operation queue, sync
//! metadata, and the schema version) and a [`RemoteAdapter`] (the
//! authoritative far side). Both are async traits so every adapter call is
//! a suspension point; implementations decide what the I/O actually is.
//!
//! Watch methods and change streams are optional capabilities: the defaults
//! return closed (immediately empty) streams and `None` respectively.

use crate::error::SynqResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use synq_protocol::{ChangeDetail, FieldMap, SyncMetadata, SyncOperation, Syncable};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Boxed future returned by a transaction body.
pub type TransactionFuture = Pin<Box<dyn Future<Output = SynqResult<()>> + Send>>;

/// Work executed atomically by [`LocalAdapter::transaction`]. The adapter
/// commits when the future resolves `Ok` and rolls back otherwise.
pub type TransactionWork = Box<dyn FnOnce() -> TransactionFuture + Send>;

/// Opaque filter forwarded to [`RemoteAdapter::fetch_all`] for partial
/// pulls. A cycle carrying a scope never deletes local data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncScope {
    /// Adapter-interpreted scope name.
    pub name: String,
    /// Adapter-interpreted parameters.
    pub params: FieldMap,
}

impl SyncScope {
    /// A scope with a name and no parameters.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: FieldMap::new(),
        }
    }

    /// Adds one parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Equality predicate over one field, used by the optional query-watch
/// surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Field to compare.
    pub field: String,
    /// Value the field must equal.
    pub equals: serde_json::Value,
}

/// Returns a receiver whose channel is already closed — the idiom for an
/// adapter opting out of a watch capability.
pub fn closed_stream<X: Clone>() -> broadcast::Receiver<X> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}

/// Device-side store consumed by the engine.
///
/// Beyond entity CRUD it persists the pending-operation queue (the durable
/// half of [`crate::queue::QueueManager`]), per-user sync metadata, and the
/// stored schema version the migration executor walks forward.
#[async_trait::async_trait]
pub trait LocalAdapter<T: Syncable>: Send + Sync + 'static {
    /// Opens or prepares the underlying store.
    async fn initialize(&self) -> SynqResult<()>;

    /// All entities for a user, tombstones included.
    async fn get_all(&self, user_id: &str) -> SynqResult<Vec<T>>;

    /// One entity by id.
    async fn get_by_id(&self, id: &str, user_id: &str) -> SynqResult<Option<T>>;

    /// Batch lookup by ids. One query, not N.
    async fn get_by_ids(&self, ids: &[String], user_id: &str)
        -> SynqResult<HashMap<String, T>>;

    /// Page of entities. The default slices `get_all`.
    async fn get_all_paginated(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> SynqResult<Vec<T>> {
        let all = self.get_all(user_id).await?;
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    /// Writes a full entity record, inserting or overwriting.
    async fn save(&self, entity: &T, user_id: &str) -> SynqResult<()>;

    /// Applies a field delta to a stored record and returns the result.
    async fn patch(&self, id: &str, user_id: &str, delta: &FieldMap) -> SynqResult<T>;

    /// Removes a record. Returns false when it was absent.
    async fn delete(&self, id: &str, user_id: &str) -> SynqResult<bool>;

    /// The persisted pending-operation queue, FIFO.
    async fn get_pending_operations(&self, user_id: &str) -> SynqResult<Vec<SyncOperation<T>>>;

    /// Persists an operation, replacing any record with the same
    /// `operation_id` (retries re-persist in place).
    async fn add_pending_operation(
        &self,
        user_id: &str,
        operation: &SyncOperation<T>,
    ) -> SynqResult<()>;

    /// Removes a persisted operation after a successful push.
    async fn mark_as_synced(&self, operation_id: Uuid) -> SynqResult<()>;

    /// Deletes everything stored for a user: entities, queue, metadata.
    async fn clear_user_data(&self, user_id: &str) -> SynqResult<()>;

    /// Stored sync metadata for a user.
    async fn get_sync_metadata(&self, user_id: &str) -> SynqResult<Option<SyncMetadata>>;

    /// Replaces the stored sync metadata for a user.
    async fn update_sync_metadata(
        &self,
        metadata: &SyncMetadata,
        user_id: &str,
    ) -> SynqResult<()>;

    /// Runs `work` atomically: commit on `Ok`, roll back on `Err`.
    async fn transaction(&self, work: TransactionWork) -> SynqResult<()>;

    /// Every persisted entity record in raw field-map form, across all
    /// users. Migration surface.
    async fn get_all_raw_data(&self) -> SynqResult<Vec<FieldMap>>;

    /// Atomically replaces every persisted entity record. Migration
    /// surface.
    async fn overwrite_all_raw_data(&self, rows: Vec<FieldMap>) -> SynqResult<()>;

    /// The stored schema version; zero on a fresh install.
    async fn get_stored_schema_version(&self) -> SynqResult<u32>;

    /// Records the stored schema version.
    async fn set_stored_schema_version(&self, version: u32) -> SynqResult<()>;

    /// Live snapshots of a user's entity set.
    fn watch_all(&self, _user_id: &str) -> broadcast::Receiver<Vec<T>> {
        closed_stream()
    }

    /// Live view of one entity.
    fn watch_by_id(&self, _id: &str, _user_id: &str) -> broadcast::Receiver<Option<T>> {
        closed_stream()
    }

    /// Live pages of a user's entity set.
    fn watch_all_paginated(
        &self,
        _user_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> broadcast::Receiver<Vec<T>> {
        closed_stream()
    }

    /// Live results of a field-equality query.
    fn watch_query(&self, _user_id: &str, _filter: &QueryFilter) -> broadcast::Receiver<Vec<T>> {
        closed_stream()
    }

    /// Live entity count.
    fn watch_count(&self, _user_id: &str) -> broadcast::Receiver<u64> {
        closed_stream()
    }

    /// Live view of the first entity.
    fn watch_first(&self, _user_id: &str) -> broadcast::Receiver<Option<T>> {
        closed_stream()
    }

    /// Mutations observed at the store outside this engine (another
    /// process, a platform sync service). `None` when unsupported.
    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeDetail<T>>> {
        None
    }

    /// Releases resources. Called once from the facade's `dispose`.
    async fn dispose(&self) -> SynqResult<()>;
}

/// The authoritative far side.
#[async_trait::async_trait]
pub trait RemoteAdapter<T: Syncable>: Send + Sync + 'static {
    /// All remote entities for a user, optionally narrowed by a scope.
    async fn fetch_all(&self, user_id: &str, scope: Option<&SyncScope>) -> SynqResult<Vec<T>>;

    /// One remote entity by id.
    async fn fetch_by_id(&self, id: &str, user_id: &str) -> SynqResult<Option<T>>;

    /// Uploads an entity and returns the authoritative remote copy.
    async fn push(&self, entity: &T, user_id: &str) -> SynqResult<T>;

    /// Whether `patch` is implemented.
    fn supports_patch(&self) -> bool {
        false
    }

    /// Applies a field delta remotely and returns the authoritative copy.
    async fn patch(&self, _id: &str, _user_id: &str, _delta: &FieldMap) -> SynqResult<T> {
        Err(crate::error::SynqError::remote_adapter(
            "patch not supported by this adapter",
        ))
    }

    /// Deletes or tombstones an entity remotely.
    async fn delete_remote(&self, id: &str, user_id: &str) -> SynqResult<()>;

    /// Remote-stored sync metadata for a user.
    async fn get_sync_metadata(&self, user_id: &str) -> SynqResult<Option<SyncMetadata>>;

    /// Replaces the remote-stored sync metadata for a user.
    async fn update_sync_metadata(
        &self,
        metadata: &SyncMetadata,
        user_id: &str,
    ) -> SynqResult<()>;

    /// Whether the remote currently answers.
    async fn is_connected(&self) -> bool;

    /// Mutations observed at the remote. `None` when unsupported.
    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeDetail<T>>> {
        None
    }

    /// Releases resources. Called once from the facade's `dispose`.
    async fn dispose(&self) -> SynqResult<()>;
}

/// Host-side connectivity signal checked before the remote's own
/// `is_connected` during preflight.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Whether the host believes a network link exists.
    async fn is_online(&self) -> bool;
}

/// Probe that always reports a link; the default when none is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait::async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_stream_is_immediately_empty() {
        let mut rx: broadcast::Receiver<u32> = closed_stream();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn scope_builder() {
        let scope = SyncScope::named("recent").with_param("days", serde_json::Value::from(7));
        assert_eq!(scope.name, "recent");
        assert_eq!(scope.params["days"], serde_json::Value::from(7));
    }

    #[tokio::test]
    async fn always_online_reports_online() {
        assert!(AlwaysOnline.is_online().await);
    }
}
