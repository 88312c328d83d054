//! Queued sync operations.

use crate::entity::{FieldMap, Syncable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Entity was created locally and must be pushed.
    Create,
    /// Entity was updated locally; the operation may carry a field delta.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl OperationKind {
    /// Stable lowercase name, used in change-dedup keys and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// An intent to reconcile a local mutation with the remote store.
///
/// Operations are created by the facade's mutating calls, persisted through
/// the local adapter, mirrored in the in-memory queue, and eventually either
/// marked completed (removed) or retried with an incremented `retry_count`.
/// An operation that exhausts its retries stays in the queue as a terminal
/// failure — it is never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Syncable")]
pub struct SyncOperation<T> {
    /// Unique operation id.
    pub operation_id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Target entity.
    pub entity_id: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Full entity snapshot (creates always carry one; updates may).
    pub snapshot: Option<T>,
    /// Changed-fields map for partial updates.
    pub delta: Option<FieldMap>,
    /// When the operation was enqueued.
    pub created_at: DateTime<Utc>,
    /// Number of failed push attempts so far.
    pub retry_count: u32,
    /// When the last push attempt happened.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl<T: Syncable> SyncOperation<T> {
    /// Creates a `Create` operation carrying a full snapshot.
    pub fn create(user_id: impl Into<String>, entity: T) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            user_id: user_id.into(),
            entity_id: entity.id().to_string(),
            kind: OperationKind::Create,
            snapshot: Some(entity),
            delta: None,
            created_at: Utc::now(),
            retry_count: 0,
            last_attempt_at: None,
        }
    }

    /// Creates an `Update` operation carrying a snapshot and, optionally,
    /// the field delta against the previously stored version.
    pub fn update(user_id: impl Into<String>, entity: T, delta: Option<FieldMap>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            user_id: user_id.into(),
            entity_id: entity.id().to_string(),
            kind: OperationKind::Update,
            snapshot: Some(entity),
            delta,
            created_at: Utc::now(),
            retry_count: 0,
            last_attempt_at: None,
        }
    }

    /// Creates a `Delete` operation.
    pub fn delete(user_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            user_id: user_id.into(),
            entity_id: entity_id.into(),
            kind: OperationKind::Delete,
            snapshot: None,
            delta: None,
            created_at: Utc::now(),
            retry_count: 0,
            last_attempt_at: None,
        }
    }

    /// Returns a copy with `retry_count` incremented and the attempt time
    /// stamped. The operation id is preserved so the queue replaces the
    /// original in place.
    #[must_use]
    pub fn with_retry(&self, attempted_at: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.retry_count += 1;
        copy.last_attempt_at = Some(attempted_at);
        copy
    }

    /// True when this operation carries a non-empty field delta.
    pub fn has_delta(&self) -> bool {
        self.delta.as_ref().is_some_and(|d| !d.is_empty())
    }
}
