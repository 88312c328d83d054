//! Conflict descriptions and resolutions.

use crate::metadata::SyncMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of divergence detected between a local and a remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The remote copy belongs to a different user than the one syncing.
    UserMismatch,
    /// Exactly one side has tombstoned the entity.
    DeletionConflict,
    /// Both sides modified the entity independently.
    BothModified,
}

/// Describes a detected conflict. Handed to the resolver together with both
/// entity copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictContext {
    /// The user whose cycle detected the conflict.
    pub user_id: String,
    /// The entity in conflict.
    pub entity_id: String,
    /// What kind of divergence this is.
    pub kind: ConflictKind,
    /// The local side's sync metadata at detection time, if known.
    pub local_meta: Option<SyncMetadata>,
    /// The remote side's sync metadata at detection time, if known.
    pub remote_meta: Option<SyncMetadata>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictContext {
    /// Creates a context with no metadata attached.
    pub fn new(
        user_id: impl Into<String>,
        entity_id: impl Into<String>,
        kind: ConflictKind,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            entity_id: entity_id.into(),
            kind,
            local_meta: None,
            remote_meta: None,
            detected_at: Utc::now(),
        }
    }

    /// Attaches both sides' metadata.
    #[must_use]
    pub fn with_metadata(
        mut self,
        local: Option<SyncMetadata>,
        remote: Option<SyncMetadata>,
    ) -> Self {
        self.local_meta = local;
        self.remote_meta = remote;
        self
    }
}

/// How a conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the local copy; it will be pushed to the remote.
    UseLocal,
    /// Accept the remote copy; it will be written locally.
    UseRemote,
    /// Apply a combined copy to both sides.
    Merge,
    /// Take no action for this entity in this cycle.
    Abort,
    /// Defer to the application; treated like `Abort` within the cycle.
    AskUser,
}

/// A resolver's decision for one conflict.
///
/// Resolvers are total: when their inputs are insufficient they return
/// [`Resolution::abort`] with a message instead of failing.
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    /// The chosen strategy.
    pub strategy: ResolutionStrategy,
    /// The winning or merged payload, when the strategy carries one.
    pub resolved: Option<T>,
    /// Optional human-readable explanation.
    pub message: Option<String>,
}

impl<T> Resolution<T> {
    /// Keep the local copy.
    pub fn use_local() -> Self {
        Self {
            strategy: ResolutionStrategy::UseLocal,
            resolved: None,
            message: None,
        }
    }

    /// Accept the remote copy.
    pub fn use_remote(entity: T) -> Self {
        Self {
            strategy: ResolutionStrategy::UseRemote,
            resolved: Some(entity),
            message: None,
        }
    }

    /// Apply a merged copy to both sides.
    pub fn merged(entity: T) -> Self {
        Self {
            strategy: ResolutionStrategy::Merge,
            resolved: Some(entity),
            message: None,
        }
    }

    /// Take no action, with an explanation.
    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            strategy: ResolutionStrategy::Abort,
            resolved: None,
            message: Some(message.into()),
        }
    }

    /// Defer to the application.
    pub fn ask_user() -> Self {
        Self {
            strategy: ResolutionStrategy::AskUser,
            resolved: None,
            message: None,
        }
    }

    /// Attaches a message to any resolution.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
