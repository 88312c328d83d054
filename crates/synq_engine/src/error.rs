//! Error types for the sync engine.

use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type SynqResult<T> = Result<T, SynqError>;

/// Which adapter raised a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSide {
    /// The local storage adapter.
    Local,
    /// The remote storage adapter.
    Remote,
}

impl std::fmt::Display for AdapterSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterSide::Local => write!(f, "local"),
            AdapterSide::Remote => write!(f, "remote"),
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SynqError {
    /// Neither the connectivity probe nor the remote adapter report a link.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// An adapter raised.
    #[error("{side} adapter error: {message}")]
    Adapter {
        /// Which adapter failed.
        side: AdapterSide,
        /// Error message.
        message: String,
    },

    /// A sync cycle is already running for this user.
    #[error("sync already in progress for user {user_id}")]
    ConcurrentSync {
        /// The user whose cycle was rejected.
        user_id: String,
    },

    /// The cycle was cancelled. Internal sentinel: `synchronize` converts
    /// it into a normal report with `was_cancelled` set.
    #[error("sync cancelled")]
    Cancelled,

    /// The cycle overran its deadline. Internal sentinel, converted into a
    /// normal report with an appended timeout error.
    #[error("sync timed out after {limit:?}")]
    Timeout {
        /// The deadline that was exceeded.
        limit: Duration,
    },

    /// No registered migration starts at the stored schema version.
    #[error("no migration registered from schema version {from_version}")]
    MigrationMissing {
        /// The stored schema version with no outgoing migration.
        from_version: u32,
    },

    /// A migration does not move the schema version forward.
    #[error("migration from {from_version} to {to_version} does not advance the schema")]
    MigrationInvalid {
        /// Declared source version.
        from_version: u32,
        /// Declared target version.
        to_version: u32,
    },

    /// A user switch was rejected by the active strategy.
    #[error("user switch rejected: {0}")]
    UserSwitchRejected(String),

    /// An argument failed validation (empty id or user id).
    #[error("validation error: {0}")]
    Validation(String),

    /// A field map could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SynqError {
    /// Creates a local-adapter failure.
    pub fn local_adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            side: AdapterSide::Local,
            message: message.into(),
        }
    }

    /// Creates a remote-adapter failure.
    pub fn remote_adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            side: AdapterSide::Remote,
            message: message.into(),
        }
    }

    /// Returns true if a failed operation may be retried on a later cycle.
    ///
    /// Network loss and adapter failures (either side) are retryable; the
    /// per-operation `max_retries` cap bounds how often. Everything else —
    /// validation, sentinels, rejected switches — is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SynqError::NetworkUnavailable | SynqError::Adapter { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SynqError::NetworkUnavailable.is_retryable());
        assert!(SynqError::local_adapter("disk full").is_retryable());
        assert!(SynqError::remote_adapter("503").is_retryable());

        assert!(!SynqError::Cancelled.is_retryable());
        assert!(!SynqError::Validation("empty id".into()).is_retryable());
        assert!(!SynqError::Timeout {
            limit: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(!SynqError::ConcurrentSync {
            user_id: "u1".into()
        }
        .is_retryable());
    }

    #[test]
    fn display_names_the_side() {
        let err = SynqError::remote_adapter("connection reset");
        assert_eq!(err.to_string(), "remote adapter error: connection reset");
    }

    #[test]
    fn timeout_display_includes_limit() {
        let err = SynqError::Timeout {
            limit: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("30"));
    }
}
