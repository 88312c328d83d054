//! Conflict detection.

use synq_protocol::{ConflictKind, Syncable};

/// Pure, stateless classifier for a (local, remote) entity pair.
///
/// Calling it twice on the same inputs yields the same answer; it touches
/// nothing. The timestamp tolerance absorbs serialization rounding between
/// stores, and equal versions mean the pair was already reconciled — time
/// skew alone is then ignored.
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    tolerance_ms: i64,
}

impl ConflictDetector {
    /// Default modification-time tolerance.
    pub const DEFAULT_TOLERANCE_MS: i64 = 10;

    /// Detector with the default tolerance.
    pub fn new() -> Self {
        Self {
            tolerance_ms: Self::DEFAULT_TOLERANCE_MS,
        }
    }

    /// Detector with a custom tolerance.
    pub fn with_tolerance_ms(tolerance_ms: i64) -> Self {
        Self { tolerance_ms }
    }

    /// Classifies the pair for `user_id`. `None` means no conflict: the
    /// caller treats the remote as source of truth, or the local as an
    /// outgoing create.
    pub fn detect<T: Syncable>(
        &self,
        user_id: &str,
        local: Option<&T>,
        remote: Option<&T>,
    ) -> Option<ConflictKind> {
        if let Some(remote) = remote {
            if remote.owner_user_id() != user_id {
                return Some(ConflictKind::UserMismatch);
            }
        }

        let (local, remote) = match (local, remote) {
            (Some(l), Some(r)) => (l, r),
            _ => return None,
        };

        if local.is_deleted() != remote.is_deleted() {
            return Some(ConflictKind::DeletionConflict);
        }
        if local.is_deleted() {
            return None;
        }

        let skew = (local.modified_at() - remote.modified_at())
            .num_milliseconds()
            .abs();
        if skew > self.tolerance_ms && local.version() != remote.version() {
            return Some(ConflictKind::BothModified);
        }

        None
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}
