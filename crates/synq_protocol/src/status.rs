//! Status snapshots and process-wide statistics values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a user's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No cycle has run or is running.
    Idle,
    /// A cycle is in progress.
    Syncing,
    /// A cycle is blocked on the pause latch.
    Paused,
    /// The last cycle was cancelled.
    Cancelled,
    /// The last cycle finished with no failed operations.
    Completed,
    /// The last cycle finished with failures or an error.
    Failed,
}

impl SyncStatus {
    /// True while a cycle holds the per-user guard.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Syncing | SyncStatus::Paused)
    }
}

/// Latest per-user status projection, published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    /// The user this snapshot describes.
    pub user_id: String,
    /// Current lifecycle state.
    pub status: SyncStatus,
    /// Operations still waiting in the queue.
    pub pending_operations: u64,
    /// Operations completed in the current or last cycle.
    pub completed_operations: u64,
    /// Operations failed in the current or last cycle.
    pub failed_operations: u64,
    /// Cycle progress in `0.0..=1.0`.
    pub progress: f64,
    /// When the last cycle started.
    pub last_started_at: Option<DateTime<Utc>>,
    /// When the last cycle finished.
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Errors accumulated by the current or last cycle.
    pub errors: Vec<String>,
}

impl SyncStatusSnapshot {
    /// The idle snapshot every user starts from.
    pub fn idle(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: SyncStatus::Idle,
            pending_operations: 0,
            completed_operations: 0,
            failed_operations: 0,
            progress: 0.0,
            last_started_at: None,
            last_completed_at: None,
            errors: Vec::new(),
        }
    }

    /// Transition into a running cycle with `pending` queued operations.
    #[must_use]
    pub fn started(mut self, pending: u64, at: DateTime<Utc>) -> Self {
        self.status = SyncStatus::Syncing;
        self.pending_operations = pending;
        self.completed_operations = 0;
        self.failed_operations = 0;
        self.progress = 0.0;
        self.last_started_at = Some(at);
        self.errors.clear();
        self
    }

    /// Progress update from the push phase.
    #[must_use]
    pub fn progressed(mut self, completed: u64, failed: u64, total: u64) -> Self {
        self.completed_operations = completed;
        self.failed_operations = failed;
        self.pending_operations = total.saturating_sub(completed);
        self.progress = if total == 0 {
            1.0
        } else {
            (completed as f64 / total as f64).clamp(0.0, 1.0)
        };
        self
    }

    /// Terminal transition.
    #[must_use]
    pub fn finished(
        mut self,
        status: SyncStatus,
        pending: u64,
        errors: Vec<String>,
        at: DateTime<Utc>,
    ) -> Self {
        self.status = status;
        self.pending_operations = pending;
        self.progress = 1.0;
        self.last_completed_at = Some(at);
        self.errors = errors;
        self
    }

    /// Non-terminal status flip (pause/resume) that keeps counters intact.
    #[must_use]
    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.status = status;
        self
    }
}

/// Process-wide sync counters. A plain value: the live aggregator lives in
/// the engine crate and hands out copies of this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatistics {
    /// Cycles started.
    pub total_syncs: u64,
    /// Cycles that finished with no failed operations.
    pub successful_syncs: u64,
    /// Cycles that failed, timed out, or were cancelled.
    pub failed_syncs: u64,
    /// Conflicts detected across all cycles.
    pub conflicts_detected: u64,
    /// Conflicts settled without user involvement.
    pub conflicts_auto_resolved: u64,
    /// Wall-clock time spent in cycles, summed.
    pub total_sync_duration: Duration,
    /// `total_sync_duration / total_syncs`, zero before the first cycle.
    pub average_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn idle_snapshot_defaults() {
        let s = SyncStatusSnapshot::idle("u1");
        assert_eq!(s.status, SyncStatus::Idle);
        assert_eq!(s.progress, 0.0);
        assert!(!s.status.is_active());
    }

    #[test]
    fn progress_is_clamped_and_total_aware() {
        let s = SyncStatusSnapshot::idle("u1").progressed(2, 1, 4);
        assert_eq!(s.completed_operations, 2);
        assert_eq!(s.failed_operations, 1);
        assert_eq!(s.pending_operations, 2);
        assert!((s.progress - 0.5).abs() < f64::EPSILON);

        let empty = SyncStatusSnapshot::idle("u1").progressed(0, 0, 0);
        assert!((empty.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn started_resets_counters_and_errors() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let s = SyncStatusSnapshot::idle("u1")
            .finished(SyncStatus::Failed, 3, vec!["boom".into()], t)
            .started(5, t);
        assert_eq!(s.status, SyncStatus::Syncing);
        assert_eq!(s.pending_operations, 5);
        assert!(s.errors.is_empty());
        assert!(s.status.is_active());
    }

    #[test]
    fn paused_is_active() {
        assert!(SyncStatus::Paused.is_active());
        assert!(!SyncStatus::Cancelled.is_active());
    }
}
