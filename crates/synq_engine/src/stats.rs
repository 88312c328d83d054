//! Process-wide sync statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use synq_protocol::SyncStatistics;

/// Atomic aggregator behind [`SyncStatistics`].
///
/// Counters can be bumped from any task while snapshots are taken; values
/// are monotonically increasing until `reset`.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    total_syncs: AtomicU64,
    successful_syncs: AtomicU64,
    failed_syncs: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_auto_resolved: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl StatsRecorder {
    /// Fresh recorder with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one finished cycle.
    pub fn record_cycle(&self, success: bool, duration: Duration) {
        self.total_syncs.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_syncs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_syncs.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Records one detected conflict and whether it was settled without
    /// user involvement.
    pub fn record_conflict(&self, auto_resolved: bool) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
        if auto_resolved {
            self.conflicts_auto_resolved.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of the counters.
    pub fn snapshot(&self) -> SyncStatistics {
        let total = self.total_syncs.load(Ordering::Relaxed);
        let total_duration = Duration::from_millis(self.total_duration_ms.load(Ordering::Relaxed));
        SyncStatistics {
            total_syncs: total,
            successful_syncs: self.successful_syncs.load(Ordering::Relaxed),
            failed_syncs: self.failed_syncs.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_auto_resolved: self.conflicts_auto_resolved.load(Ordering::Relaxed),
            total_sync_duration: total_duration,
            average_duration: if total == 0 {
                Duration::ZERO
            } else {
                total_duration / total as u32
            },
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.total_syncs.store(0, Ordering::Relaxed);
        self.successful_syncs.store(0, Ordering::Relaxed);
        self.failed_syncs.store(0, Ordering::Relaxed);
        self.conflicts_detected.store(0, Ordering::Relaxed);
        self.conflicts_auto_resolved.store(0, Ordering::Relaxed);
        self.total_duration_ms.store(0, Ordering::Relaxed);
    }
}
