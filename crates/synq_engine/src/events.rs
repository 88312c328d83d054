//! Event bus and latest-value projections.
//!
//! Events fan out over a broadcast channel: multi-subscriber, lossy for
//! receivers that fall behind. Status and metadata use `watch` channels
//! instead — late subscribers always see the latest value, and snapshots
//! are monotone in emission time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use synq_protocol::{
    ChangeDetail, ChangeKind, ChangeOrigin, ConflictContext, SyncMetadata, SyncStatusSnapshot,
    Syncable,
};
use tokio::sync::{broadcast, watch};

/// Everything the engine tells the outside world.
#[derive(Debug, Clone)]
pub enum SyncEvent<T> {
    /// A cycle started with this many queued operations.
    SyncStarted {
        /// The syncing user.
        user_id: String,
        /// Queue length at cycle start.
        pending: u64,
    },
    /// Push-phase progress.
    SyncProgress {
        /// The syncing user.
        user_id: String,
        /// Operations finished so far.
        completed: u64,
        /// Operations the cycle started with.
        total: u64,
    },
    /// A cycle finished.
    SyncCompleted {
        /// The syncing user.
        user_id: String,
        /// Operations pushed successfully.
        synced: u64,
        /// Operations that failed terminally.
        failed: u64,
    },
    /// A cycle ended early or a cycle-level error occurred.
    SyncError {
        /// The syncing user.
        user_id: String,
        /// Error message.
        message: String,
        /// Optional backtrace or cause chain.
        detail: Option<String>,
    },
    /// The detector flagged a divergence.
    ConflictDetected {
        /// The conflict description.
        context: ConflictContext,
        /// Local copy at detection time.
        local: Option<T>,
        /// Remote copy at detection time.
        remote: Option<T>,
    },
    /// An entity changed, from CRUD, pull, or merge.
    DataChanged {
        /// The owning user.
        user_id: String,
        /// The entity after the change (the pre-delete copy for deletes).
        entity: T,
        /// What happened.
        kind: ChangeKind,
        /// Where the change came from.
        origin: ChangeOrigin,
    },
    /// One-shot snapshot delivered to a new subscriber.
    InitialSync {
        /// The user whose data was snapshotted.
        user_id: String,
        /// The user's entity set at subscription time.
        data: Vec<T>,
    },
    /// The active user changed.
    UserSwitched {
        /// Previous active user.
        previous: Option<String>,
        /// New active user.
        new: String,
        /// Whether the previous user still had queued operations.
        had_unsynced_data: bool,
    },
    /// An adapter change stream delivered an external mutation.
    ExternalChange {
        /// The observed change.
        change: ChangeDetail<T>,
    },
}

/// Multi-subscriber event fan-out.
pub struct EventBus<T> {
    sender: Arc<broadcast::Sender<SyncEvent<T>>>,
}

impl<T: Syncable> EventBus<T> {
    /// Bus with the default buffer.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Bus with an explicit per-subscriber buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emits to every live subscriber. Without subscribers the event is
    /// dropped, which is fine: events are observations, not commands.
    pub fn emit(&self, event: SyncEvent<T>) {
        let _ = self.sender.send(event);
    }

    /// Subscribes from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent<T>> {
        self.sender.subscribe()
    }

    /// Subscribes with a one-shot [`SyncEvent::InitialSync`] delivered
    /// before any live event: cold on subscribe, hot thereafter.
    pub fn subscribe_with_initial(
        &self,
        user_id: impl Into<String>,
        data: Vec<T>,
    ) -> EventSubscription<T> {
        EventSubscription {
            initial: Some(SyncEvent::InitialSync {
                user_id: user_id.into(),
                data,
            }),
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Syncable> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

/// A subscription whose first received event is the initial snapshot.
pub struct EventSubscription<T> {
    initial: Option<SyncEvent<T>>,
    receiver: broadcast::Receiver<SyncEvent<T>>,
}

impl<T: Syncable> EventSubscription<T> {
    /// Receives the next event. The initial snapshot comes first, then the
    /// live feed; `Err` means the bus is gone.
    pub async fn recv(&mut self) -> Result<SyncEvent<T>, broadcast::error::RecvError> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        self.receiver.recv().await
    }
}

/// Latest [`SyncStatusSnapshot`] per user.
pub struct StatusBoard {
    channels: Mutex<HashMap<String, watch::Sender<SyncStatusSnapshot>>>,
}

impl StatusBoard {
    /// Empty board.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, user_id: &str) -> watch::Sender<SyncStatusSnapshot> {
        self.channels
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| watch::channel(SyncStatusSnapshot::idle(user_id)).0)
            .clone()
    }

    /// Publishes a snapshot, replacing the user's latest.
    pub fn publish(&self, snapshot: SyncStatusSnapshot) {
        self.channel(&snapshot.user_id).send_replace(snapshot);
    }

    /// The user's latest snapshot.
    pub fn current(&self, user_id: &str) -> SyncStatusSnapshot {
        self.channel(user_id).borrow().clone()
    }

    /// Watches the user's snapshot stream. The receiver starts at the
    /// latest value.
    pub fn watch(&self, user_id: &str) -> watch::Receiver<SyncStatusSnapshot> {
        self.channel(user_id).subscribe()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest [`SyncMetadata`] per user, `None` before the first cycle.
pub struct MetadataBoard {
    channels: Mutex<HashMap<String, watch::Sender<Option<SyncMetadata>>>>,
}

impl MetadataBoard {
    /// Empty board.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, user_id: &str) -> watch::Sender<Option<SyncMetadata>> {
        self.channels
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Publishes freshly computed metadata.
    pub fn publish(&self, metadata: SyncMetadata) {
        self.channel(&metadata.user_id).send_replace(Some(metadata));
    }

    /// The user's latest metadata.
    pub fn current(&self, user_id: &str) -> Option<SyncMetadata> {
        self.channel(user_id).borrow().clone()
    }

    /// Watches the user's metadata stream.
    pub fn watch(&self, user_id: &str) -> watch::Receiver<Option<SyncMetadata>> {
        self.channel(user_id).subscribe()
    }
}

impl Default for MetadataBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use synq_protocol::SyncStatus;
    use synq_testkit::Note;

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let bus = EventBus::<Note>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::SyncStarted {
            user_id: "u1".into(),
            pending: 2,
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                SyncEvent::SyncStarted { user_id, pending } => {
                    assert_eq!(user_id, "u1");
                    assert_eq!(pending, 2);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn initial_sync_arrives_before_live_events() {
        let bus = EventBus::<Note>::new();
        let mut sub = bus.subscribe_with_initial("u1", vec![Note::new("n1", "u1", "t", "b")]);

        bus.emit(SyncEvent::SyncStarted {
            user_id: "u1".into(),
            pending: 0,
        });

        match sub.recv().await.unwrap() {
            SyncEvent::InitialSync { user_id, data } => {
                assert_eq!(user_id, "u1");
                assert_eq!(data.len(), 1);
            }
            other => panic!("expected initial sync, got {other:?}"),
        }
        assert!(matches!(
            sub.recv().await.unwrap(),
            SyncEvent::SyncStarted { .. }
        ));
    }

    #[test]
    fn status_board_serves_latest_to_late_watchers() {
        let board = StatusBoard::new();
        assert_eq!(board.current("u1").status, SyncStatus::Idle);

        board.publish(
            SyncStatusSnapshot::idle("u1")
                .started(3, Utc::now())
                .progressed(1, 0, 3),
        );

        let rx = board.watch("u1");
        assert_eq!(rx.borrow().status, SyncStatus::Syncing);
        assert_eq!(rx.borrow().completed_operations, 1);
    }

    #[test]
    fn metadata_board_starts_empty() {
        let board = MetadataBoard::new();
        assert!(board.current("u1").is_none());

        let meta = SyncMetadata::compute::<Note>("u1", &[]);
        board.publish(meta.clone());
        assert_eq!(board.current("u1").unwrap().data_hash, meta.data_hash);
    }
}
