//! Offline-first bidirectional sync engine for user-scoped entities.
//!
//! A client application mutates entities against a local store through
//! [`SynqManager`]; the engine durably queues those mutations, pushes them
//! to a remote store, pulls remote mutations back, and reconciles divergent
//! copies through a pluggable [`ConflictResolver`]. Storage technology is
//! the host's business — the engine drives the [`LocalAdapter`] and
//! [`RemoteAdapter`] seams and owns everything between them: the operation
//! queue, the per-user sync state machine, conflict detection and
//! resolution, retry policy, external-change deduplication, and schema
//! migration of locally persisted records.
//!
//! ```ignore
//! use synq_engine::{SynqConfig, SynqManager};
//!
//! let manager = SynqManager::new(SynqConfig::new(), local, remote)?;
//! manager.initialize().await?;
//!
//! manager.save(note, "u1").await?;
//! let report = manager.sync("u1").await?;
//! assert_eq!(report.failed, 0);
//! ```

mod adapter;
mod config;
mod detector;
mod engine;
mod error;
mod events;
mod manager;
mod migration;
mod observer;
mod queue;
mod resolver;
mod stats;

pub use adapter::{
    closed_stream, AlwaysOnline, ConnectivityProbe, LocalAdapter, QueryFilter, RemoteAdapter,
    SyncScope, TransactionFuture, TransactionWork,
};
pub use config::{
    MigrationErrorHandler, SyncDirection, SyncOptions, SynqConfig, UserSwitchStrategy,
};
pub use detector::ConflictDetector;
pub use engine::{ResumeSignal, SyncEngine, SyncReport, SyncRequest};
pub use error::{AdapterSide, SynqError, SynqResult};
pub use events::{EventBus, EventSubscription, MetadataBoard, StatusBoard, SyncEvent};
pub use manager::{MutationOptions, SynqManager, UserSwitchResult};
pub use migration::{DataMigration, MigrationExecutor};
pub use observer::{MiddlewareChain, ObserverRegistry, SyncMiddleware, SyncObserver};
pub use queue::QueueManager;
pub use resolver::{
    ConflictResolver, LastWriteWins, LocalPriority, MergeFn, MergeResolver, PromptFn,
    RemotePriority, UserPromptResolver,
};
pub use stats::StatsRecorder;

// The value types travel with the engine's API surface.
pub use synq_protocol::{
    equivalent, ChangeDetail, ChangeKind, ChangeOrigin, ConflictContext, ConflictKind, FieldMap,
    OperationKind, Resolution, ResolutionStrategy, SyncMetadata, SyncOperation, SyncStatistics,
    SyncStatus, SyncStatusSnapshot, Syncable,
};
