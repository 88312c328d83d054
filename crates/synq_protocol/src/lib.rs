//! Value types and the entity capability trait shared by the Synq engine.
//!
//! This crate defines *what* flows through a sync cycle: syncable entities,
//! queued operations, conflict descriptions and resolutions, per-user sync
//! metadata, externally observed change events, and status/statistics
//! snapshots. The engine crate (`synq_engine`) defines *how* those values
//! move between a local and a remote store.
//!
//! Everything here is a plain value: serializable, cloneable, and free of
//! I/O. Adapters persist these types however they like; the in-process
//! representation of an entity's fields is an ordered JSON map
//! ([`FieldMap`]).

mod change;
mod conflict;
mod entity;
mod metadata;
mod operation;
mod status;

pub use change::{ChangeDetail, ChangeKind, ChangeOrigin};
pub use conflict::{ConflictContext, ConflictKind, Resolution, ResolutionStrategy};
pub use entity::{equivalent, timestamps_close, FieldMap, Syncable, METADATA_FIELDS};
pub use metadata::SyncMetadata;
pub use operation::{OperationKind, SyncOperation};
pub use status::{SyncStatistics, SyncStatus, SyncStatusSnapshot};
