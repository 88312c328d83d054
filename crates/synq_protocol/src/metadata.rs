//! Per-user sync metadata.

use crate::entity::Syncable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Summary of a user's entity set, stored on both sides after a successful
/// cycle. Equal hashes and counts let a later cycle short-circuit an
/// unchanged pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// The user this summary belongs to.
    pub user_id: String,
    /// When the last successful sync finished.
    pub last_sync_at: DateTime<Utc>,
    /// Stable content hash over the live entities' business payloads.
    pub data_hash: String,
    /// Number of live (non-tombstoned) entities.
    pub item_count: u64,
}

impl SyncMetadata {
    /// Computes metadata from a snapshot of a user's entities.
    ///
    /// Tombstoned records are excluded. The hash is order-independent:
    /// entities are sorted by id and each business payload is canonicalized
    /// through a sorted-key map before hashing, so storage iteration order
    /// and local-only fields never affect it.
    pub fn compute<T: Syncable>(user_id: impl Into<String>, entities: &[T]) -> Self {
        let mut live: Vec<&T> = entities.iter().filter(|e| !e.is_deleted()).collect();
        live.sort_by(|a, b| a.id().cmp(b.id()));

        let mut hasher = Sha256::new();
        for entity in &live {
            hasher.update(entity.id().as_bytes());
            hasher.update([0u8]);
            let business_map = entity.business_map();
            let canonical: BTreeMap<&String, &serde_json::Value> =
                business_map.iter().collect();
            // BTreeMap serialization is key-sorted, which is all the
            // canonicalization the hash needs.
            if let Ok(bytes) = serde_json::to_vec(&canonical) {
                hasher.update(&bytes);
            }
            hasher.update([0u8]);
        }

        let digest = hasher.finalize();
        Self {
            user_id: user_id.into(),
            last_sync_at: Utc::now(),
            data_hash: hex_encode(digest.as_slice()),
            item_count: live.len() as u64,
        }
    }

    /// True when two summaries describe the same content.
    pub fn matches(&self, other: &SyncMetadata) -> bool {
        self.data_hash == other.data_hash && self.item_count == other.item_count
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
