//! The fixture entity used across engine tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use synq_protocol::Syncable;

/// A small user-scoped document with one local-only field (`pinned_locally`
/// never leaves the device) and one remote-only field (`server_revision`
/// never participates in local comparison).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    /// Stable identifier.
    pub id: String,
    /// Owning user.
    pub owner_user_id: String,
    /// Monotonic version counter.
    pub version: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modification timestamp.
    pub modified_at: DateTime<Utc>,
    /// Tombstone flag.
    pub is_deleted: bool,
    /// Display title.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Device-side pin marker; never synced.
    #[serde(default)]
    pub pinned_locally: bool,
    /// Server bookkeeping token; never compared locally.
    #[serde(default)]
    pub server_revision: Option<String>,
}

impl Note {
    /// A live version-1 note stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        owner_user_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_user_id: owner_user_id.into(),
            version: 1,
            created_at: now,
            modified_at: now,
            is_deleted: false,
            title: title.into(),
            body: body.into(),
            pinned_locally: false,
            server_revision: None,
        }
    }

    /// A copy with a new body, a bumped version, and `modified_at` set to
    /// the given time.
    #[must_use]
    pub fn edited(&self, body: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.body = body.into();
        next.version += 1;
        next.modified_at = at;
        next
    }

    /// A tombstoned copy with a bumped version.
    #[must_use]
    pub fn tombstoned(&self, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.is_deleted = true;
        next.version += 1;
        next.modified_at = at;
        next
    }

    /// Overrides both timestamps, for tests that steer the clock.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_at = timestamp;
        self.modified_at = timestamp;
        self
    }
}

impl Syncable for Note {
    fn id(&self) -> &str {
        &self.id
    }

    fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn local_only_fields() -> &'static [&'static str] {
        &["pinned_locally"]
    }

    fn remote_only_fields() -> &'static [&'static str] {
        &["server_revision"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_projection_drops_the_pin() {
        let mut note = Note::new("n1", "u1", "t", "b");
        note.pinned_locally = true;

        let remote_map = note.to_remote_map();
        assert!(!remote_map.contains_key("pinned_locally"));
        assert!(remote_map.contains_key("server_revision"));
    }

    #[test]
    fn local_projection_drops_the_revision() {
        let mut note = Note::new("n1", "u1", "t", "b");
        note.server_revision = Some("rev-9".into());

        let local_map = note.to_local_map();
        assert!(!local_map.contains_key("server_revision"));
        assert!(local_map.contains_key("pinned_locally"));
    }

    #[test]
    fn edited_bumps_version_and_time() {
        let note = Note::new("n1", "u1", "t", "b");
        let later = note.modified_at + chrono::Duration::seconds(10);
        let edited = note.edited("new body", later);

        assert_eq!(edited.version, 2);
        assert_eq!(edited.modified_at, later);
        assert_eq!(edited.created_at, note.created_at);
    }
}
