//! Externally observed change events.

use crate::entity::Syncable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an observed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new entity appeared.
    Create,
    /// An existing entity changed.
    Update,
    /// An entity was removed or tombstoned.
    Delete,
}

impl ChangeKind {
    /// Stable lowercase name, used in dedup keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// Where a data change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A mutation made through the facade's own CRUD surface.
    Local,
    /// A mutation observed from, or authored by, the remote store.
    Remote,
    /// The outcome of a merge resolution applied to both sides.
    Merged,
}

impl ChangeOrigin {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOrigin::Local => "local",
            ChangeOrigin::Remote => "remote",
            ChangeOrigin::Merged => "merged",
        }
    }
}

/// One mutation observed from an adapter's change stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Syncable")]
pub struct ChangeDetail<T> {
    /// What happened.
    pub kind: ChangeKind,
    /// The affected entity.
    pub entity_id: String,
    /// The owning user.
    pub user_id: String,
    /// When the change was observed at its source.
    pub timestamp: DateTime<Utc>,
    /// The new snapshot, present for create/update.
    pub entity: Option<T>,
}

impl<T: Syncable> ChangeDetail<T> {
    /// A create observation.
    pub fn create(user_id: impl Into<String>, entity: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Create,
            entity_id: entity.id().to_string(),
            user_id: user_id.into(),
            timestamp,
            entity: Some(entity),
        }
    }

    /// An update observation.
    pub fn update(user_id: impl Into<String>, entity: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Update,
            entity_id: entity.id().to_string(),
            user_id: user_id.into(),
            timestamp,
            entity: Some(entity),
        }
    }

    /// A delete observation.
    pub fn delete(
        user_id: impl Into<String>,
        entity_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_id: entity_id.into(),
            user_id: user_id.into(),
            timestamp,
            entity: None,
        }
    }

    /// Dedup key: kind, entity, user, and observation time, millisecond
    /// precision. Two deliveries of the same change produce the same key.
    pub fn change_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind.as_str(),
            self.entity_id,
            self.user_id,
            self.timestamp.timestamp_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tiny {
        id: String,
        owner_user_id: String,
        version: u64,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
        is_deleted: bool,
    }

    impl Syncable for Tiny {
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
    }

    #[test]
    fn change_key_is_deterministic() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a: ChangeDetail<Tiny> = ChangeDetail::delete("u1", "e1", t);
        let b: ChangeDetail<Tiny> = ChangeDetail::delete("u1", "e1", t);
        assert_eq!(a.change_key(), b.change_key());
        assert_eq!(a.change_key(), "delete:e1:u1:1700000000000");
    }

    #[test]
    fn create_captures_entity_id() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let e = Tiny {
            id: "e9".into(),
            owner_user_id: "u1".into(),
            version: 1,
            created_at: t,
            modified_at: t,
            is_deleted: false,
        };
        let change = ChangeDetail::create("u1", e, t);
        assert_eq!(change.entity_id, "e9");
        assert!(change.entity.is_some());
    }
}
