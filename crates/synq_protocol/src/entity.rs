//! The entity capability trait.
//!
//! The engine is generic over any record type that can describe itself as an
//! ordered field map, diff itself against a prior version, and expose the
//! small set of bookkeeping fields every syncable record carries (stable id,
//! owning user, monotonic version, timestamps, tombstone flag).
//!
//! Field visibility is an orthogonal capability: a type may tag fields as
//! *local-only* (persisted locally, stripped from remote projections) or
//! *remote-only* (sent to the remote, stripped from local comparison). Both
//! default to empty.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Ordered field map — the in-process representation of an entity's fields.
pub type FieldMap = serde_json::Map<String, Value>;

/// Bookkeeping fields excluded from an entity's business payload.
pub const METADATA_FIELDS: &[&str] = &[
    "id",
    "owner_user_id",
    "version",
    "created_at",
    "modified_at",
    "is_deleted",
];

/// Capability set required of every record that participates in sync.
///
/// Invariant: `version` is strictly nondecreasing for a given
/// `(owner_user_id, id)` across successful writes. The engine relies on it
/// when deciding whether two divergent copies have already been reconciled.
pub trait Syncable:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable identifier, unique within the owning user's entity set.
    fn id(&self) -> &str;

    /// The user this record belongs to.
    fn owner_user_id(&self) -> &str;

    /// Monotonic version counter.
    fn version(&self) -> u64;

    /// Creation timestamp.
    fn created_at(&self) -> DateTime<Utc>;

    /// Last-modification timestamp.
    fn modified_at(&self) -> DateTime<Utc>;

    /// Tombstone flag. Deleted records still occupy storage until a later
    /// sync garbage-collects them.
    fn is_deleted(&self) -> bool;

    /// Fields persisted locally but never sent to the remote.
    fn local_only_fields() -> &'static [&'static str] {
        &[]
    }

    /// Fields sent to the remote but excluded from local comparison.
    fn remote_only_fields() -> &'static [&'static str] {
        &[]
    }

    /// Serializes the full record to a field map.
    ///
    /// The default implementation goes through serde; types that do not
    /// serialize to a JSON object must override this.
    fn to_map(&self) -> FieldMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => FieldMap::new(),
        }
    }

    /// Reconstructs a record from a field map.
    fn from_map(map: &FieldMap) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map.clone()))
    }

    /// Projection sent to the remote adapter: the full map minus
    /// local-only fields.
    fn to_remote_map(&self) -> FieldMap {
        strip(self.to_map(), Self::local_only_fields())
    }

    /// Projection used for local comparison: the full map minus
    /// remote-only fields.
    fn to_local_map(&self) -> FieldMap {
        strip(self.to_map(), Self::remote_only_fields())
    }

    /// The business payload: everything except bookkeeping metadata and
    /// local-only fields. This is what dedup hashing and the equivalence
    /// relation operate on.
    fn business_map(&self) -> FieldMap {
        let map = strip(self.to_map(), Self::local_only_fields());
        strip(map, METADATA_FIELDS)
    }

    /// Structural diff against a prior version.
    ///
    /// Returns the changed-fields map (new values; fields dropped since
    /// `prior` map to `null`), or `None` when the two serialize
    /// identically.
    fn diff(&self, prior: &Self) -> Option<FieldMap> {
        let new = self.to_map();
        let old = prior.to_map();
        let mut delta = FieldMap::new();

        for (key, value) in &new {
            if old.get(key) != Some(value) {
                delta.insert(key.clone(), value.clone());
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                delta.insert(key.clone(), Value::Null);
            }
        }

        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }
}

/// Returns true when two timestamps fall within `tolerance_ms` of each
/// other. Absorbs serialization rounding across storage round-trips.
pub fn timestamps_close(a: DateTime<Utc>, b: DateTime<Utc>, tolerance_ms: i64) -> bool {
    (a - b).num_milliseconds().abs() <= tolerance_ms
}

/// The engine's equivalence relation over entities.
///
/// Two copies are equivalent when they agree on identity, version, and
/// tombstone state, their timestamps fall within one second of each other,
/// and their business payloads are equal. Used by external-change dedup and
/// by the round-trip laws in the integration tests.
pub fn equivalent<T: Syncable>(a: &T, b: &T) -> bool {
    a.id() == b.id()
        && a.owner_user_id() == b.owner_user_id()
        && a.version() == b.version()
        && a.is_deleted() == b.is_deleted()
        && timestamps_close(a.modified_at(), b.modified_at(), 1_000)
        && timestamps_close(a.created_at(), b.created_at(), 1_000)
        && a.business_map() == b.business_map()
}

fn strip(mut map: FieldMap, fields: &[&str]) -> FieldMap {
    for field in fields {
        map.remove(*field);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Bookmark {
        id: String,
        owner_user_id: String,
        version: u64,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
        is_deleted: bool,
        url: String,
        label: String,
        open_count: u64,
    }

    impl Syncable for Bookmark {
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
            &["open_count"]
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bookmark() -> Bookmark {
        Bookmark {
            id: "b1".into(),
            owner_user_id: "u1".into(),
            version: 1,
            created_at: at(1_700_000_000),
            modified_at: at(1_700_000_000),
            is_deleted: false,
            url: "https://example.com".into(),
            label: "Example".into(),
            open_count: 3,
        }
    }

    #[test]
    fn map_roundtrip() {
        let original = bookmark();
        let map = original.to_map();
        let restored = Bookmark::from_map(&map).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn remote_projection_strips_local_only() {
        let map = bookmark().to_remote_map();
        assert!(!map.contains_key("open_count"));
        assert!(map.contains_key("url"));
    }

    #[test]
    fn business_map_strips_metadata() {
        let map = bookmark().business_map();
        assert!(!map.contains_key("id"));
        assert!(!map.contains_key("version"));
        assert!(!map.contains_key("open_count"));
        assert_eq!(map.len(), 2); // url + label
    }

    #[test]
    fn diff_reports_changed_fields_only() {
        let old = bookmark();
        let mut new = old.clone();
        new.label = "Renamed".into();
        new.version = 2;

        let delta = new.diff(&old).unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["label"], Value::String("Renamed".into()));
        assert_eq!(delta["version"], Value::from(2));
    }

    #[test]
    fn diff_of_identical_copies_is_none() {
        let a = bookmark();
        assert!(a.diff(&a.clone()).is_none());
    }

    #[test]
    fn equivalence_tolerates_timestamp_skew() {
        let a = bookmark();
        let mut b = a.clone();
        b.modified_at = a.modified_at + chrono::Duration::milliseconds(800);
        assert!(equivalent(&a, &b));

        b.modified_at = a.modified_at + chrono::Duration::milliseconds(1_500);
        assert!(!equivalent(&a, &b));
    }

    #[test]
    fn equivalence_ignores_local_only_fields() {
        let a = bookmark();
        let mut b = a.clone();
        b.open_count = 99;
        assert!(equivalent(&a, &b));
    }

    #[test]
    fn equivalence_rejects_version_divergence() {
        let a = bookmark();
        let mut b = a.clone();
        b.version = 2;
        assert!(!equivalent(&a, &b));
    }

    proptest::proptest! {
        #[test]
        fn diff_agrees_with_equality(label in ".{0,24}", url in ".{0,24}") {
            let base = bookmark();
            let mut other = base.clone();
            other.label = label;
            other.url = url;

            let changed = other.label != base.label || other.url != base.url;
            proptest::prop_assert_eq!(other.diff(&base).is_some(), changed);

            // A diff applied as a patch reproduces the newer copy.
            if let Some(delta) = other.diff(&base) {
                let mut patched = base.to_map();
                for (key, value) in delta {
                    patched.insert(key, value);
                }
                let rebuilt = Bookmark::from_map(&patched).unwrap();
                proptest::prop_assert_eq!(rebuilt, other);
            }
        }
    }
}
