//! The conflict-resolution contract and the built-in resolvers.

use async_trait::async_trait;
use std::sync::Arc;
use synq_protocol::{ConflictContext, Resolution, ResolutionStrategy, Syncable};

/// Decides how a detected conflict is settled.
///
/// Resolvers are total: when the inputs are insufficient for their policy
/// they return an `Abort` resolution carrying a message, never an error.
#[async_trait]
pub trait ConflictResolver<T: Syncable>: Send + Sync {
    /// Produces a resolution for one conflict.
    async fn resolve(
        &self,
        local: Option<&T>,
        remote: Option<&T>,
        context: &ConflictContext,
    ) -> Resolution<T>;
}

/// Picks the side with the later `modified_at`; ties break toward the
/// higher `version`. The engine's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

#[async_trait]
impl<T: Syncable> ConflictResolver<T> for LastWriteWins {
    async fn resolve(
        &self,
        local: Option<&T>,
        remote: Option<&T>,
        _context: &ConflictContext,
    ) -> Resolution<T> {
        match (local, remote) {
            (None, None) => Resolution::abort("last-write-wins: both sides absent"),
            (Some(_), None) => Resolution::use_local(),
            (None, Some(r)) => Resolution::use_remote(r.clone()),
            (Some(l), Some(r)) => {
                if l.modified_at() > r.modified_at() {
                    Resolution::use_local()
                } else if r.modified_at() > l.modified_at() {
                    Resolution::use_remote(r.clone())
                } else if l.version() >= r.version() {
                    Resolution::use_local()
                } else {
                    Resolution::use_remote(r.clone())
                }
            }
        }
    }
}

/// Always keeps the local copy; aborts when there is none.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPriority;

#[async_trait]
impl<T: Syncable> ConflictResolver<T> for LocalPriority {
    async fn resolve(
        &self,
        local: Option<&T>,
        _remote: Option<&T>,
        _context: &ConflictContext,
    ) -> Resolution<T> {
        match local {
            Some(_) => Resolution::use_local(),
            None => Resolution::abort("local-priority: no local copy"),
        }
    }
}

/// Always accepts the remote copy; aborts when there is none.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemotePriority;

#[async_trait]
impl<T: Syncable> ConflictResolver<T> for RemotePriority {
    async fn resolve(
        &self,
        _local: Option<&T>,
        remote: Option<&T>,
        _context: &ConflictContext,
    ) -> Resolution<T> {
        match remote {
            Some(r) => Resolution::use_remote(r.clone()),
            None => Resolution::abort("remote-priority: no remote copy"),
        }
    }
}

/// Combine function supplied to [`MergeResolver`]. Returning `None` aborts
/// the resolution.
pub type MergeFn<T> = dyn Fn(Option<&T>, Option<&T>) -> Option<T> + Send + Sync;

/// Settles conflicts through a user-supplied combine function. The merged
/// payload is applied to both sides by the engine.
pub struct MergeResolver<T> {
    merge: Arc<MergeFn<T>>,
}

impl<T> MergeResolver<T> {
    /// Creates a resolver around a combine function.
    pub fn new(merge: impl Fn(Option<&T>, Option<&T>) -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            merge: Arc::new(merge),
        }
    }
}

#[async_trait]
impl<T: Syncable> ConflictResolver<T> for MergeResolver<T> {
    async fn resolve(
        &self,
        local: Option<&T>,
        remote: Option<&T>,
        _context: &ConflictContext,
    ) -> Resolution<T> {
        if local.is_none() && remote.is_none() {
            return Resolution::abort("merge: both sides absent");
        }
        match (self.merge)(local, remote) {
            Some(merged) => Resolution::merged(merged),
            None => Resolution::abort("merge: combine function produced nothing"),
        }
    }
}

/// Prompt callback supplied to [`UserPromptResolver`]. The callback may
/// return any resolution, including a merged payload.
pub type PromptFn<T> =
    dyn Fn(&ConflictContext, Option<&T>, Option<&T>) -> Resolution<T> + Send + Sync;

/// Delegates the decision to an application callback, then maps choices
/// that reference an unavailable side to `Abort`.
pub struct UserPromptResolver<T> {
    prompt: Arc<PromptFn<T>>,
}

impl<T> UserPromptResolver<T> {
    /// Creates a resolver around a prompt callback.
    pub fn new(
        prompt: impl Fn(&ConflictContext, Option<&T>, Option<&T>) -> Resolution<T>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            prompt: Arc::new(prompt),
        }
    }
}

#[async_trait]
impl<T: Syncable> ConflictResolver<T> for UserPromptResolver<T> {
    async fn resolve(
        &self,
        local: Option<&T>,
        remote: Option<&T>,
        context: &ConflictContext,
    ) -> Resolution<T> {
        let mut resolution = (self.prompt)(context, local, remote);
        match resolution.strategy {
            ResolutionStrategy::UseLocal if local.is_none() => {
                Resolution::abort("prompt chose local but no local copy exists")
            }
            ResolutionStrategy::UseRemote => {
                if resolution.resolved.is_none() {
                    resolution.resolved = remote.cloned();
                }
                if resolution.resolved.is_none() {
                    Resolution::abort("prompt chose remote but no remote copy exists")
                } else {
                    resolution
                }
            }
            ResolutionStrategy::Merge if resolution.resolved.is_none() => {
                Resolution::abort("prompt chose merge without a merged payload")
            }
            _ => resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use synq_protocol::ConflictKind;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        id: String,
        owner_user_id: String,
        version: u64,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
        is_deleted: bool,
        body: String,
    }

    impl Syncable for Doc {
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

    fn doc(version: u64, modified_offset_s: i64, body: &str) -> Doc {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Doc {
            id: "d1".into(),
            owner_user_id: "u1".into(),
            version,
            created_at: base,
            modified_at: base + Duration::seconds(modified_offset_s),
            is_deleted: false,
            body: body.into(),
        }
    }

    fn ctx() -> ConflictContext {
        ConflictContext::new("u1", "d1", ConflictKind::BothModified)
    }

    #[tokio::test]
    async fn last_write_wins_picks_later_side() {
        let older = doc(1, 0, "old");
        let newer = doc(2, 10, "new");

        let r = LastWriteWins
            .resolve(Some(&older), Some(&newer), &ctx())
            .await;
        assert_eq!(r.strategy, ResolutionStrategy::UseRemote);
        assert_eq!(r.resolved.unwrap().body, "new");

        let r = LastWriteWins
            .resolve(Some(&newer), Some(&older), &ctx())
            .await;
        assert_eq!(r.strategy, ResolutionStrategy::UseLocal);
    }

    #[tokio::test]
    async fn last_write_wins_ties_break_on_version() {
        let low = doc(1, 0, "low");
        let high = doc(3, 0, "high");

        let r = LastWriteWins.resolve(Some(&low), Some(&high), &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::UseRemote);

        let r = LastWriteWins.resolve(Some(&high), Some(&low), &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::UseLocal);
    }

    #[tokio::test]
    async fn last_write_wins_aborts_with_nothing_to_pick() {
        let r: Resolution<Doc> = LastWriteWins.resolve(None, None, &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::Abort);
        assert!(r.message.is_some());
    }

    #[tokio::test]
    async fn priority_resolvers_abort_when_their_side_is_absent() {
        let d = doc(1, 0, "x");

        let r = LocalPriority.resolve(Some(&d), None, &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::UseLocal);
        let r: Resolution<Doc> = LocalPriority.resolve(None, Some(&d), &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::Abort);

        let r = RemotePriority.resolve(None, Some(&d), &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::UseRemote);
        let r: Resolution<Doc> = RemotePriority.resolve(Some(&d), None, &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::Abort);
    }

    #[tokio::test]
    async fn merge_resolver_combines_both_sides() {
        let resolver = MergeResolver::new(|local: Option<&Doc>, remote: Option<&Doc>| {
            let mut merged = remote.or(local)?.clone();
            if let (Some(l), Some(r)) = (local, remote) {
                merged.body = format!("{}+{}", l.body, r.body);
                merged.version = l.version.max(r.version) + 1;
            }
            Some(merged)
        });

        let l = doc(2, 0, "a");
        let r = doc(3, 5, "b");
        let resolution = resolver.resolve(Some(&l), Some(&r), &ctx()).await;
        assert_eq!(resolution.strategy, ResolutionStrategy::Merge);
        let merged = resolution.resolved.unwrap();
        assert_eq!(merged.body, "a+b");
        assert_eq!(merged.version, 4);

        let nothing: Resolution<Doc> = resolver.resolve(None, None, &ctx()).await;
        assert_eq!(nothing.strategy, ResolutionStrategy::Abort);
    }

    #[tokio::test]
    async fn prompt_resolver_maps_unavailable_sides_to_abort() {
        let choose_local =
            UserPromptResolver::new(|_: &ConflictContext, _: Option<&Doc>, _: Option<&Doc>| {
                Resolution::use_local()
            });
        let d = doc(1, 0, "x");

        let r = choose_local.resolve(Some(&d), None, &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::UseLocal);

        let r: Resolution<Doc> = choose_local.resolve(None, Some(&d), &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::Abort);
    }

    #[tokio::test]
    async fn prompt_resolver_fills_remote_payload() {
        let choose_remote = UserPromptResolver::new(
            |_: &ConflictContext, _: Option<&Doc>, _: Option<&Doc>| Resolution {
                strategy: ResolutionStrategy::UseRemote,
                resolved: None,
                message: None,
            },
        );
        let d = doc(1, 0, "remote-copy");

        let r = choose_remote.resolve(None, Some(&d), &ctx()).await;
        assert_eq!(r.strategy, ResolutionStrategy::UseRemote);
        assert_eq!(r.resolved.unwrap().body, "remote-copy");
    }
}
