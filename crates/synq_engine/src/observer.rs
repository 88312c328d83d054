//! Observer and middleware dispatch.
//!
//! Observers are notification-only: the engine calls them sequentially in
//! registration order and logs (never propagates) their failures, so an
//! observer cannot abort a cycle. Middleware is the opposite — it runs in
//! registration order and a failure aborts the current operation or
//! pre-save step, surfacing the error normally.

use crate::engine::SyncReport;
use crate::error::{SynqError, SynqResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use synq_protocol::{ChangeDetail, ConflictContext, SyncOperation, Syncable};

/// Side-effect-tolerant listener for engine lifecycle moments.
#[async_trait]
pub trait SyncObserver<T: Syncable>: Send + Sync {
    /// An external change arrived from an adapter stream. Called before
    /// any deduplication, so every delivery is observed.
    async fn on_external_change(&self, _change: &ChangeDetail<T>) -> SynqResult<()> {
        Ok(())
    }

    /// A migration step is about to run.
    async fn on_migration_start(&self, _from_version: u32, _to_version: u32) -> SynqResult<()> {
        Ok(())
    }

    /// All migration steps finished; `version` is the stored version now.
    async fn on_migration_end(&self, _version: u32) -> SynqResult<()> {
        Ok(())
    }

    /// A migration step failed.
    async fn on_migration_error(&self, _error: &SynqError) -> SynqResult<()> {
        Ok(())
    }

    /// A user switch is starting.
    async fn on_user_switch_start(&self, _from: Option<&str>, _to: &str) -> SynqResult<()> {
        Ok(())
    }

    /// A user switch finished, successfully or not.
    async fn on_user_switch_end(
        &self,
        _from: Option<&str>,
        _to: &str,
        _success: bool,
    ) -> SynqResult<()> {
        Ok(())
    }
}

/// Registration-ordered observer collection with log-and-swallow dispatch.
pub struct ObserverRegistry<T: Syncable> {
    observers: RwLock<Vec<Arc<dyn SyncObserver<T>>>>,
}

impl<T: Syncable> ObserverRegistry<T> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Appends an observer.
    pub fn register(&self, observer: Arc<dyn SyncObserver<T>>) {
        self.observers.write().push(observer);
    }

    /// Removes every observer.
    pub fn clear(&self) {
        self.observers.write().clear();
    }

    fn all(&self) -> Vec<Arc<dyn SyncObserver<T>>> {
        self.observers.read().clone()
    }

    /// Notifies every observer of an external change.
    pub async fn notify_external_change(&self, change: &ChangeDetail<T>) {
        for observer in self.all() {
            if let Err(error) = observer.on_external_change(change).await {
                tracing::warn!(%error, "observer failed in on_external_change");
            }
        }
    }

    /// Notifies every observer that a migration step is starting.
    pub async fn notify_migration_start(&self, from_version: u32, to_version: u32) {
        for observer in self.all() {
            if let Err(error) = observer.on_migration_start(from_version, to_version).await {
                tracing::warn!(%error, "observer failed in on_migration_start");
            }
        }
    }

    /// Notifies every observer that migrations finished.
    pub async fn notify_migration_end(&self, version: u32) {
        for observer in self.all() {
            if let Err(error) = observer.on_migration_end(version).await {
                tracing::warn!(%error, "observer failed in on_migration_end");
            }
        }
    }

    /// Notifies every observer of a migration failure.
    pub async fn notify_migration_error(&self, failure: &SynqError) {
        for observer in self.all() {
            if let Err(error) = observer.on_migration_error(failure).await {
                tracing::warn!(%error, "observer failed in on_migration_error");
            }
        }
    }

    /// Notifies every observer that a user switch is starting.
    pub async fn notify_user_switch_start(&self, from: Option<&str>, to: &str) {
        for observer in self.all() {
            if let Err(error) = observer.on_user_switch_start(from, to).await {
                tracing::warn!(%error, "observer failed in on_user_switch_start");
            }
        }
    }

    /// Notifies every observer that a user switch finished.
    pub async fn notify_user_switch_end(&self, from: Option<&str>, to: &str, success: bool) {
        for observer in self.all() {
            if let Err(error) = observer.on_user_switch_end(from, to, success).await {
                tracing::warn!(%error, "observer failed in on_user_switch_end");
            }
        }
    }
}

impl<T: Syncable> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Transform and interception hooks threaded through CRUD and sync.
#[async_trait]
pub trait SyncMiddleware<T: Syncable>: Send + Sync {
    /// Runs before a cycle's push phase starts.
    async fn before_sync(&self, _user_id: &str) -> SynqResult<()> {
        Ok(())
    }

    /// Runs after a cycle assembles its report.
    async fn after_sync(&self, _user_id: &str, _report: &SyncReport) -> SynqResult<()> {
        Ok(())
    }

    /// Runs before each queued operation is dispatched.
    async fn before_operation(&self, _operation: &SyncOperation<T>) -> SynqResult<()> {
        Ok(())
    }

    /// Runs after a queued operation completes.
    async fn after_operation(&self, _operation: &SyncOperation<T>) -> SynqResult<()> {
        Ok(())
    }

    /// Notification that an operation failed terminally this cycle.
    async fn on_operation_error(&self, _operation: &SyncOperation<T>, _error: &SynqError) {}

    /// Notification that the pull phase detected a conflict.
    async fn on_conflict(&self, _context: &ConflictContext) {}

    /// Transforms an entity before it is written locally by CRUD.
    async fn before_save(&self, entity: T) -> SynqResult<T> {
        Ok(entity)
    }

    /// Transforms an entity on its way to the remote adapter.
    async fn to_remote(&self, entity: T) -> SynqResult<T> {
        Ok(entity)
    }

    /// Transforms an entity arriving from the remote adapter.
    async fn from_remote(&self, entity: T) -> SynqResult<T> {
        Ok(entity)
    }
}

/// Registration-ordered middleware chain. Errors propagate to the caller.
pub struct MiddlewareChain<T: Syncable> {
    chain: RwLock<Vec<Arc<dyn SyncMiddleware<T>>>>,
}

impl<T: Syncable> MiddlewareChain<T> {
    /// Empty chain.
    pub fn new() -> Self {
        Self {
            chain: RwLock::new(Vec::new()),
        }
    }

    /// Appends a middleware.
    pub fn register(&self, middleware: Arc<dyn SyncMiddleware<T>>) {
        self.chain.write().push(middleware);
    }

    /// Removes every middleware.
    pub fn clear(&self) {
        self.chain.write().clear();
    }

    fn all(&self) -> Vec<Arc<dyn SyncMiddleware<T>>> {
        self.chain.read().clone()
    }

    /// Runs every `before_sync` hook.
    pub async fn before_sync(&self, user_id: &str) -> SynqResult<()> {
        for middleware in self.all() {
            middleware.before_sync(user_id).await?;
        }
        Ok(())
    }

    /// Runs every `after_sync` hook.
    pub async fn after_sync(&self, user_id: &str, report: &SyncReport) -> SynqResult<()> {
        for middleware in self.all() {
            middleware.after_sync(user_id, report).await?;
        }
        Ok(())
    }

    /// Runs every `before_operation` hook.
    pub async fn before_operation(&self, operation: &SyncOperation<T>) -> SynqResult<()> {
        for middleware in self.all() {
            middleware.before_operation(operation).await?;
        }
        Ok(())
    }

    /// Runs every `after_operation` hook.
    pub async fn after_operation(&self, operation: &SyncOperation<T>) -> SynqResult<()> {
        for middleware in self.all() {
            middleware.after_operation(operation).await?;
        }
        Ok(())
    }

    /// Notifies every middleware of a terminal operation failure.
    pub async fn on_operation_error(&self, operation: &SyncOperation<T>, error: &SynqError) {
        for middleware in self.all() {
            middleware.on_operation_error(operation, error).await;
        }
    }

    /// Notifies every middleware of a detected conflict.
    pub async fn on_conflict(&self, context: &ConflictContext) {
        for middleware in self.all() {
            middleware.on_conflict(context).await;
        }
    }

    /// Threads an entity through every `before_save` transform.
    pub async fn before_save(&self, mut entity: T) -> SynqResult<T> {
        for middleware in self.all() {
            entity = middleware.before_save(entity).await?;
        }
        Ok(entity)
    }

    /// Threads an entity through every outbound transform.
    pub async fn to_remote(&self, mut entity: T) -> SynqResult<T> {
        for middleware in self.all() {
            entity = middleware.to_remote(entity).await?;
        }
        Ok(entity)
    }

    /// Threads an entity through every inbound transform.
    pub async fn from_remote(&self, mut entity: T) -> SynqResult<T> {
        for middleware in self.all() {
            entity = middleware.from_remote(entity).await?;
        }
        Ok(entity)
    }
}

impl<T: Syncable> Default for MiddlewareChain<T> {
    fn default() -> Self {
        Self::new()
    }
}
