//! Schema migration of locally persisted records.
//!
//! Migrations are forward-only and metadata-driven: each one maps a raw
//! persisted record (a field map) from one schema version to the next, and
//! the executor walks the registered chain from the stored version up to
//! the configured target at startup. Every step runs inside a single local-
//! adapter transaction: load all raw records, map each, overwrite the table
//! atomically, then bump the stored version.

use crate::adapter::LocalAdapter;
use crate::config::MigrationErrorHandler;
use crate::error::{SynqError, SynqResult};
use crate::observer::ObserverRegistry;
use std::sync::Arc;
use synq_protocol::{FieldMap, Syncable};

/// One forward schema step for raw persisted records.
pub trait DataMigration: Send + Sync {
    /// Schema version this migration consumes.
    fn from_version(&self) -> u32;

    /// Schema version this migration produces. Must exceed `from_version`.
    fn to_version(&self) -> u32;

    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Maps one raw record to the next schema version.
    fn migrate(&self, row: FieldMap) -> SynqResult<FieldMap>;
}

/// Walks raw persisted records from the stored schema version up to the
/// configured target.
pub struct MigrationExecutor<T: Syncable, L: LocalAdapter<T>> {
    local: Arc<L>,
    migrations: Vec<Arc<dyn DataMigration>>,
    target_version: u32,
    _entity: std::marker::PhantomData<T>,
}

impl<T: Syncable, L: LocalAdapter<T>> MigrationExecutor<T, L> {
    /// Creates an executor for a target version and its migration chain.
    pub fn new(
        local: Arc<L>,
        migrations: Vec<Arc<dyn DataMigration>>,
        target_version: u32,
    ) -> Self {
        Self {
            local,
            migrations,
            target_version,
            _entity: std::marker::PhantomData,
        }
    }

    /// Runs pending migrations. Returns the stored schema version after
    /// the walk.
    ///
    /// A fresh install (stored version zero) skips the chain entirely: the
    /// stored version is set to the target and only `on_migration_end`
    /// fires. A failure notifies `on_migration_error`; the optional
    /// recovery handler may swallow it, otherwise it propagates with the
    /// stored version left at the last completed step.
    pub async fn run(
        &self,
        observers: &ObserverRegistry<T>,
        on_error: Option<&MigrationErrorHandler>,
    ) -> SynqResult<u32> {
        let stored = self.local.get_stored_schema_version().await?;

        if stored >= self.target_version {
            if stored > self.target_version {
                tracing::warn!(
                    stored,
                    configured = self.target_version,
                    "stored schema version is ahead of the configured target"
                );
            }
            return Ok(stored);
        }

        if stored == 0 {
            // Fresh install: nothing persisted to migrate.
            self.local
                .set_stored_schema_version(self.target_version)
                .await?;
            observers.notify_migration_end(self.target_version).await;
            return Ok(self.target_version);
        }

        match self.walk(stored, observers).await {
            Ok(version) => {
                observers.notify_migration_end(version).await;
                Ok(version)
            }
            Err(error) => {
                observers.notify_migration_error(&error).await;
                if let Some(handler) = on_error {
                    if handler(&error) {
                        tracing::warn!(%error, "migration failure swallowed by recovery handler");
                        return self.local.get_stored_schema_version().await;
                    }
                }
                Err(error)
            }
        }
    }

    async fn walk(&self, mut stored: u32, observers: &ObserverRegistry<T>) -> SynqResult<u32> {
        while stored < self.target_version {
            let step = self
                .migrations
                .iter()
                .find(|m| m.from_version() == stored)
                .cloned()
                .ok_or(SynqError::MigrationMissing {
                    from_version: stored,
                })?;

            if step.to_version() <= step.from_version() {
                return Err(SynqError::MigrationInvalid {
                    from_version: step.from_version(),
                    to_version: step.to_version(),
                });
            }

            observers
                .notify_migration_start(step.from_version(), step.to_version())
                .await;
            tracing::info!(
                name = step.name(),
                from = step.from_version(),
                to = step.to_version(),
                "running migration"
            );

            let local = Arc::clone(&self.local);
            let migration = Arc::clone(&step);
            self.local
                .transaction(Box::new(move || {
                    Box::pin(async move {
                        let rows = local.get_all_raw_data().await?;
                        let migrated = rows
                            .into_iter()
                            .map(|row| migration.migrate(row))
                            .collect::<SynqResult<Vec<FieldMap>>>()?;
                        local.overwrite_all_raw_data(migrated).await?;
                        local.set_stored_schema_version(migration.to_version()).await
                    })
                }))
                .await?;

            stored = step.to_version();
        }
        Ok(stored)
    }
}
