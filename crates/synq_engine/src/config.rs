//! Engine and per-call configuration.

use crate::error::{SynqError, SynqResult};
use crate::migration::DataMigration;
use crate::resolver::{ConflictResolver, LastWriteWins};
use std::sync::Arc;
use std::time::Duration;
use synq_protocol::Syncable;

/// Order of the push and pull phases within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDirection {
    /// Drain the queue, then reconcile remote state. The default.
    #[default]
    PushThenPull,
    /// Reconcile remote state, then drain the queue.
    PullThenPush,
    /// Drain the queue only.
    PushOnly,
    /// Reconcile remote state only.
    PullOnly,
}

impl SyncDirection {
    /// True when the cycle includes a push phase.
    pub fn pushes(&self) -> bool {
        !matches!(self, SyncDirection::PullOnly)
    }

    /// True when the cycle includes a pull phase.
    pub fn pulls(&self) -> bool {
        !matches!(self, SyncDirection::PushOnly)
    }
}

/// How `switch_user` treats the outgoing user's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserSwitchStrategy {
    /// Force-sync the outgoing user before switching.
    SyncThenSwitch,
    /// Wipe the incoming user's local data before switching.
    ClearAndFetch,
    /// Refuse the switch while the outgoing user has pending operations.
    PromptIfUnsyncedData,
    /// Switch without touching either user's data. The default.
    #[default]
    KeepLocal,
}

/// Recovery callback consulted when the migration executor fails.
/// Returning `true` swallows the failure; `false` lets it propagate.
pub type MigrationErrorHandler = Arc<dyn Fn(&SynqError) -> bool + Send + Sync>;

/// Engine-wide configuration.
///
/// Built with chained setters, teacher-style:
///
/// ```ignore
/// let config = SynqConfig::<Note>::new()
///     .with_batch_size(25)
///     .with_sync_timeout(Duration::from_secs(30))
///     .with_initial_user("u1");
/// ```
pub struct SynqConfig<T: Syncable> {
    /// Period for auto-sync timers when not overridden per call.
    pub auto_sync_interval: Duration,
    /// Attempt a sync when the host reports connectivity restored.
    pub auto_sync_on_connect: bool,
    /// Per-operation retry cap.
    pub max_retries: u32,
    /// Minimum wait between push attempts for the same operation.
    pub retry_delay: Duration,
    /// Push-phase batch size.
    pub batch_size: usize,
    /// Resolver used when no per-call resolver is supplied.
    pub default_resolver: Arc<dyn ConflictResolver<T>>,
    /// Strategy used when `switch_user` is called without one.
    pub default_switch_strategy: UserSwitchStrategy,
    /// Phase order used when no per-call direction is supplied.
    pub default_direction: SyncDirection,
    /// Subscribe to adapter change streams on initialization.
    pub enable_real_time_sync: bool,
    /// Engine-wide upper bound per cycle. `None` means no deadline.
    pub sync_timeout: Option<Duration>,
    /// Gate for the chattiest per-operation log output.
    pub enable_logging: bool,
    /// Send field deltas through `patch` when the remote supports it.
    pub enable_partial_updates: bool,
    /// Target schema version for locally persisted records.
    pub schema_version: u32,
    /// Registered migrations, walked from the stored version upward.
    pub migrations: Vec<Arc<dyn DataMigration>>,
    /// Optional recovery callback for migration failures.
    pub on_migration_error: Option<MigrationErrorHandler>,
    /// Start auto-sync for `initial_user_id` during initialization.
    pub auto_start_sync: bool,
    /// User initialized (and optionally auto-synced) at startup.
    pub initial_user_id: Option<String>,
}

impl<T: Syncable> SynqConfig<T> {
    /// Creates a configuration with the documented defaults.
    pub fn new() -> Self {
        Self {
            auto_sync_interval: Duration::from_secs(300),
            auto_sync_on_connect: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            batch_size: 50,
            default_resolver: Arc::new(LastWriteWins),
            default_switch_strategy: UserSwitchStrategy::default(),
            default_direction: SyncDirection::default(),
            enable_real_time_sync: true,
            sync_timeout: None,
            enable_logging: false,
            enable_partial_updates: true,
            schema_version: 1,
            migrations: Vec::new(),
            on_migration_error: None,
            auto_start_sync: false,
            initial_user_id: None,
        }
    }

    /// Sets the auto-sync period.
    #[must_use]
    pub fn with_auto_sync_interval(mut self, interval: Duration) -> Self {
        self.auto_sync_interval = interval;
        self
    }

    /// Enables or disables sync-on-reconnect.
    #[must_use]
    pub fn with_auto_sync_on_connect(mut self, enabled: bool) -> Self {
        self.auto_sync_on_connect = enabled;
        self
    }

    /// Sets the per-operation retry cap.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the minimum wait between retries of one operation.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the push-phase batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the default conflict resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver<T>>) -> Self {
        self.default_resolver = resolver;
        self
    }

    /// Sets the default user-switch strategy.
    #[must_use]
    pub fn with_switch_strategy(mut self, strategy: UserSwitchStrategy) -> Self {
        self.default_switch_strategy = strategy;
        self
    }

    /// Sets the default phase order.
    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.default_direction = direction;
        self
    }

    /// Enables or disables adapter change-stream subscription.
    #[must_use]
    pub fn with_real_time_sync(mut self, enabled: bool) -> Self {
        self.enable_real_time_sync = enabled;
        self
    }

    /// Sets the engine-wide cycle deadline.
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// Enables verbose per-operation logging.
    #[must_use]
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Enables or disables delta pushes through `patch`.
    #[must_use]
    pub fn with_partial_updates(mut self, enabled: bool) -> Self {
        self.enable_partial_updates = enabled;
        self
    }

    /// Sets the target schema version and the migrations that reach it.
    #[must_use]
    pub fn with_schema(mut self, version: u32, migrations: Vec<Arc<dyn DataMigration>>) -> Self {
        self.schema_version = version;
        self.migrations = migrations;
        self
    }

    /// Installs a migration-failure recovery callback.
    #[must_use]
    pub fn with_migration_error_handler(mut self, handler: MigrationErrorHandler) -> Self {
        self.on_migration_error = Some(handler);
        self
    }

    /// Sets the user initialized at startup, optionally with auto-sync.
    #[must_use]
    pub fn with_initial_user(mut self, user_id: impl Into<String>) -> Self {
        self.initial_user_id = Some(user_id.into());
        self
    }

    /// Starts auto-sync for the initial user during initialization.
    #[must_use]
    pub fn with_auto_start_sync(mut self, enabled: bool) -> Self {
        self.auto_start_sync = enabled;
        self
    }

    /// Validates invariants the rest of the engine assumes.
    pub fn validate(&self) -> SynqResult<()> {
        if self.batch_size == 0 {
            return Err(SynqError::Validation("batch_size must be positive".into()));
        }
        if self.schema_version == 0 {
            return Err(SynqError::Validation(
                "schema_version must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective batch size for one cycle: the per-call override when
    /// given, floored at one.
    pub fn effective_batch_size(&self, options: &SyncOptions<T>) -> usize {
        options.batch_size.unwrap_or(self.batch_size).max(1)
    }

    /// Effective deadline for one cycle: the smaller of the configured and
    /// per-call timeouts, over positive durations. `None` when neither is
    /// set.
    pub fn effective_timeout(&self, options: &SyncOptions<T>) -> Option<Duration> {
        let positive = |d: &Duration| !d.is_zero();
        match (
            self.sync_timeout.filter(positive),
            options.timeout.filter(positive),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl<T: Syncable> Default for SynqConfig<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Syncable> Clone for SynqConfig<T> {
    fn clone(&self) -> Self {
        Self {
            auto_sync_interval: self.auto_sync_interval,
            auto_sync_on_connect: self.auto_sync_on_connect,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            batch_size: self.batch_size,
            default_resolver: Arc::clone(&self.default_resolver),
            default_switch_strategy: self.default_switch_strategy,
            default_direction: self.default_direction,
            enable_real_time_sync: self.enable_real_time_sync,
            sync_timeout: self.sync_timeout,
            enable_logging: self.enable_logging,
            enable_partial_updates: self.enable_partial_updates,
            schema_version: self.schema_version,
            migrations: self.migrations.clone(),
            on_migration_error: self.on_migration_error.clone(),
            auto_start_sync: self.auto_start_sync,
            initial_user_id: self.initial_user_id.clone(),
        }
    }
}

impl<T: Syncable> std::fmt::Debug for SynqConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynqConfig")
            .field("auto_sync_interval", &self.auto_sync_interval)
            .field("auto_sync_on_connect", &self.auto_sync_on_connect)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("batch_size", &self.batch_size)
            .field("default_switch_strategy", &self.default_switch_strategy)
            .field("default_direction", &self.default_direction)
            .field("enable_real_time_sync", &self.enable_real_time_sync)
            .field("sync_timeout", &self.sync_timeout)
            .field("enable_partial_updates", &self.enable_partial_updates)
            .field("schema_version", &self.schema_version)
            .field("migrations", &self.migrations.len())
            .field("auto_start_sync", &self.auto_start_sync)
            .field("initial_user_id", &self.initial_user_id)
            .finish_non_exhaustive()
    }
}

/// Per-call sync options.
pub struct SyncOptions<T: Syncable> {
    /// Phase order override.
    pub direction: Option<SyncDirection>,
    /// Push-batch override.
    pub batch_size: Option<usize>,
    /// Deadline override; combined with the configured timeout by `min`.
    pub timeout: Option<Duration>,
    /// Push queued deletes. Disabling leaves them queued for later.
    pub include_deletes: bool,
    /// Run the detector/resolver during pull. Disabling overwrites local
    /// copies with remote state unconditionally.
    pub resolve_conflicts: bool,
    /// Per-call resolver override.
    pub resolver: Option<Arc<dyn ConflictResolver<T>>>,
}

impl<T: Syncable> SyncOptions<T> {
    /// Options with every knob at its default.
    pub fn new() -> Self {
        Self {
            direction: None,
            batch_size: None,
            timeout: None,
            include_deletes: true,
            resolve_conflicts: true,
            resolver: None,
        }
    }

    /// Overrides the phase order.
    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Overrides the push batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Overrides the cycle deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keeps queued deletes out of this cycle.
    #[must_use]
    pub fn skip_deletes(mut self) -> Self {
        self.include_deletes = false;
        self
    }

    /// Disables conflict resolution for this cycle.
    #[must_use]
    pub fn without_conflict_resolution(mut self) -> Self {
        self.resolve_conflicts = false;
        self
    }

    /// Supplies a per-call resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver<T>>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

impl<T: Syncable> Default for SyncOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Syncable> Clone for SyncOptions<T> {
    fn clone(&self) -> Self {
        Self {
            direction: self.direction,
            batch_size: self.batch_size,
            timeout: self.timeout,
            include_deletes: self.include_deletes,
            resolve_conflicts: self.resolve_conflicts,
            resolver: self.resolver.clone(),
        }
    }
}

impl<T: Syncable> std::fmt::Debug for SyncOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("direction", &self.direction)
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("include_deletes", &self.include_deletes)
            .field("resolve_conflicts", &self.resolve_conflicts)
            .field("resolver_override", &self.resolver.is_some())
            .finish()
    }
}
