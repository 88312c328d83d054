//! The public facade.
//!
//! [`SynqManager`] owns everything the host touches: CRUD that persists
//! locally and queues sync operations, external-change ingestion with
//! deduplication, observer/middleware registries, user switching, auto-sync
//! timers, reactive query delegation, and statistics aggregation. The
//! per-user cycle mechanics live in [`crate::engine::SyncEngine`].

use crate::adapter::{ConnectivityProbe, LocalAdapter, QueryFilter, RemoteAdapter};
use crate::config::{SynqConfig, UserSwitchStrategy};
use crate::engine::{ResumeSignal, SyncEngine, SyncReport, SyncRequest};
use crate::error::{SynqError, SynqResult};
use crate::events::{EventBus, EventSubscription, SyncEvent};
use crate::migration::MigrationExecutor;
use crate::observer::{MiddlewareChain, ObserverRegistry, SyncMiddleware, SyncObserver};
use crate::queue::QueueManager;
use crate::stats::StatsRecorder;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use synq_protocol::{
    equivalent, ChangeDetail, ChangeKind, ChangeOrigin, OperationKind, SyncMetadata,
    SyncOperation, SyncStatistics, SyncStatusSnapshot, Syncable,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Options for a facade mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutationOptions {
    /// Where the mutation comes from. Only `Local` mutations (or forced
    /// ones) enqueue a sync operation — that is what keeps external-change
    /// ingestion from echoing.
    pub origin: ChangeOrigin,
    /// Enqueue a sync operation even for a non-local origin.
    pub force_remote_sync: bool,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            origin: ChangeOrigin::Local,
            force_remote_sync: false,
        }
    }
}

impl MutationOptions {
    /// Options for a mutation observed from elsewhere.
    pub fn from_origin(origin: ChangeOrigin) -> Self {
        Self {
            origin,
            force_remote_sync: false,
        }
    }
}

/// Outcome of a `switch_user` call.
#[derive(Debug, Clone)]
pub struct UserSwitchResult {
    /// Whether the switch happened.
    pub success: bool,
    /// The user that was active before.
    pub previous_user_id: Option<String>,
    /// The user the switch targeted.
    pub new_user_id: String,
    /// Whether the previous user still had queued operations.
    pub had_unsynced_data: bool,
    /// Failure explanation, when rejected.
    pub message: Option<String>,
}

impl UserSwitchResult {
    fn success(previous: Option<String>, new: impl Into<String>, had_unsynced: bool) -> Self {
        Self {
            success: true,
            previous_user_id: previous,
            new_user_id: new.into(),
            had_unsynced_data: had_unsynced,
            message: None,
        }
    }

    fn failure(
        previous: Option<String>,
        new: impl Into<String>,
        had_unsynced: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            previous_user_id: previous,
            new_user_id: new.into(),
            had_unsynced_data: had_unsynced,
            message: Some(message.into()),
        }
    }
}

/// Insertion-ordered `(change key, payload hash)` cache with a hard cap.
struct ProcessedChanges {
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
    capacity: usize,
}

impl ProcessedChanges {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, key: &str, hash: &str) -> bool {
        self.seen.contains(&(key.to_string(), hash.to_string()))
    }

    fn insert(&mut self, key: String, hash: String) {
        let entry = (key, hash);
        if self.seen.insert(entry.clone()) {
            self.order.push_back(entry);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

/// The engine facade. Construct with [`SynqManager::new`], then call
/// [`initialize`](SynqManager::initialize) once before anything else.
pub struct SynqManager<T, L, R>
where
    T: Syncable,
    L: LocalAdapter<T>,
    R: RemoteAdapter<T>,
{
    config: SynqConfig<T>,
    local: Arc<L>,
    remote: Arc<R>,
    engine: SyncEngine<T, L, R>,
    queue: Arc<QueueManager<T, L>>,
    observers: ObserverRegistry<T>,
    middleware: Arc<MiddlewareChain<T>>,
    events: EventBus<T>,
    stats: Arc<StatsRecorder>,
    active_user: RwLock<Option<String>>,
    auto_sync: Mutex<HashMap<String, JoinHandle<()>>>,
    stream_tasks: Mutex<Vec<JoinHandle<()>>>,
    ingest_lock: tokio::sync::Mutex<()>,
    processed: Mutex<ProcessedChanges>,
    disposed: AtomicBool,
    // Handle to ourselves for spawned tasks; set by Arc::new_cyclic so
    // background work never keeps a dropped manager alive.
    self_ref: Weak<Self>,
}

impl<T, L, R> SynqManager<T, L, R>
where
    T: Syncable,
    L: LocalAdapter<T>,
    R: RemoteAdapter<T>,
{
    /// Maximum retained processed-change entries before pruning.
    const PROCESSED_CACHE_CAPACITY: usize = 1000;

    /// Creates a manager. Validates the configuration.
    pub fn new(config: SynqConfig<T>, local: L, remote: R) -> SynqResult<Arc<Self>> {
        Self::build(config, local, remote, None)
    }

    /// Creates a manager with a host connectivity probe.
    pub fn with_probe(
        config: SynqConfig<T>,
        local: L,
        remote: R,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> SynqResult<Arc<Self>> {
        Self::build(config, local, remote, Some(probe))
    }

    fn build(
        config: SynqConfig<T>,
        local: L,
        remote: R,
        probe: Option<Arc<dyn ConnectivityProbe>>,
    ) -> SynqResult<Arc<Self>> {
        config.validate()?;

        let local = Arc::new(local);
        let remote = Arc::new(remote);
        let queue = Arc::new(QueueManager::new(Arc::clone(&local)));
        let middleware = Arc::new(MiddlewareChain::new());
        let events = EventBus::new();
        let stats = Arc::new(StatsRecorder::new());

        let mut engine = SyncEngine::new(
            config.clone(),
            Arc::clone(&local),
            Arc::clone(&remote),
            Arc::clone(&queue),
            Arc::clone(&middleware),
            events.clone(),
            Arc::clone(&stats),
        );
        if let Some(probe) = probe {
            engine = engine.with_probe(probe);
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            local,
            remote,
            engine,
            queue,
            observers: ObserverRegistry::new(),
            middleware,
            events,
            stats,
            active_user: RwLock::new(None),
            auto_sync: Mutex::new(HashMap::new()),
            stream_tasks: Mutex::new(Vec::new()),
            ingest_lock: tokio::sync::Mutex::new(()),
            processed: Mutex::new(ProcessedChanges::new(Self::PROCESSED_CACHE_CAPACITY)),
            disposed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// Prepares the manager: opens the local store, runs pending schema
    /// migrations, subscribes to adapter change streams, and initializes
    /// the configured initial user.
    pub async fn initialize(&self) -> SynqResult<()> {
        self.local.initialize().await?;

        let executor = MigrationExecutor::new(
            Arc::clone(&self.local),
            self.config.migrations.clone(),
            self.config.schema_version,
        );
        executor
            .run(&self.observers, self.config.on_migration_error.as_ref())
            .await?;

        if self.config.enable_real_time_sync {
            if let Some(stream) = self.local.change_stream() {
                self.spawn_change_listener(stream, ChangeOrigin::Local);
            }
            if let Some(stream) = self.remote.change_stream() {
                self.spawn_change_listener(stream, ChangeOrigin::Remote);
            }
        }

        if let Some(user_id) = self.config.initial_user_id.clone() {
            self.queue.initialize_user(&user_id).await?;
            *self.active_user.write() = Some(user_id.clone());
            if self.config.auto_start_sync {
                self.start_auto_sync(&user_id, None);
            }
        }

        tracing::info!("synq manager initialized");
        Ok(())
    }

    fn ensure_live(&self) -> SynqResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SynqError::Validation("manager is disposed".into()));
        }
        Ok(())
    }

    // === CRUD ===

    /// Persists an entity locally and queues it for sync.
    pub async fn save(&self, entity: T, user_id: &str) -> SynqResult<T> {
        self.save_with(entity, user_id, MutationOptions::default())
            .await
    }

    /// Persists an entity with explicit origin control.
    ///
    /// Updates are diffed against the stored copy; an update with no
    /// differences is a no-op. A sync operation is enqueued only for a
    /// `Local` origin or when `force_remote_sync` is set — that suppression
    /// is what keeps pulled and externally observed changes from echoing
    /// back to the remote.
    pub async fn save_with(
        &self,
        entity: T,
        user_id: &str,
        options: MutationOptions,
    ) -> SynqResult<T> {
        self.ensure_live()?;
        validate_ids(entity.id(), user_id)?;
        self.queue.initialize_user(user_id).await?;

        let existing = self.local.get_by_id(entity.id(), user_id).await?;
        let transformed = self.middleware.before_save(entity).await?;
        let should_enqueue = options.origin == ChangeOrigin::Local || options.force_remote_sync;

        let (saved, kind) = match existing {
            Some(previous) => {
                let Some(delta) = transformed.diff(&previous) else {
                    return Ok(transformed);
                };
                let saved = self.local.patch(transformed.id(), user_id, &delta).await?;
                if should_enqueue {
                    self.queue
                        .enqueue(
                            user_id,
                            SyncOperation::update(user_id, saved.clone(), Some(delta)),
                        )
                        .await?;
                }
                (saved, ChangeKind::Update)
            }
            None => {
                self.local.save(&transformed, user_id).await?;
                if should_enqueue {
                    self.queue
                        .enqueue(user_id, SyncOperation::create(user_id, transformed.clone()))
                        .await?;
                }
                (transformed, ChangeKind::Create)
            }
        };

        self.events.emit(SyncEvent::DataChanged {
            user_id: user_id.to_string(),
            entity: saved.clone(),
            kind,
            origin: options.origin,
        });
        Ok(saved)
    }

    /// Deletes an entity locally and queues the deletion. Returns false
    /// when the entity was absent (a no-op).
    pub async fn delete(&self, id: &str, user_id: &str) -> SynqResult<bool> {
        self.delete_with(id, user_id, MutationOptions::default())
            .await
    }

    /// Deletes with explicit origin control.
    pub async fn delete_with(
        &self,
        id: &str,
        user_id: &str,
        options: MutationOptions,
    ) -> SynqResult<bool> {
        self.ensure_live()?;
        validate_ids(id, user_id)?;
        self.queue.initialize_user(user_id).await?;

        let Some(existing) = self.local.get_by_id(id, user_id).await? else {
            return Ok(false);
        };
        self.local.delete(id, user_id).await?;

        if options.origin == ChangeOrigin::Local || options.force_remote_sync {
            self.queue
                .enqueue(user_id, SyncOperation::delete(user_id, id))
                .await?;
        }

        self.events.emit(SyncEvent::DataChanged {
            user_id: user_id.to_string(),
            entity: existing,
            kind: ChangeKind::Delete,
            origin: options.origin,
        });
        Ok(true)
    }

    /// Saves, then immediately runs a sync cycle.
    pub async fn save_and_sync(&self, entity: T, user_id: &str) -> SynqResult<SyncReport> {
        self.save(entity, user_id).await?;
        self.sync(user_id).await
    }

    /// Deletes, then immediately runs a sync cycle.
    pub async fn delete_and_sync(&self, id: &str, user_id: &str) -> SynqResult<SyncReport> {
        self.delete(id, user_id).await?;
        self.sync(user_id).await
    }

    /// One entity by id.
    pub async fn get(&self, id: &str, user_id: &str) -> SynqResult<Option<T>> {
        self.local.get_by_id(id, user_id).await
    }

    /// Every entity for a user.
    pub async fn get_all(&self, user_id: &str) -> SynqResult<Vec<T>> {
        self.local.get_all(user_id).await
    }

    /// The user's queued operations, FIFO.
    pub async fn pending_operations(&self, user_id: &str) -> SynqResult<Vec<SyncOperation<T>>> {
        self.queue.initialize_user(user_id).await?;
        Ok(self.queue.pending(user_id))
    }

    /// Watches the user's queue snapshots.
    pub fn watch_pending_operations(
        &self,
        user_id: &str,
    ) -> watch::Receiver<Vec<SyncOperation<T>>> {
        self.queue.watch(user_id)
    }

    // === Sync ===

    /// Runs a sync cycle with defaults.
    pub async fn sync(&self, user_id: &str) -> SynqResult<SyncReport> {
        self.sync_with(user_id, SyncRequest::new()).await
    }

    /// Runs a sync cycle with explicit parameters.
    pub async fn sync_with(&self, user_id: &str, request: SyncRequest<T>) -> SynqResult<SyncReport> {
        self.ensure_live()?;
        self.engine.synchronize(user_id, request).await
    }

    /// Engages the user's pause latch. See [`SyncEngine::pause`].
    pub fn pause_sync(&self, user_id: &str) -> ResumeSignal {
        self.engine.pause(user_id)
    }

    /// Releases the user's pause latch.
    pub fn resume_sync(&self, user_id: &str) {
        self.engine.resume(user_id)
    }

    /// Requests cooperative cancellation of the user's running cycle.
    pub fn cancel_sync(&self, user_id: &str) {
        self.engine.cancel(user_id)
    }

    /// Whether a cycle is currently running for the user.
    pub fn is_syncing(&self, user_id: &str) -> bool {
        self.engine.is_syncing(user_id)
    }

    /// The user's latest status snapshot.
    pub fn status(&self, user_id: &str) -> SyncStatusSnapshot {
        self.engine.status(user_id)
    }

    /// Watches the user's status projection.
    pub fn watch_status(&self, user_id: &str) -> watch::Receiver<SyncStatusSnapshot> {
        self.engine.watch_status(user_id)
    }

    /// The user's latest sync metadata.
    pub fn metadata(&self, user_id: &str) -> Option<SyncMetadata> {
        self.engine.current_metadata(user_id)
    }

    /// Watches the user's metadata stream.
    pub fn watch_metadata(&self, user_id: &str) -> watch::Receiver<Option<SyncMetadata>> {
        self.engine.watch_metadata(user_id)
    }

    /// Process-wide statistics snapshot.
    pub fn statistics(&self) -> SyncStatistics {
        self.stats.snapshot()
    }

    /// Zeroes the statistics counters.
    pub fn reset_statistics(&self) {
        self.stats.reset()
    }

    // === Events & registries ===

    /// Subscribes to the live event feed.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent<T>> {
        self.events.subscribe()
    }

    /// Subscribes with a one-shot initial snapshot of the user's data
    /// delivered before any live event.
    pub async fn events_with_initial(&self, user_id: &str) -> SynqResult<EventSubscription<T>> {
        let data = self.local.get_all(user_id).await?;
        Ok(self.events.subscribe_with_initial(user_id, data))
    }

    /// Registers an observer. Observers see every external change and the
    /// migration/user-switch lifecycle; their errors are logged, never
    /// propagated.
    pub fn register_observer(&self, observer: Arc<dyn SyncObserver<T>>) {
        self.observers.register(observer);
    }

    /// Registers a middleware at the end of the chain.
    pub fn register_middleware(&self, middleware: Arc<dyn SyncMiddleware<T>>) {
        self.middleware.register(middleware);
    }

    // === External-change ingestion ===

    fn spawn_change_listener(
        &self,
        mut stream: broadcast::Receiver<ChangeDetail<T>>,
        origin: ChangeOrigin,
    ) {
        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(change) => {
                        let Some(manager) = weak.upgrade() else { break };
                        if let Err(error) = manager.ingest_external_change(change, origin).await {
                            tracing::warn!(%error, "failed to apply external change");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "change stream lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.stream_tasks.lock().push(handle);
    }

    /// Feeds one adapter-observed change through the dedup filters and, if
    /// it survives, applies it through the manager's own CRUD with the
    /// inbound origin (suppressing re-enqueue for remote changes).
    ///
    /// Inbound changes are serialized through one mutex so two deliveries
    /// of the same change cannot interleave past the filters. Observers
    /// are notified before any deduplication — they see every delivery.
    pub async fn ingest_external_change(
        &self,
        change: ChangeDetail<T>,
        origin: ChangeOrigin,
    ) -> SynqResult<()> {
        self.ensure_live()?;
        let _serial = self.ingest_lock.lock().await;

        self.observers.notify_external_change(&change).await;
        self.events.emit(SyncEvent::ExternalChange {
            change: change.clone(),
        });

        // Filter 1: the (key, payload hash) pair was already processed.
        let key = change.change_key();
        let data_hash = business_hash(change.entity.as_ref());
        if self.processed.lock().contains(&key, &data_hash) {
            if self.config.enable_logging {
                tracing::debug!(key, "duplicate external change skipped");
            }
            return Ok(());
        }

        self.queue.initialize_user(&change.user_id).await?;

        // Filter 2: an equivalent operation is already queued.
        if self.matches_pending_operation(&change) {
            self.mark_processed(key, data_hash);
            return Ok(());
        }

        // Filter 3: local storage already reflects the change.
        if self.already_current(&change).await? {
            self.mark_processed(key, data_hash);
            return Ok(());
        }

        match change.kind {
            ChangeKind::Delete => {
                self.delete_with(
                    &change.entity_id,
                    &change.user_id,
                    MutationOptions::from_origin(origin),
                )
                .await?;
            }
            ChangeKind::Create | ChangeKind::Update => {
                let entity = change.entity.clone().ok_or_else(|| {
                    SynqError::Validation("external create/update carries no entity".into())
                })?;
                self.save_with(
                    entity,
                    &change.user_id,
                    MutationOptions::from_origin(origin),
                )
                .await?;
            }
        }

        self.mark_processed(key, data_hash);
        Ok(())
    }

    fn mark_processed(&self, key: String, hash: String) {
        self.processed.lock().insert(key, hash);
    }

    fn matches_pending_operation(&self, change: &ChangeDetail<T>) -> bool {
        let wanted = match change.kind {
            ChangeKind::Create => OperationKind::Create,
            ChangeKind::Update => OperationKind::Update,
            ChangeKind::Delete => OperationKind::Delete,
        };
        self.queue
            .pending(&change.user_id)
            .iter()
            .any(|op| {
                op.kind == wanted
                    && op.entity_id == change.entity_id
                    && match (&op.snapshot, &change.entity) {
                        (Some(ours), Some(theirs)) => equivalent(ours, theirs),
                        (None, None) => true,
                        _ => false,
                    }
            })
    }

    async fn already_current(&self, change: &ChangeDetail<T>) -> SynqResult<bool> {
        let stored = self
            .local
            .get_by_id(&change.entity_id, &change.user_id)
            .await?;
        Ok(match change.kind {
            ChangeKind::Delete => match stored {
                None => true,
                Some(entity) => entity.is_deleted(),
            },
            ChangeKind::Create | ChangeKind::Update => match (&stored, &change.entity) {
                (Some(ours), Some(theirs)) => equivalent(ours, theirs),
                _ => false,
            },
        })
    }

    // === User switching ===

    /// Switches the active user under the configured default strategy.
    pub async fn switch_user(&self, new_user_id: &str) -> SynqResult<UserSwitchResult> {
        self.switch_user_with(new_user_id, self.config.default_switch_strategy)
            .await
    }

    /// Switches the active user under an explicit strategy.
    ///
    /// Observers receive `on_user_switch_start` first and
    /// `on_user_switch_end` on every outcome: success, a soft rejection,
    /// or an error on the way.
    pub async fn switch_user_with(
        &self,
        new_user_id: &str,
        strategy: UserSwitchStrategy,
    ) -> SynqResult<UserSwitchResult> {
        self.ensure_live()?;
        if new_user_id.is_empty() {
            return Err(SynqError::Validation("user id must not be empty".into()));
        }

        let previous = self.active_user.read().clone();
        self.observers
            .notify_user_switch_start(previous.as_deref(), new_user_id)
            .await;

        let outcome = self.perform_switch(&previous, new_user_id, strategy).await;
        let success = matches!(&outcome, Ok(result) if result.success);
        self.observers
            .notify_user_switch_end(previous.as_deref(), new_user_id, success)
            .await;
        outcome
    }

    async fn perform_switch(
        &self,
        previous: &Option<String>,
        new_user_id: &str,
        strategy: UserSwitchStrategy,
    ) -> SynqResult<UserSwitchResult> {
        let had_unsynced = match previous.as_deref() {
            Some(prev) => {
                self.queue.initialize_user(prev).await?;
                self.queue.pending_count(prev) > 0
            }
            None => false,
        };

        match strategy {
            UserSwitchStrategy::SyncThenSwitch => {
                if let Some(prev) = previous.as_deref() {
                    if let Err(error) = self.engine.synchronize(prev, SyncRequest::forced()).await {
                        tracing::warn!(%error, user_id = prev, "pre-switch sync failed, switching anyway");
                    }
                }
            }
            UserSwitchStrategy::ClearAndFetch => {
                self.local.clear_user_data(new_user_id).await?;
                self.queue.forget(new_user_id);
            }
            UserSwitchStrategy::PromptIfUnsyncedData => {
                if had_unsynced {
                    return Ok(UserSwitchResult::failure(
                        previous.clone(),
                        new_user_id,
                        had_unsynced,
                        "Unsynced data present",
                    ));
                }
            }
            UserSwitchStrategy::KeepLocal => {}
        }

        self.queue.initialize_user(new_user_id).await?;
        *self.active_user.write() = Some(new_user_id.to_string());
        self.events.emit(SyncEvent::UserSwitched {
            previous: previous.clone(),
            new: new_user_id.to_string(),
            had_unsynced_data: had_unsynced,
        });

        Ok(UserSwitchResult::success(
            previous.clone(),
            new_user_id,
            had_unsynced,
        ))
    }

    /// The currently active user.
    pub fn active_user(&self) -> Option<String> {
        self.active_user.read().clone()
    }

    /// Shared handle to the local adapter.
    pub fn local_adapter(&self) -> Arc<L> {
        Arc::clone(&self.local)
    }

    /// Shared handle to the remote adapter.
    pub fn remote_adapter(&self) -> Arc<R> {
        Arc::clone(&self.remote)
    }

    // === Auto-sync ===

    /// Installs a repeating sync timer for a user, replacing any prior
    /// one. Ticks fire-and-forget a cycle with error logging.
    pub fn start_auto_sync(&self, user_id: &str, interval: Option<Duration>) {
        let interval = interval.unwrap_or(self.config.auto_sync_interval);
        let weak = self.self_ref.clone();
        let user = user_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                match manager.sync(&user).await {
                    Ok(report) => {
                        if report.failed > 0 {
                            tracing::warn!(
                                user_id = %user,
                                failed = report.failed,
                                "auto-sync completed with failures"
                            );
                        }
                    }
                    Err(error) => tracing::warn!(user_id = %user, %error, "auto-sync failed"),
                }
            }
        });

        if let Some(previous) = self.auto_sync.lock().insert(user_id.to_string(), handle) {
            previous.abort();
        }
        tracing::debug!(user_id, ?interval, "auto-sync started");
    }

    /// Stops the timer for one user, or every timer when `None`.
    pub fn stop_auto_sync(&self, user_id: Option<&str>) {
        let mut timers = self.auto_sync.lock();
        match user_id {
            Some(user) => {
                if let Some(handle) = timers.remove(user) {
                    handle.abort();
                }
            }
            None => {
                for (_, handle) in timers.drain() {
                    handle.abort();
                }
            }
        }
    }

    /// Host signal that connectivity came back. Fire-and-forgets a cycle
    /// for the active user when `auto_sync_on_connect` is set.
    pub fn connectivity_restored(&self) {
        if !self.config.auto_sync_on_connect {
            return;
        }
        let Some(user) = self.active_user() else {
            return;
        };
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            let Some(manager) = weak.upgrade() else { return };
            if let Err(error) = manager.sync(&user).await {
                tracing::warn!(user_id = %user, %error, "reconnect sync failed");
            }
        });
    }

    // === Reactive queries (delegated to the local adapter) ===

    /// Live snapshots of a user's entity set.
    pub fn watch_all(&self, user_id: &str) -> broadcast::Receiver<Vec<T>> {
        self.local.watch_all(user_id)
    }

    /// Live view of one entity.
    pub fn watch_by_id(&self, id: &str, user_id: &str) -> broadcast::Receiver<Option<T>> {
        self.local.watch_by_id(id, user_id)
    }

    /// Live pages of a user's entity set.
    pub fn watch_all_paginated(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> broadcast::Receiver<Vec<T>> {
        self.local.watch_all_paginated(user_id, limit, offset)
    }

    /// Live results of a field-equality query.
    pub fn watch_query(&self, user_id: &str, filter: &QueryFilter) -> broadcast::Receiver<Vec<T>> {
        self.local.watch_query(user_id, filter)
    }

    /// Live entity count.
    pub fn watch_count(&self, user_id: &str) -> broadcast::Receiver<u64> {
        self.local.watch_count(user_id)
    }

    /// Live view of the first entity.
    pub fn watch_first(&self, user_id: &str) -> broadcast::Receiver<Option<T>> {
        self.local.watch_first(user_id)
    }

    /// Live existence of one entity, derived from [`watch_by_id`].
    ///
    /// [`watch_by_id`]: SynqManager::watch_by_id
    pub fn watch_exists(&self, id: &str, user_id: &str) -> broadcast::Receiver<bool> {
        let mut source = self.local.watch_by_id(id, user_id);
        let (tx, rx) = broadcast::channel(16);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(value) => {
                        if tx.send(value.is_some()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    // === Teardown ===

    /// Stops timers and stream listeners, cancels in-flight cycles, and
    /// disposes both adapters. The manager rejects further calls.
    pub async fn dispose(&self) -> SynqResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_auto_sync(None);
        for handle in self.stream_tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(user) = self.active_user() {
            self.engine.cancel(&user);
        }

        self.local.dispose().await?;
        self.remote.dispose().await?;
        tracing::info!("synq manager disposed");
        Ok(())
    }
}

fn validate_ids(entity_id: &str, user_id: &str) -> SynqResult<()> {
    if entity_id.is_empty() {
        return Err(SynqError::Validation("entity id must not be empty".into()));
    }
    if user_id.is_empty() {
        return Err(SynqError::Validation("user id must not be empty".into()));
    }
    Ok(())
}

/// SHA-1 over the canonicalized business payload; the payload half of the
/// processed-change cache key.
fn business_hash<T: Syncable>(entity: Option<&T>) -> String {
    let mut hasher = Sha1::new();
    if let Some(entity) = entity {
        let sorted: BTreeMap<String, serde_json::Value> =
            entity.business_map().into_iter().collect();
        if let Ok(bytes) = serde_json::to_vec(&sorted) {
            hasher.update(&bytes);
        }
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use synq_testkit::{MemoryLocalAdapter, MemoryRemoteAdapter, Note};

    type NoteManager = SynqManager<Note, MemoryLocalAdapter<Note>, MemoryRemoteAdapter<Note>>;

    async fn manager() -> Arc<NoteManager> {
        let manager = SynqManager::new(
            SynqConfig::new(),
            MemoryLocalAdapter::new(),
            MemoryRemoteAdapter::new(),
        )
        .unwrap();
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn save_persists_and_enqueues() {
        let manager = manager().await;
        let note = Note::new("n1", "u1", "title", "body");

        manager.save(note, "u1").await.unwrap();

        assert!(manager.get("n1", "u1").await.unwrap().is_some());
        let pending = manager.pending_operations("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Create);
    }

    #[tokio::test]
    async fn unchanged_update_is_a_no_op() {
        let manager = manager().await;
        let note = Note::new("n1", "u1", "title", "body");
        manager.save(note.clone(), "u1").await.unwrap();

        // Same content again: nothing new in the queue.
        manager.save(note, "u1").await.unwrap();
        assert_eq!(manager.pending_operations("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_carries_a_delta() {
        let manager = manager().await;
        let note = Note::new("n1", "u1", "title", "body");
        manager.save(note.clone(), "u1").await.unwrap();

        let mut changed = note;
        changed.title = "renamed".into();
        changed.version = 2;
        manager.save(changed, "u1").await.unwrap();

        let pending = manager.pending_operations("u1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].kind, OperationKind::Update);
        let delta = pending[1].delta.as_ref().unwrap();
        assert!(delta.contains_key("title"));
        assert!(!delta.contains_key("body"));
    }

    #[tokio::test]
    async fn remote_origin_save_does_not_enqueue() {
        let manager = manager().await;
        let note = Note::new("n1", "u1", "title", "body");

        manager
            .save_with(
                note,
                "u1",
                MutationOptions::from_origin(ChangeOrigin::Remote),
            )
            .await
            .unwrap();

        assert!(manager.pending_operations("u1").await.unwrap().is_empty());
        assert!(manager.get("n1", "u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_of_absent_entity_is_a_no_op() {
        let manager = manager().await;
        assert!(!manager.delete("ghost", "u1").await.unwrap());
        assert!(manager.pending_operations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_empty_ids() {
        let manager = manager().await;
        let note = Note::new("", "u1", "t", "b");
        assert!(matches!(
            manager.save(note, "u1").await,
            Err(SynqError::Validation(_))
        ));

        let note = Note::new("n1", "u1", "t", "b");
        assert!(matches!(
            manager.save(note, "").await,
            Err(SynqError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn processed_cache_prunes_oldest_first() {
        let mut cache = ProcessedChanges::new(3);
        for i in 0..5 {
            cache.insert(format!("k{i}"), "h".into());
        }
        assert!(!cache.contains("k0", "h"));
        assert!(!cache.contains("k1", "h"));
        assert!(cache.contains("k2", "h"));
        assert!(cache.contains("k4", "h"));
    }

    #[tokio::test]
    async fn business_hash_ignores_metadata_and_local_fields() {
        let a = Note::new("n1", "u1", "t", "b");
        let mut b = a.clone();
        b.version = 99;
        b.pinned_locally = true;
        assert_eq!(business_hash(Some(&a)), business_hash(Some(&b)));

        let mut c = a.clone();
        c.body = "different".into();
        assert_ne!(business_hash(Some(&a)), business_hash(Some(&c)));

        assert_ne!(business_hash(Some(&a)), business_hash::<Note>(None));
    }

    #[tokio::test]
    async fn dispose_rejects_further_mutations() {
        let manager = manager().await;
        manager.dispose().await.unwrap();

        let note = Note::new("n1", "u1", "t", "b");
        assert!(manager.save(note, "u1").await.is_err());
    }
}
