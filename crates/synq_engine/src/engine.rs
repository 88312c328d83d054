//! The per-user sync state machine.
//!
//! One [`SyncEngine`] serves every user of a manager, but cycles are keyed
//! by user: at most one cycle runs per user at a time, and distinct users
//! sync concurrently. A cycle is a push phase (drain the pending queue in
//! FIFO batches), a pull phase (fetch remote state, detect and resolve
//! conflicts, reconcile local storage), and a finalization step that writes
//! fresh sync metadata to both sides.
//!
//! Cancellation and timeout travel as error sum-type sentinels, checked at
//! every suspension point; `synchronize` converts them into a normal
//! [`SyncReport`] at the boundary. A cycle that already committed work
//! never undoes it — the sentinels only stop further progress.

use crate::adapter::{AlwaysOnline, ConnectivityProbe, LocalAdapter, RemoteAdapter, SyncScope};
use crate::config::{SyncDirection, SyncOptions, SynqConfig};
use crate::detector::ConflictDetector;
use crate::error::{SynqError, SynqResult};
use crate::events::{EventBus, MetadataBoard, StatusBoard, SyncEvent};
use crate::observer::MiddlewareChain;
use crate::queue::QueueManager;
use crate::stats::StatsRecorder;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use synq_protocol::{
    ChangeKind, ChangeOrigin, ConflictContext, FieldMap, OperationKind, Resolution,
    ResolutionStrategy, SyncMetadata, SyncOperation, SyncStatus, SyncStatusSnapshot, Syncable,
};
use tokio::sync::watch;

/// Parameters for one `synchronize` call.
pub struct SyncRequest<T: Syncable> {
    /// Pull even when metadata says nothing changed; also gates the
    /// remote-restore behaviour on an empty remote.
    pub force: bool,
    /// Partial-pull filter. A scoped cycle never deletes local data.
    pub scope: Option<SyncScope>,
    /// Per-call option overrides.
    pub options: SyncOptions<T>,
}

impl<T: Syncable> SyncRequest<T> {
    /// A plain full sync with default options.
    pub fn new() -> Self {
        Self {
            force: false,
            scope: None,
            options: SyncOptions::new(),
        }
    }

    /// A forced full sync.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::new()
        }
    }

    /// Narrows the pull phase to a scope.
    #[must_use]
    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Replaces the per-call options.
    #[must_use]
    pub fn with_options(mut self, options: SyncOptions<T>) -> Self {
        self.options = options;
        self
    }
}

impl<T: Syncable> Default for SyncRequest<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// The user that synced.
    pub user_id: String,
    /// Operations reconciled with the remote.
    pub synced: u64,
    /// Operations that failed terminally this cycle (still queued).
    pub failed: u64,
    /// Conflicts settled by the resolver this cycle.
    pub conflicts_resolved: u64,
    /// Queue length when the cycle ended.
    pub pending_operations: u64,
    /// Wall-clock cycle duration.
    pub duration: Duration,
    /// Errors accumulated along the way.
    pub errors: Vec<String>,
    /// Whether the cycle was cut short by `cancel`.
    pub was_cancelled: bool,
}

/// Completes when the paused user is resumed (or cancelled).
pub struct ResumeSignal {
    receiver: watch::Receiver<bool>,
}

impl ResumeSignal {
    /// Waits for the pause latch to release.
    pub async fn resumed(mut self) {
        while *self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

struct UserState {
    in_progress: AtomicBool,
    cancelled: AtomicBool,
    paused: watch::Sender<bool>,
}

impl UserState {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            in_progress: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            paused,
        }
    }
}

#[derive(Default)]
struct CycleProgress {
    synced: u64,
    failed: u64,
    conflicts_resolved: u64,
    errors: Vec<String>,
}

/// The per-user push/pull state machine.
pub struct SyncEngine<T, L, R>
where
    T: Syncable,
    L: LocalAdapter<T>,
    R: RemoteAdapter<T>,
{
    config: SynqConfig<T>,
    local: Arc<L>,
    remote: Arc<R>,
    probe: Arc<dyn ConnectivityProbe>,
    queue: Arc<QueueManager<T, L>>,
    middleware: Arc<MiddlewareChain<T>>,
    events: EventBus<T>,
    status: StatusBoard,
    metadata: MetadataBoard,
    stats: Arc<StatsRecorder>,
    detector: ConflictDetector,
    users: Mutex<HashMap<String, Arc<UserState>>>,
}

impl<T, L, R> SyncEngine<T, L, R>
where
    T: Syncable,
    L: LocalAdapter<T>,
    R: RemoteAdapter<T>,
{
    /// Creates an engine over shared infrastructure. The probe defaults to
    /// [`AlwaysOnline`].
    pub fn new(
        config: SynqConfig<T>,
        local: Arc<L>,
        remote: Arc<R>,
        queue: Arc<QueueManager<T, L>>,
        middleware: Arc<MiddlewareChain<T>>,
        events: EventBus<T>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            probe: Arc::new(AlwaysOnline),
            queue,
            middleware,
            events,
            status: StatusBoard::new(),
            metadata: MetadataBoard::new(),
            stats,
            detector: ConflictDetector::new(),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the connectivity probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn user_state(&self, user_id: &str) -> Arc<UserState> {
        Arc::clone(
            self.users
                .lock()
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(UserState::new())),
        )
    }

    /// Whether a cycle is currently running for this user.
    pub fn is_syncing(&self, user_id: &str) -> bool {
        self.user_state(user_id).in_progress.load(Ordering::SeqCst)
    }

    /// The user's latest status snapshot.
    pub fn status(&self, user_id: &str) -> SyncStatusSnapshot {
        self.status.current(user_id)
    }

    /// Watches the user's status projection.
    pub fn watch_status(&self, user_id: &str) -> watch::Receiver<SyncStatusSnapshot> {
        self.status.watch(user_id)
    }

    /// The user's latest published sync metadata.
    pub fn current_metadata(&self, user_id: &str) -> Option<SyncMetadata> {
        self.metadata.current(user_id)
    }

    /// Watches the user's metadata stream.
    pub fn watch_metadata(&self, user_id: &str) -> watch::Receiver<Option<SyncMetadata>> {
        self.metadata.watch(user_id)
    }

    /// Engages the pause latch for a user. Idempotent. The returned signal
    /// completes when `resume` (or `cancel`) releases the latch.
    pub fn pause(&self, user_id: &str) -> ResumeSignal {
        let state = self.user_state(user_id);
        state.paused.send_replace(true);
        self.status
            .publish(self.status.current(user_id).with_status(SyncStatus::Paused));
        tracing::debug!(user_id, "sync paused");
        ResumeSignal {
            receiver: state.paused.subscribe(),
        }
    }

    /// Releases the pause latch.
    pub fn resume(&self, user_id: &str) {
        let state = self.user_state(user_id);
        state.paused.send_replace(false);
        self.status
            .publish(self.status.current(user_id).with_status(SyncStatus::Syncing));
        tracing::debug!(user_id, "sync resumed");
    }

    /// Requests cooperative cancellation. The flag is checked before each
    /// operation and at every suspension point; any pause latch is released
    /// so a waiting cycle observes the cancellation.
    pub fn cancel(&self, user_id: &str) {
        let state = self.user_state(user_id);
        state.cancelled.store(true, Ordering::SeqCst);
        state.paused.send_replace(false);
        tracing::debug!(user_id, "sync cancellation requested");
    }

    /// Runs one sync cycle for a user.
    ///
    /// Rejects with [`SynqError::ConcurrentSync`] while another cycle for
    /// the same user is in flight. Cancellation and timeout come back as a
    /// normal report (`was_cancelled` / an appended timeout error); other
    /// cycle-level failures re-raise after publishing a failed status and a
    /// [`SyncEvent::SyncError`].
    pub async fn synchronize(
        &self,
        user_id: &str,
        request: SyncRequest<T>,
    ) -> SynqResult<SyncReport> {
        if user_id.is_empty() {
            return Err(SynqError::Validation("user id must not be empty".into()));
        }

        let state = self.user_state(user_id);
        if state.in_progress.swap(true, Ordering::SeqCst) {
            return Err(SynqError::ConcurrentSync {
                user_id: user_id.to_string(),
            });
        }

        let started = Instant::now();
        let deadline = self.config.effective_timeout(&request.options);
        let mut progress = CycleProgress::default();

        let outcome = self
            .run_cycle(user_id, &state, &request, started, deadline, &mut progress)
            .await;

        // The cancel flag is consumed by the cycle it stopped.
        state.cancelled.store(false, Ordering::SeqCst);
        state.in_progress.store(false, Ordering::SeqCst);

        let duration = started.elapsed();
        let pending = self.queue.pending_count(user_id) as u64;
        let now = Utc::now();

        match outcome {
            Ok(()) => {
                let report = SyncReport {
                    user_id: user_id.to_string(),
                    synced: progress.synced,
                    failed: progress.failed,
                    conflicts_resolved: progress.conflicts_resolved,
                    pending_operations: pending,
                    duration,
                    errors: progress.errors,
                    was_cancelled: false,
                };
                if let Err(error) = self.middleware.after_sync(user_id, &report).await {
                    self.status.publish(self.status.current(user_id).finished(
                        SyncStatus::Failed,
                        pending,
                        vec![error.to_string()],
                        now,
                    ));
                    self.events.emit(SyncEvent::SyncError {
                        user_id: user_id.to_string(),
                        message: error.to_string(),
                        detail: None,
                    });
                    self.stats.record_cycle(false, duration);
                    return Err(error);
                }
                self.events.emit(SyncEvent::SyncCompleted {
                    user_id: user_id.to_string(),
                    synced: report.synced,
                    failed: report.failed,
                });
                let status = if report.failed == 0 {
                    SyncStatus::Completed
                } else {
                    SyncStatus::Failed
                };
                self.status.publish(self.status.current(user_id).finished(
                    status,
                    pending,
                    report.errors.clone(),
                    now,
                ));
                self.stats.record_cycle(report.failed == 0, duration);
                Ok(report)
            }
            Err(SynqError::Cancelled) => {
                self.status.publish(self.status.current(user_id).finished(
                    SyncStatus::Cancelled,
                    pending,
                    progress.errors.clone(),
                    now,
                ));
                self.events.emit(SyncEvent::SyncError {
                    user_id: user_id.to_string(),
                    message: "sync cancelled".into(),
                    detail: None,
                });
                self.stats.record_cycle(false, duration);
                Ok(SyncReport {
                    user_id: user_id.to_string(),
                    synced: progress.synced,
                    failed: progress.failed,
                    conflicts_resolved: progress.conflicts_resolved,
                    pending_operations: pending,
                    duration,
                    errors: progress.errors,
                    was_cancelled: true,
                })
            }
            Err(SynqError::Timeout { limit }) => {
                let message = format!("sync timed out after {limit:?}");
                progress.errors.push(message.clone());
                self.status.publish(self.status.current(user_id).finished(
                    SyncStatus::Failed,
                    pending,
                    progress.errors.clone(),
                    now,
                ));
                self.events.emit(SyncEvent::SyncError {
                    user_id: user_id.to_string(),
                    message,
                    detail: None,
                });
                self.stats.record_cycle(false, duration);
                Ok(SyncReport {
                    user_id: user_id.to_string(),
                    synced: progress.synced,
                    failed: progress.failed,
                    conflicts_resolved: progress.conflicts_resolved,
                    pending_operations: pending,
                    duration,
                    errors: progress.errors,
                    was_cancelled: false,
                })
            }
            Err(error) => {
                self.status.publish(self.status.current(user_id).finished(
                    SyncStatus::Failed,
                    pending,
                    vec![error.to_string()],
                    now,
                ));
                self.events.emit(SyncEvent::SyncError {
                    user_id: user_id.to_string(),
                    message: error.to_string(),
                    detail: None,
                });
                self.stats.record_cycle(false, duration);
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_cycle(
        &self,
        user_id: &str,
        state: &UserState,
        request: &SyncRequest<T>,
        started: Instant,
        deadline: Option<Duration>,
        progress: &mut CycleProgress,
    ) -> SynqResult<()> {
        // A cancel issued before the cycle started still counts.
        if state.cancelled.load(Ordering::SeqCst) {
            return Err(SynqError::Cancelled);
        }

        let direction = request
            .options
            .direction
            .unwrap_or(self.config.default_direction);

        // Preflight.
        self.queue.initialize_user(user_id).await?;
        let pending = self.queue.pending_count(user_id) as u64;
        self.events.emit(SyncEvent::SyncStarted {
            user_id: user_id.to_string(),
            pending,
        });
        self.status
            .publish(self.status.current(user_id).started(pending, Utc::now()));

        if !(self.probe.is_online().await && self.remote.is_connected().await) {
            return Err(SynqError::NetworkUnavailable);
        }
        self.middleware.before_sync(user_id).await?;

        match direction {
            SyncDirection::PushThenPull => {
                self.push_phase(user_id, state, &request.options, started, deadline, progress)
                    .await?;
                if state.cancelled.load(Ordering::SeqCst) {
                    return Err(SynqError::Cancelled);
                }
                let pushed_nontrivial = progress.synced > 0;
                self.pull_phase(
                    user_id,
                    state,
                    request,
                    started,
                    deadline,
                    progress,
                    pushed_nontrivial,
                )
                .await?;
            }
            SyncDirection::PullThenPush => {
                self.pull_phase(user_id, state, request, started, deadline, progress, false)
                    .await?;
                if state.cancelled.load(Ordering::SeqCst) {
                    return Err(SynqError::Cancelled);
                }
                self.push_phase(user_id, state, &request.options, started, deadline, progress)
                    .await?;
            }
            SyncDirection::PushOnly => {
                self.push_phase(user_id, state, &request.options, started, deadline, progress)
                    .await?;
            }
            SyncDirection::PullOnly => {
                self.pull_phase(user_id, state, request, started, deadline, progress, false)
                    .await?;
            }
        }

        self.finalize(user_id).await
    }

    /// Gate awaited before every operation: cancel flag, deadline, pause
    /// latch, in that order.
    async fn operation_gate(
        &self,
        state: &UserState,
        started: Instant,
        deadline: Option<Duration>,
    ) -> SynqResult<()> {
        if state.cancelled.load(Ordering::SeqCst) {
            return Err(SynqError::Cancelled);
        }
        check_deadline(started, deadline)?;
        self.wait_while_paused(state, started, deadline).await
    }

    async fn wait_while_paused(
        &self,
        state: &UserState,
        started: Instant,
        deadline: Option<Duration>,
    ) -> SynqResult<()> {
        let mut paused = state.paused.subscribe();
        loop {
            if state.cancelled.load(Ordering::SeqCst) {
                return Err(SynqError::Cancelled);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            match deadline {
                Some(limit) => {
                    let remaining = limit
                        .checked_sub(started.elapsed())
                        .ok_or(SynqError::Timeout { limit })?;
                    if tokio::time::timeout(remaining, paused.changed())
                        .await
                        .is_err()
                    {
                        return Err(SynqError::Timeout { limit });
                    }
                }
                None => {
                    if paused.changed().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn push_phase(
        &self,
        user_id: &str,
        state: &UserState,
        options: &SyncOptions<T>,
        started: Instant,
        deadline: Option<Duration>,
        progress: &mut CycleProgress,
    ) -> SynqResult<()> {
        let operations = self.queue.pending(user_id);
        let total = operations.len() as u64;
        if total == 0 {
            return Ok(());
        }

        let batch_size = self.config.effective_batch_size(options);
        let retry_delay = chrono::Duration::from_std(self.config.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));

        for batch in operations.chunks(batch_size) {
            for operation in batch {
                self.operation_gate(state, started, deadline).await?;

                if operation.kind == OperationKind::Delete && !options.include_deletes {
                    continue;
                }

                // A recently failed operation waits out the retry delay on
                // a later cycle instead of busy-retrying.
                if operation.retry_count > 0 {
                    if let Some(last) = operation.last_attempt_at {
                        if Utc::now() - last < retry_delay {
                            if self.config.enable_logging {
                                tracing::debug!(
                                    user_id,
                                    entity_id = %operation.entity_id,
                                    retry_count = operation.retry_count,
                                    "retry delay not elapsed, leaving operation queued"
                                );
                            }
                            continue;
                        }
                    }
                }

                let attempt = async {
                    self.middleware.before_operation(operation).await?;
                    self.dispatch_operation(user_id, operation).await
                };

                match attempt.await {
                    Ok(()) => {
                        self.queue
                            .mark_completed(user_id, operation.operation_id)
                            .await?;
                        self.middleware.after_operation(operation).await?;
                        progress.synced += 1;
                        self.events.emit(SyncEvent::SyncProgress {
                            user_id: user_id.to_string(),
                            completed: progress.synced,
                            total,
                        });
                        self.status.publish(self.status.current(user_id).progressed(
                            progress.synced,
                            progress.failed,
                            total,
                        ));
                    }
                    Err(error @ (SynqError::Cancelled | SynqError::Timeout { .. })) => {
                        return Err(error);
                    }
                    Err(error) => {
                        if error.is_retryable() && operation.retry_count < self.config.max_retries
                        {
                            if self.config.enable_logging {
                                tracing::debug!(
                                    user_id,
                                    entity_id = %operation.entity_id,
                                    %error,
                                    retry_count = operation.retry_count + 1,
                                    "operation failed, queued for retry"
                                );
                            }
                            self.queue
                                .update(user_id, operation.with_retry(Utc::now()))
                                .await?;
                        } else {
                            tracing::warn!(
                                user_id,
                                entity_id = %operation.entity_id,
                                %error,
                                "operation failed terminally this cycle"
                            );
                            self.middleware.on_operation_error(operation, &error).await;
                            progress.failed += 1;
                            progress.errors.push(error.to_string());
                            self.status.publish(self.status.current(user_id).progressed(
                                progress.synced,
                                progress.failed,
                                total,
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_operation(
        &self,
        user_id: &str,
        operation: &SyncOperation<T>,
    ) -> SynqResult<()> {
        match operation.kind {
            OperationKind::Create | OperationKind::Update => {
                let entity = operation.snapshot.clone().ok_or_else(|| {
                    SynqError::Validation(format!(
                        "operation {} carries no snapshot",
                        operation.operation_id
                    ))
                })?;
                let outbound = self.middleware.to_remote(entity).await?;

                let authoritative = match operation.delta.as_ref() {
                    Some(delta)
                        if self.config.enable_partial_updates
                            && operation.has_delta()
                            && self.remote.supports_patch() =>
                    {
                        let projected = remote_projected_delta::<T>(delta);
                        if projected.is_empty() {
                            self.remote.push(&outbound, user_id).await?
                        } else {
                            self.remote
                                .patch(&operation.entity_id, user_id, &projected)
                                .await?
                        }
                    }
                    _ => self.remote.push(&outbound, user_id).await?,
                };

                let inbound = self.middleware.from_remote(authoritative).await?;
                self.local.save(&inbound, user_id).await?;
                self.events.emit(SyncEvent::DataChanged {
                    user_id: user_id.to_string(),
                    entity: inbound,
                    kind: match operation.kind {
                        OperationKind::Create => ChangeKind::Create,
                        _ => ChangeKind::Update,
                    },
                    origin: ChangeOrigin::Remote,
                });
                Ok(())
            }
            OperationKind::Delete => {
                self.remote
                    .delete_remote(&operation.entity_id, user_id)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pull_phase(
        &self,
        user_id: &str,
        state: &UserState,
        request: &SyncRequest<T>,
        started: Instant,
        deadline: Option<Duration>,
        progress: &mut CycleProgress,
        pushed_nontrivial: bool,
    ) -> SynqResult<()> {
        let local_meta = self.local.get_sync_metadata(user_id).await?;
        let remote_meta = self.remote.get_sync_metadata(user_id).await?;
        let metadata_differs = match (&local_meta, &remote_meta) {
            (Some(l), Some(r)) => !l.matches(r),
            _ => true,
        };

        if !(request.force || pushed_nontrivial || metadata_differs) {
            if self.config.enable_logging {
                tracing::debug!(user_id, "metadata unchanged, skipping pull");
            }
            return Ok(());
        }

        let remote_items = self
            .remote
            .fetch_all(user_id, request.scope.as_ref())
            .await?;
        let full_sync = request.scope.is_none();
        let pending_ids: HashSet<String> = self
            .queue
            .pending(user_id)
            .iter()
            .map(|op| op.entity_id.clone())
            .collect();

        if remote_items.is_empty() {
            if full_sync {
                self.restore_or_prune(user_id, state, &pending_ids, started, deadline, progress)
                    .await?;
            }
            return Ok(());
        }

        let ids: Vec<String> = remote_items.iter().map(|e| e.id().to_string()).collect();
        let local_map = self.local.get_by_ids(&ids, user_id).await?;
        let resolver = request
            .options
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.config.default_resolver));

        for remote_item in remote_items {
            self.operation_gate(state, started, deadline).await?;
            let id = remote_item.id().to_string();
            let local_item = local_map.get(&id);

            // Remote tombstone: garbage-collect locally unless an outgoing
            // operation still references the entity.
            if remote_item.is_deleted() {
                if !pending_ids.contains(&id) && self.local.delete(&id, user_id).await? {
                    if let Some(previous) = local_item {
                        self.events.emit(SyncEvent::DataChanged {
                            user_id: user_id.to_string(),
                            entity: previous.clone(),
                            kind: ChangeKind::Delete,
                            origin: ChangeOrigin::Remote,
                        });
                    }
                }
                continue;
            }

            if !request.options.resolve_conflicts {
                self.accept_remote(user_id, remote_item, local_item.is_some())
                    .await?;
                continue;
            }

            match self.detector.detect(user_id, local_item, Some(&remote_item)) {
                None => {
                    self.accept_remote(user_id, remote_item, local_item.is_some())
                        .await?;
                }
                Some(kind) => {
                    let context = ConflictContext::new(user_id, &id, kind)
                        .with_metadata(local_meta.clone(), remote_meta.clone());
                    self.events.emit(SyncEvent::ConflictDetected {
                        context: context.clone(),
                        local: local_item.cloned(),
                        remote: Some(remote_item.clone()),
                    });
                    self.middleware.on_conflict(&context).await;

                    let resolution = resolver
                        .resolve(local_item, Some(&remote_item), &context)
                        .await;
                    let applied = self
                        .apply_resolution(user_id, local_item, resolution)
                        .await?;
                    self.stats.record_conflict(applied);
                    if applied {
                        progress.conflicts_resolved += 1;
                    }
                }
            }
        }

        // Full sync only: drop local entities the remote no longer knows,
        // unless an outgoing operation protects them. Scoped pulls never
        // delete.
        if full_sync {
            let seen: HashSet<String> = ids.into_iter().collect();
            for item in self.local.get_all(user_id).await? {
                if seen.contains(item.id()) || pending_ids.contains(item.id()) {
                    continue;
                }
                self.operation_gate(state, started, deadline).await?;
                if self.local.delete(item.id(), user_id).await? {
                    self.events.emit(SyncEvent::DataChanged {
                        user_id: user_id.to_string(),
                        entity: item,
                        kind: ChangeKind::Delete,
                        origin: ChangeOrigin::Remote,
                    });
                }
            }
        }

        Ok(())
    }

    /// Empty remote on a full sync: either the remote was wiped and local
    /// data should restore it, or local leftovers should be pruned.
    async fn restore_or_prune(
        &self,
        user_id: &str,
        state: &UserState,
        pending_ids: &HashSet<String>,
        started: Instant,
        deadline: Option<Duration>,
        progress: &mut CycleProgress,
    ) -> SynqResult<()> {
        let local_items = self.local.get_all(user_id).await?;
        let restorable: Vec<&T> = local_items
            .iter()
            .filter(|e| !e.is_deleted() && !pending_ids.contains(e.id()))
            .collect();

        if !restorable.is_empty() {
            tracing::info!(
                user_id,
                count = restorable.len(),
                "remote is empty, restoring from local data"
            );
            for item in restorable {
                self.operation_gate(state, started, deadline).await?;
                let outbound = self.middleware.to_remote(item.clone()).await?;
                self.remote.push(&outbound, user_id).await?;
                progress.synced += 1;
            }
            return Ok(());
        }

        for item in local_items {
            if pending_ids.contains(item.id()) {
                continue;
            }
            self.operation_gate(state, started, deadline).await?;
            if self.local.delete(item.id(), user_id).await? {
                self.events.emit(SyncEvent::DataChanged {
                    user_id: user_id.to_string(),
                    entity: item,
                    kind: ChangeKind::Delete,
                    origin: ChangeOrigin::Remote,
                });
            }
        }
        Ok(())
    }

    /// Writes a remote item into local storage and emits the data change.
    async fn accept_remote(&self, user_id: &str, remote_item: T, existed: bool) -> SynqResult<()> {
        let inbound = self.middleware.from_remote(remote_item).await?;
        self.local.save(&inbound, user_id).await?;
        self.events.emit(SyncEvent::DataChanged {
            user_id: user_id.to_string(),
            entity: inbound,
            kind: if existed {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            },
            origin: ChangeOrigin::Remote,
        });
        Ok(())
    }

    /// Applies a resolver's decision. Returns whether any reconciling
    /// action was taken.
    async fn apply_resolution(
        &self,
        user_id: &str,
        local_item: Option<&T>,
        resolution: Resolution<T>,
    ) -> SynqResult<bool> {
        match resolution.strategy {
            ResolutionStrategy::UseLocal => match local_item {
                Some(local) => {
                    let outbound = self.middleware.to_remote(local.clone()).await?;
                    self.remote.push(&outbound, user_id).await?;
                    Ok(true)
                }
                None => {
                    tracing::warn!(user_id, "resolution chose local but no local copy exists");
                    Ok(false)
                }
            },
            ResolutionStrategy::UseRemote => match resolution.resolved {
                Some(entity) => {
                    let inbound = self.middleware.from_remote(entity).await?;
                    self.local.save(&inbound, user_id).await?;
                    self.events.emit(SyncEvent::DataChanged {
                        user_id: user_id.to_string(),
                        entity: inbound,
                        kind: ChangeKind::Update,
                        origin: ChangeOrigin::Remote,
                    });
                    Ok(true)
                }
                None => {
                    tracing::warn!(user_id, "resolution chose remote without a payload");
                    Ok(false)
                }
            },
            ResolutionStrategy::Merge => match resolution.resolved {
                Some(entity) => {
                    self.local.save(&entity, user_id).await?;
                    let outbound = self.middleware.to_remote(entity.clone()).await?;
                    self.remote.push(&outbound, user_id).await?;
                    self.events.emit(SyncEvent::DataChanged {
                        user_id: user_id.to_string(),
                        entity,
                        kind: ChangeKind::Update,
                        origin: ChangeOrigin::Merged,
                    });
                    Ok(true)
                }
                None => {
                    tracing::warn!(user_id, "merge resolution carried no payload");
                    Ok(false)
                }
            },
            ResolutionStrategy::Abort | ResolutionStrategy::AskUser => {
                tracing::info!(
                    user_id,
                    strategy = ?resolution.strategy,
                    message = resolution.message.as_deref().unwrap_or(""),
                    "conflict left unsettled for this cycle"
                );
                Ok(false)
            }
        }
    }

    /// Recomputes sync metadata from the local set and writes it to both
    /// sides.
    async fn finalize(&self, user_id: &str) -> SynqResult<()> {
        let entities = self.local.get_all(user_id).await?;
        let metadata = SyncMetadata::compute(user_id, &entities);
        self.local.update_sync_metadata(&metadata, user_id).await?;
        self.remote.update_sync_metadata(&metadata, user_id).await?;
        self.metadata.publish(metadata);
        Ok(())
    }
}

/// Strips local-only fields from a delta before it travels to the remote.
fn remote_projected_delta<T: Syncable>(delta: &FieldMap) -> FieldMap {
    let mut projected = delta.clone();
    for field in T::local_only_fields() {
        projected.remove(*field);
    }
    projected
}

fn check_deadline(started: Instant, deadline: Option<Duration>) -> SynqResult<()> {
    if let Some(limit) = deadline {
        if started.elapsed() >= limit {
            return Err(SynqError::Timeout { limit });
        }
    }
    Ok(())
}
