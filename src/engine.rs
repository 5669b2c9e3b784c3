//! Sync Engine - Main coordinator
//!
//! The `SyncEngine` is the primary entry point for the library. It owns
//! the entry store, the transfer scheduler and the event bus, and exposes
//! the controller operations: start a course sync, pause/resume/delete
//! entries or whole courses, and subscribe to status changes.
//!
//! Construct one engine per process and share it by `Arc`.

use crate::bus::{EventBus, Subscription, DEFAULT_CAPACITY};
use crate::composer::ContentComposer;
use crate::config::SyncConfig;
use crate::disk::{Disk, OfflineLayout};
#[cfg(feature = "storage")]
use crate::disk::LocalDisk;
use crate::error::{Result, SyncError};
use crate::job::CourseSyncJob;
use crate::protocol::{CourseId, CourseSummary, EntryId, EntryStatus, SyncEntry};
use crate::scheduler::{self, StopIntent, SyncContext};
use crate::source::ContentSource;
#[cfg(feature = "storage")]
use crate::storage::SqliteEntryStore;
use crate::storage::{EntryChange, EntryStore, TransactionOutcome};
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Collaborators an engine is assembled from
pub struct EngineParts {
    pub store: Arc<dyn EntryStore>,
    pub disk: Arc<dyn Disk>,
    pub source: Arc<dyn ContentSource>,
    pub transport: Arc<dyn Transport>,
}

/// What startup reconciliation repaired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `active` rows left behind by a previous process
    pub requeued: usize,
    /// `completed` rows whose file was missing or had the wrong size
    pub invalidated: usize,
    /// Partial files cut back to their checkpoint
    pub truncated: usize,
    /// Files no row owns
    pub orphans_removed: usize,
}

/// The main sync engine
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    composer: ContentComposer,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    recovery: RecoveryReport,
}

impl SyncEngine {
    /// Create an engine persisting to SQLite under the session root
    #[cfg(feature = "storage")]
    pub async fn new(
        config: SyncConfig,
        source: Arc<dyn ContentSource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = Arc::new(SqliteEntryStore::new(config.get_database_path()).await?);
        Self::with_parts(
            config,
            EngineParts {
                store,
                disk: Arc::new(LocalDisk::new()),
                source,
                transport,
            },
        )
        .await
    }

    /// Create an engine from explicit collaborators.
    ///
    /// Runs startup reconciliation before the scheduler starts, so no
    /// `active` row from a previous process is ever dispatched as such.
    pub async fn with_parts(config: SyncConfig, parts: EngineParts) -> Result<Arc<Self>> {
        config.validate()?;
        parts.store.health_check().await?;

        let layout = OfflineLayout::new(&config.root_dir, &config.session_id);
        let composer = ContentComposer::new(parts.source, layout);
        let ctx = Arc::new(SyncContext::new(
            config,
            parts.store,
            parts.disk,
            parts.transport,
            EventBus::new(DEFAULT_CAPACITY),
        ));

        let recovery = reconcile_startup(&ctx, composer.layout()).await?;
        if recovery != RecoveryReport::default() {
            tracing::info!(
                requeued = recovery.requeued,
                invalidated = recovery.invalidated,
                truncated = recovery.truncated,
                orphans_removed = recovery.orphans_removed,
                "Startup reconciliation repaired entries"
            );
        }

        let dispatcher = scheduler::spawn_dispatcher(Arc::clone(&ctx));
        Ok(Arc::new(Self {
            ctx,
            composer,
            dispatcher: Mutex::new(Some(dispatcher)),
            recovery,
        }))
    }

    /// Compose a course and queue everything that is not yet downloaded
    pub async fn start_sync(&self, course_id: &CourseId) -> Result<CourseSyncJob> {
        self.start_sync_with(course_id, true).await
    }

    /// Like [`start_sync`](Self::start_sync), choosing whether the content
    /// source may answer from its cache
    pub async fn start_sync_with(
        &self,
        course_id: &CourseId,
        use_cache: bool,
    ) -> Result<CourseSyncJob> {
        self.ensure_accepting()?;
        tracing::info!(course = %course_id, use_cache, "Starting course sync");

        // Resolution errors surface here, before anything is written
        let candidates = self.composer.compose_all(course_id, use_cache).await?;
        let ids: Vec<EntryId> = candidates.iter().map(|e| e.id.clone()).collect();

        // Registered before the commit so no settle event is missed
        let job = self.ctx.jobs.register(course_id, ids.clone());
        let changes = match self
            .ctx
            .store
            .merge(candidates, ContentComposer::merge_fn())
            .await
        {
            Ok(changes) => changes,
            Err(e) => {
                self.ctx.jobs.abandon(job.id());
                return Err(e);
            }
        };

        let mut queued = 0usize;
        for change in &changes {
            if is_visible(change) {
                self.ctx.emit(change);
            }
            if change.current.status == EntryStatus::Queued {
                queued += 1;
            }
            self.ctx
                .jobs
                .settle(job.id(), &change.current.id, change.current.status);
        }

        let composed: HashSet<&EntryId> = ids.iter().collect();
        let removed = match self.sweep_stale(course_id, &composed).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(course = %course_id, error = %e, "Failed to remove stale entries");
                0
            }
        };

        tracing::info!(
            course = %course_id,
            job = %job.id(),
            entries = ids.len(),
            queued,
            removed,
            "Course sync committed"
        );
        self.ctx.wake_dispatcher();
        Ok(job)
    }

    /// Delete rows of a course the last composition no longer produced
    async fn sweep_stale(&self, course_id: &CourseId, composed: &HashSet<&EntryId>) -> Result<usize> {
        let stale: Vec<SyncEntry> = self
            .ctx
            .store
            .find_by_course(course_id)
            .await?
            .into_iter()
            .filter(|e| !composed.contains(&e.id))
            .collect();

        let mut removed = 0;
        for entry in stale {
            tracing::debug!(entry = %entry.id, "Removing entry no longer in course");
            if self.remove_entry(&entry.id).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Pause an entry.
    ///
    /// A queued entry is paused right away. An active entry records the
    /// request and its worker pauses at the next chunk boundary.
    pub async fn pause(&self, id: &EntryId) -> Result<()> {
        let outcome = self
            .ctx
            .store
            .transaction(
                id,
                Box::new(|e| match e.status {
                    EntryStatus::Queued => {
                        e.status = EntryStatus::Paused;
                        e.next_attempt_at = None;
                        true
                    }
                    EntryStatus::Active if !e.pause_requested => {
                        e.pause_requested = true;
                        true
                    }
                    _ => false,
                }),
            )
            .await?;

        match outcome {
            TransactionOutcome::Missing => Err(SyncError::NotFound(id.to_string())),
            TransactionOutcome::Applied(change) => {
                if change.current.status == EntryStatus::Active {
                    tracing::debug!(entry = %id, "Pause requested for active transfer");
                    self.ctx.control.request(id, StopIntent::Pause);
                } else {
                    tracing::debug!(entry = %id, "Entry paused");
                    self.ctx.emit(&change);
                }
                Ok(())
            }
            TransactionOutcome::Unchanged(entry) => match entry.status {
                EntryStatus::Paused | EntryStatus::Active => Ok(()),
                status => Err(SyncError::InvalidState {
                    action: "pause",
                    current_state: status.to_string(),
                }),
            },
        }
    }

    /// Pause every pausable entry of a course; returns how many were paused
    pub async fn pause_all(&self, course_id: &CourseId) -> Result<usize> {
        let mut paused = 0;
        for entry in self.ctx.store.find_by_course(course_id).await? {
            if !matches!(entry.status, EntryStatus::Queued | EntryStatus::Active) {
                continue;
            }
            match self.pause(&entry.id).await {
                Ok(()) => paused += 1,
                Err(SyncError::InvalidState { .. }) | Err(SyncError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(paused)
    }

    /// Move a paused, failed or server-error entry back to the queue.
    ///
    /// A manual resume resets the retry budget.
    pub async fn resume(&self, id: &EntryId) -> Result<()> {
        match self.requeue(id).await? {
            TransactionOutcome::Missing => Err(SyncError::NotFound(id.to_string())),
            TransactionOutcome::Applied(_) => Ok(()),
            TransactionOutcome::Unchanged(entry) => match entry.status {
                EntryStatus::Queued => Ok(()),
                EntryStatus::Active if entry.pause_requested => {
                    // Let the worker finish pausing, then queue it again
                    self.stop_transfer(id, StopIntent::Pause).await;
                    match self.requeue(id).await? {
                        TransactionOutcome::Missing => Err(SyncError::NotFound(id.to_string())),
                        _ => Ok(()),
                    }
                }
                EntryStatus::Active => Ok(()),
                status => Err(SyncError::InvalidState {
                    action: "resume",
                    current_state: status.to_string(),
                }),
            },
        }
    }

    /// Resume every resumable entry of a course; returns how many were queued
    pub async fn resume_all(&self, course_id: &CourseId) -> Result<usize> {
        let mut resumed = 0;
        for entry in self.ctx.store.find_by_course(course_id).await? {
            if !entry.status.is_resumable() {
                continue;
            }
            if let TransactionOutcome::Applied(_) = self.requeue(&entry.id).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn requeue(&self, id: &EntryId) -> Result<TransactionOutcome> {
        let outcome = self
            .ctx
            .store
            .transaction(
                id,
                Box::new(|e| {
                    if !e.status.is_resumable() {
                        return false;
                    }
                    e.status = EntryStatus::Queued;
                    e.retry_count = 0;
                    e.next_attempt_at = None;
                    e.last_error = None;
                    e.pause_requested = false;
                    true
                }),
            )
            .await?;

        if let TransactionOutcome::Applied(change) = &outcome {
            tracing::debug!(entry = %id, "Entry resumed");
            self.ctx.emit(change);
            self.ctx.wake_dispatcher();
        }
        Ok(outcome)
    }

    /// Delete an entry and its file, stopping its transfer first.
    ///
    /// Deleting an entry that does not exist is not an error.
    pub async fn delete(&self, id: &EntryId) -> Result<()> {
        self.remove_entry(id).await.map(|_| ())
    }

    /// Delete every entry of a course and its offline directory.
    ///
    /// No transfer of the course is started while this runs, and every
    /// running one has stopped before its row goes away.
    pub async fn delete_all(&self, course_id: &CourseId) -> Result<usize> {
        self.ctx.block_course(course_id);
        let result = self.delete_course(course_id).await;
        self.ctx.unblock_course(course_id);
        result
    }

    async fn delete_course(&self, course_id: &CourseId) -> Result<usize> {
        let entries = self.ctx.store.find_by_course(course_id).await?;
        let handles: Vec<_> = entries
            .iter()
            .filter_map(|e| self.ctx.control.request(&e.id, StopIntent::Remove))
            .collect();
        join_all(handles.iter().map(|h| h.wait_finished())).await;

        let mut removed = 0;
        for entry in &entries {
            if self.remove_entry(&entry.id).await?.is_some() {
                removed += 1;
            }
        }

        let course_dir = self.composer.layout().course_dir(course_id);
        self.ctx.disk.remove_dir(&course_dir).await?;
        tracing::info!(course = %course_id, removed, "Course content deleted");
        Ok(removed)
    }

    async fn remove_entry(&self, id: &EntryId) -> Result<Option<SyncEntry>> {
        self.stop_transfer(id, StopIntent::Remove).await;
        let removed = self.ctx.store.delete(id).await?;
        // A claim may have slipped in before the row was gone
        self.stop_transfer(id, StopIntent::Remove).await;

        if let Some(entry) = &removed {
            self.ctx.emit_removed(entry);
            self.ctx.disk.delete(&entry.local_path).await?;
            tracing::debug!(entry = %id, "Entry deleted");
        }
        Ok(removed)
    }

    async fn stop_transfer(&self, id: &EntryId, intent: StopIntent) {
        if let Some(handle) = self.ctx.control.request(id, intent) {
            handle.wait_finished().await;
        }
    }

    /// Hide a completed entry from the user; the file is kept for reuse
    pub async fn acknowledge(&self, id: &EntryId) -> Result<()> {
        let outcome = self
            .ctx
            .store
            .transaction(
                id,
                Box::new(|e| {
                    if e.status != EntryStatus::Completed || e.is_hidden_from_user {
                        return false;
                    }
                    e.is_hidden_from_user = true;
                    true
                }),
            )
            .await?;

        match outcome {
            TransactionOutcome::Missing => Err(SyncError::NotFound(id.to_string())),
            TransactionOutcome::Applied(_) => Ok(()),
            TransactionOutcome::Unchanged(entry) if entry.status == EntryStatus::Completed => Ok(()),
            TransactionOutcome::Unchanged(entry) => Err(SyncError::InvalidState {
                action: "acknowledge",
                current_state: entry.status.to_string(),
            }),
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> Subscription {
        self.ctx.bus.subscribe()
    }

    /// Aggregate counts and bytes of a course
    pub async fn summarize(&self, course_id: &CourseId) -> Result<CourseSummary> {
        let entries = self.ctx.store.find_by_course(course_id).await?;
        Ok(CourseSummary::from_entries(&entries))
    }

    /// Entries of a course in composer order
    pub async fn entries(&self, course_id: &CourseId) -> Result<Vec<SyncEntry>> {
        self.ctx.store.find_by_course(course_id).await
    }

    pub async fn entry(&self, id: &EntryId) -> Result<Option<SyncEntry>> {
        self.ctx.store.get(id).await
    }

    /// Entries with a status across all courses, oldest first
    pub async fn entries_with_status(&self, status: EntryStatus) -> Result<Vec<SyncEntry>> {
        self.ctx.store.find_by_status(status).await
    }

    /// Stop every running transfer and mark it failed as "interrupted".
    ///
    /// Scheduling halts until [`resume_scheduling`](Self::resume_scheduling).
    pub async fn interrupt(&self) -> usize {
        self.ctx.halt("interrupted");
        let handles = self.ctx.control.request_all(StopIntent::Interrupt);
        join_all(handles.iter().map(|h| h.wait_finished())).await;
        tracing::info!(stopped = handles.len(), "Transfers interrupted");
        handles.len()
    }

    /// Why scheduling is halted, if it is
    pub fn halt_reason(&self) -> Option<String> {
        self.ctx.halt_reason()
    }

    pub fn is_halted(&self) -> bool {
        self.ctx.halt_reason().is_some()
    }

    /// Clear a halt and start dispatching again.
    ///
    /// Rows left `active` by a worker whose final write failed are queued
    /// again first.
    pub async fn resume_scheduling(&self) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(SyncError::Shutdown);
        }

        for entry in self.ctx.store.find_by_status(EntryStatus::Active).await? {
            if self.ctx.control.is_running(&entry.id) {
                continue;
            }
            let outcome = self
                .ctx
                .store
                .transaction(
                    &entry.id,
                    Box::new(|e| {
                        if e.status != EntryStatus::Active {
                            return false;
                        }
                        e.status = if e.pause_requested {
                            EntryStatus::Paused
                        } else {
                            EntryStatus::Queued
                        };
                        e.pause_requested = false;
                        true
                    }),
                )
                .await?;
            if let TransactionOutcome::Applied(change) = outcome {
                tracing::debug!(entry = %change.current.id, "Recovered stranded transfer");
                self.ctx.emit(&change);
            }
        }

        self.ctx.clear_halt();
        self.ctx.wake_dispatcher();
        Ok(())
    }

    /// What startup reconciliation repaired
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn layout(&self) -> &OfflineLayout {
        self.composer.layout()
    }

    /// Number of transfers currently running
    pub fn active_transfers(&self) -> usize {
        self.ctx.control.running()
    }

    /// Graceful shutdown.
    ///
    /// Running transfers checkpoint and go back to `queued`, waiting at most
    /// the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.shutdown.cancel();

        let handles = self.ctx.control.request_all(StopIntent::Shutdown);
        let stopped = join_all(handles.iter().map(|h| h.wait_finished()));
        if tokio::time::timeout(self.ctx.config.shutdown_timeout(), stopped)
            .await
            .is_err()
        {
            tracing::warn!(
                running = self.ctx.control.running(),
                "Shutdown timed out waiting for transfers"
            );
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            let _ = task.await;
        }
        tracing::info!("Sync engine shut down");
        Ok(())
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        if let Some(reason) = self.ctx.halt_reason() {
            return Err(SyncError::SyncHalted(reason));
        }
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        // Signal shutdown on drop
        self.ctx.shutdown.cancel();
    }
}

/// Whether a write changed anything a subscriber can see
fn is_visible(change: &EntryChange) -> bool {
    let Some(previous) = &change.previous else {
        return true;
    };
    let current = &change.current;
    previous.status != current.status
        || previous.bytes_transferred != current.bytes_transferred
        || previous.size_bytes != current.size_bytes
        || previous.last_error != current.last_error
}

/// Repair what a previous process left behind.
///
/// No worker can own an `active` row at startup, completed rows must still
/// have their file, partial files may not run ahead of their checkpoint,
/// and files nobody owns are removed.
async fn reconcile_startup(ctx: &SyncContext, layout: &OfflineLayout) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let rows = ctx.store.load_all().await?;
    let mut previous: HashMap<EntryId, SyncEntry> = HashMap::new();
    let mut repaired = Vec::new();

    for entry in &rows {
        let on_disk = ctx.disk.size(&entry.local_path).await?;
        let mut row = entry.clone();

        match entry.status {
            EntryStatus::Completed => {
                let intact = matches!(
                    (on_disk, entry.size_bytes),
                    (Some(len), Some(size)) if len == size
                );
                if intact {
                    continue;
                }
                tracing::debug!(entry = %entry.id, ?on_disk, "Completed entry lost its file");
                row.status = EntryStatus::Queued;
                row.reset_progress();
                row.last_error = None;
                report.invalidated += 1;
            }
            status => {
                match on_disk {
                    Some(len) if len > entry.bytes_transferred => {
                        ctx.disk
                            .truncate(&entry.local_path, entry.bytes_transferred)
                            .await?;
                        report.truncated += 1;
                    }
                    Some(len) if len < entry.bytes_transferred => row.record_progress(len),
                    None if entry.bytes_transferred > 0 => row.reset_progress(),
                    _ => {}
                }

                if status == EntryStatus::Active {
                    row.status = if entry.pause_requested {
                        EntryStatus::Paused
                    } else {
                        EntryStatus::Queued
                    };
                    row.pause_requested = false;
                    row.next_attempt_at = None;
                    report.requeued += 1;
                }
                if row == *entry {
                    continue;
                }
            }
        }

        previous.insert(entry.id.clone(), entry.clone());
        repaired.push(row);
    }

    if !repaired.is_empty() {
        for current in ctx.store.upsert(&repaired).await? {
            let change = EntryChange {
                previous: previous.remove(&current.id),
                current,
            };
            ctx.emit(&change);
        }
    }

    let owned: HashSet<PathBuf> = rows.into_iter().map(|e| e.local_path).collect();
    match sweep_orphans(ctx, layout, &owned).await {
        Ok(removed) => report.orphans_removed = removed,
        Err(e) => tracing::warn!(error = %e, "Orphan file sweep failed"),
    }

    Ok(report)
}

async fn sweep_orphans(
    ctx: &SyncContext,
    layout: &OfflineLayout,
    owned: &HashSet<PathBuf>,
) -> Result<usize> {
    let mut removed = 0;
    for file in ctx.disk.list_files(layout.offline_root()).await? {
        if owned.contains(&file) {
            continue;
        }
        tracing::debug!(path = ?file, "Removing orphan file");
        ctx.disk.delete(&file).await?;
        removed += 1;
    }
    Ok(removed)
}
