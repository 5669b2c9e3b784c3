//! Transfer scheduler
//!
//! A single dispatcher task pulls queued entries from the entry store and
//! hands them to transfer workers, bounded by the pool and per-course slot
//! caps. Workers own their entry while it is `active` and are the only
//! writers of its progress.
//!
//! The dispatcher sleeps until something changes (a slot frees up, work is
//! queued, a retry delay expires) and re-reads the store on every round, so
//! the store stays the single source of truth.

pub mod control;
pub mod queue;
pub mod retry;
mod worker;

pub use control::{StopIntent, TransferControl, TransferHandle};
pub use queue::{select_next, SlotPermit, TransferSlots};
pub use retry::{RetryDecision, RetryPolicy};

use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::disk::Disk;
use crate::error::{FailureClass, Result, SyncError};
use crate::job::JobRegistry;
use crate::protocol::{CourseId, EntryStatus, StatusChangeEvent, SyncEntry, SyncEvent};
use crate::storage::{EntryChange, EntryStore, TransactionOutcome};
use crate::transport::Transport;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the dispatcher sleeps without a wake-up
const IDLE_POLL: Duration = Duration::from_secs(5);

/// State shared by the engine, the dispatcher and every worker
pub(crate) struct SyncContext {
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<dyn EntryStore>,
    pub(crate) disk: Arc<dyn Disk>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) jobs: JobRegistry,
    pub(crate) control: TransferControl,
    pub(crate) slots: Arc<TransferSlots>,
    pub(crate) retry: RetryPolicy,
    pub(crate) wake: Arc<Notify>,
    pub(crate) shutdown: CancellationToken,
    halt_reason: Mutex<Option<String>>,
    storage_failures: AtomicU32,
    /// Courses the dispatcher must not start work for, with nesting counts
    blocked_courses: Mutex<HashMap<CourseId, usize>>,
}

impl SyncContext {
    pub(crate) fn new(
        config: SyncConfig,
        store: Arc<dyn EntryStore>,
        disk: Arc<dyn Disk>,
        transport: Arc<dyn Transport>,
        bus: Arc<EventBus>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let slots = TransferSlots::new(
            config.max_concurrent_transfers,
            config.max_transfers_per_course,
            Arc::clone(&wake),
        );
        Self {
            retry: RetryPolicy::from(&config.retry),
            jobs: JobRegistry::new(Arc::clone(&bus)),
            control: TransferControl::new(),
            shutdown: CancellationToken::new(),
            halt_reason: Mutex::new(None),
            storage_failures: AtomicU32::new(0),
            blocked_courses: Mutex::new(HashMap::new()),
            config,
            store,
            disk,
            transport,
            bus,
            slots,
            wake,
        }
    }

    /// Publish a store write and let jobs observe it
    pub(crate) fn emit(&self, change: &EntryChange) {
        let event = StatusChangeEvent::from_change(change.previous.as_ref(), &change.current);
        if self.bus.publish_change(event.clone()) {
            self.jobs.observe(&event);
        }
    }

    /// Publish the removal of an entry
    pub(crate) fn emit_removed(&self, removed: &SyncEntry) {
        let event = StatusChangeEvent::removed(removed);
        if self.bus.publish_change(event.clone()) {
            self.jobs.observe(&event);
        }
    }

    pub(crate) fn wake_dispatcher(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().clone()
    }

    /// Stop starting new transfers
    pub(crate) fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut current = self.halt_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason.clone());
        }
        tracing::error!(reason = %reason, "Sync halted");
        self.bus.publish(SyncEvent::SyncHalted { reason });
    }

    /// Clear a halt; returns whether scheduling was halted
    pub(crate) fn clear_halt(&self) -> bool {
        let was_halted = self.halt_reason.lock().take().is_some();
        self.storage_failures.store(0, Ordering::Release);
        if was_halted {
            tracing::info!("Sync scheduling resumed");
            self.bus.publish(SyncEvent::SyncResumed);
            self.wake_dispatcher();
        }
        was_halted
    }

    /// Count a local storage failure; repeated failures halt scheduling
    pub(crate) fn record_storage_failure(&self, error: &SyncError) {
        let failures = self.storage_failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(failures, error = %error, "Storage failure");
        if failures >= self.config.storage_failure_threshold {
            self.halt(format!(
                "{} consecutive storage failures, last: {}",
                failures, error
            ));
        }
    }

    pub(crate) fn record_storage_success(&self) {
        self.storage_failures.store(0, Ordering::Release);
    }

    pub(crate) fn block_course(&self, course_id: &CourseId) {
        *self
            .blocked_courses
            .lock()
            .entry(course_id.clone())
            .or_insert(0) += 1;
    }

    pub(crate) fn unblock_course(&self, course_id: &CourseId) {
        let mut blocked = self.blocked_courses.lock();
        if let Some(count) = blocked.get_mut(course_id) {
            *count -= 1;
            if *count == 0 {
                blocked.remove(course_id);
            }
        }
        drop(blocked);
        self.wake_dispatcher();
    }

    fn blocked_courses(&self) -> HashSet<CourseId> {
        self.blocked_courses.lock().keys().cloned().collect()
    }
}

/// Spawn the dispatcher loop
pub(crate) fn spawn_dispatcher(ctx: Arc<SyncContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("Dispatcher started");
        loop {
            let sleep_for = match dispatch_round(&ctx).await {
                Ok(next_due) => next_due.unwrap_or(IDLE_POLL).min(IDLE_POLL),
                Err(e) => {
                    if e.failure_class() == FailureClass::Storage {
                        ctx.record_storage_failure(&e);
                    } else {
                        tracing::warn!(error = %e, "Dispatch round failed");
                    }
                    IDLE_POLL
                }
            };

            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = ctx.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        tracing::debug!("Dispatcher stopped");
    })
}

/// Start as many transfers as the slots allow.
///
/// Returns how long until the earliest delayed retry becomes due.
async fn dispatch_round(ctx: &Arc<SyncContext>) -> Result<Option<Duration>> {
    if ctx.shutdown.is_cancelled() || ctx.halt_reason().is_some() {
        return Ok(None);
    }

    let mut queued = ctx.store.find_by_status(EntryStatus::Queued).await?;
    let blocked = ctx.blocked_courses();
    let now = Utc::now();

    while ctx.slots.available() > 0 {
        let Some(index) = select_next(&queued, &ctx.slots, &blocked, now) else {
            break;
        };
        let entry = queued.remove(index);
        let Some(permit) = ctx.slots.try_acquire(&entry.course_id) else {
            break;
        };

        // Queued rows have no writer, so the file is stable until the claim
        let held = if ctx.transport.supports_ranges() {
            ctx.disk.size(&entry.local_path).await?.unwrap_or(0)
        } else {
            0
        };

        // Registered before the claim so a concurrent pause or delete
        // always finds the handle once the row is active
        let handle = ctx.control.register(&entry.id);
        let claimed = ctx
            .store
            .transaction(
                &entry.id,
                Box::new(move |e| {
                    if e.status != EntryStatus::Queued {
                        return false;
                    }
                    e.status = EntryStatus::Active;
                    e.next_attempt_at = None;
                    // Progress starts at what the file actually holds
                    if e.bytes_transferred > held {
                        e.record_progress(held);
                    }
                    true
                }),
            )
            .await;

        match claimed {
            Ok(TransactionOutcome::Applied(change)) => {
                ctx.emit(&change);
                tracing::debug!(entry = %change.current.id, course = %change.current.course_id, "Dispatching transfer");
                tokio::spawn(worker::run(
                    Arc::clone(ctx),
                    change.current,
                    handle,
                    permit,
                ));
            }
            Ok(_) => ctx.control.finish(&entry.id, &handle),
            Err(e) => {
                ctx.control.finish(&entry.id, &handle);
                return Err(e);
            }
        }
    }

    let next_due = queued
        .iter()
        .filter_map(|e| e.next_attempt_at)
        .filter(|at| *at > now)
        .min()
        .and_then(|at| (at - now).to_std().ok());
    Ok(next_due)
}
