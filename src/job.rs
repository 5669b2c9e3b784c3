//! Course sync jobs
//!
//! A job is the set of entries one `start_sync` call produced plus a
//! completion signal. It finishes once every entry reached a terminal
//! status or was removed.

use crate::bus::EventBus;
use crate::error::{Result, SyncError};
use crate::protocol::{CourseId, EntryId, EntryStatus, JobId, JobOutcome, StatusChangeEvent, SyncEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Handle to a running course sync
#[derive(Debug, Clone)]
pub struct CourseSyncJob {
    id: JobId,
    course_id: CourseId,
    entry_ids: Vec<EntryId>,
    outcome: watch::Receiver<Option<JobOutcome>>,
}

impl CourseSyncJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }

    /// Entries composed for this job, in composer order
    pub fn entry_ids(&self) -> &[EntryId] {
        &self.entry_ids
    }

    /// Outcome once finished
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait until every entry settled
    pub async fn wait(&mut self) -> Result<JobOutcome> {
        let outcome = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::Shutdown)?;
        Ok(outcome.clone().unwrap_or_default())
    }
}

struct JobState {
    course_id: CourseId,
    pending: HashSet<EntryId>,
    outcome: JobOutcome,
    tx: watch::Sender<Option<JobOutcome>>,
}

/// Tracks running jobs and finishes them as their entries settle
pub(crate) struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobState>>,
    bus: Arc<EventBus>,
}

impl JobRegistry {
    pub(crate) fn new(bus: Arc<EventBus>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Start tracking `entry_ids`, all considered pending
    pub(crate) fn register(&self, course_id: &CourseId, entry_ids: Vec<EntryId>) -> CourseSyncJob {
        let id = JobId::new();
        let (tx, rx) = watch::channel(None);
        let state = JobState {
            course_id: course_id.clone(),
            pending: entry_ids.iter().cloned().collect(),
            outcome: JobOutcome::default(),
            tx,
        };

        let finished = state.pending.is_empty();
        self.jobs.lock().insert(id, state);
        if finished {
            self.finish(id);
        }

        CourseSyncJob {
            id,
            course_id: course_id.clone(),
            entry_ids,
            outcome: rx,
        }
    }

    /// Record an entry of `job` that is already terminal
    pub(crate) fn settle(&self, job: JobId, entry_id: &EntryId, status: EntryStatus) {
        if !status.is_terminal() {
            return;
        }
        let done = {
            let mut jobs = self.jobs.lock();
            let Some(state) = jobs.get_mut(&job) else {
                return;
            };
            if !state.pending.remove(entry_id) {
                return;
            }
            state.outcome.record(Some(status));
            state.pending.is_empty()
        };
        if done {
            self.finish(job);
        }
    }

    /// Feed a published status change to every job waiting on the entry
    pub(crate) fn observe(&self, change: &StatusChangeEvent) {
        if !change.is_settled() {
            return;
        }

        let finished: Vec<JobId> = {
            let mut jobs = self.jobs.lock();
            jobs.iter_mut()
                .filter_map(|(id, state)| {
                    if !state.pending.remove(&change.entry_id) {
                        return None;
                    }
                    state.outcome.record(change.new_status);
                    state.pending.is_empty().then_some(*id)
                })
                .collect()
        };

        for job in finished {
            self.finish(job);
        }
    }

    /// Stop tracking a job that never got going
    pub(crate) fn abandon(&self, job: JobId) {
        self.jobs.lock().remove(&job);
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    fn finish(&self, job: JobId) {
        let Some(state) = self.jobs.lock().remove(&job) else {
            return;
        };
        tracing::info!(
            job = %job,
            course = %state.course_id,
            completed = state.outcome.completed,
            failed = state.outcome.failed,
            server_error = state.outcome.server_error,
            removed = state.outcome.removed,
            "Course sync job finished"
        );
        state.tx.send_replace(Some(state.outcome.clone()));
        self.bus.publish(SyncEvent::JobFinished {
            job,
            course_id: state.course_id,
            outcome: state.outcome,
        });
    }
}
