//! Sync events
//!
//! Events published on the event bus.

use super::entry::SyncEntry;
use super::types::{CourseId, EntryId, EntryStatus, JobId};
use serde::{Deserialize, Serialize};

/// Status or progress change of a single entry.
///
/// Progress checkpoints are published with `old_status == new_status`.
/// A removed entry is published once with `new_status == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub entry_id: EntryId,
    pub course_id: CourseId,
    /// `None` when the entry was just created
    pub old_status: Option<EntryStatus>,
    /// `None` when the entry was removed
    pub new_status: Option<EntryStatus>,
    pub bytes_transferred: u64,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
    /// Store revision of the state this event describes
    pub revision: u64,
}

impl StatusChangeEvent {
    /// Describe the write that turned `previous` into `current`
    pub fn from_change(previous: Option<&SyncEntry>, current: &SyncEntry) -> Self {
        Self {
            entry_id: current.id.clone(),
            course_id: current.course_id.clone(),
            old_status: previous.map(|p| p.status),
            new_status: Some(current.status),
            bytes_transferred: current.bytes_transferred,
            size_bytes: current.size_bytes,
            error: current.last_error.clone(),
            revision: current.revision,
        }
    }

    /// Describe the removal of `removed`; its revision is the delete's
    pub fn removed(removed: &SyncEntry) -> Self {
        Self {
            entry_id: removed.id.clone(),
            course_id: removed.course_id.clone(),
            old_status: Some(removed.status),
            new_status: None,
            bytes_transferred: 0,
            size_bytes: removed.size_bytes,
            error: None,
            revision: removed.revision,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.new_status.is_none()
    }

    /// Whether this change leaves the entry with no further work
    pub fn is_settled(&self) -> bool {
        self.new_status.map_or(true, |s| s.is_terminal())
    }

    pub fn is_progress(&self) -> bool {
        self.old_status.is_some() && self.old_status == self.new_status
    }
}

/// Per-job completion counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub completed: usize,
    pub failed: usize,
    pub server_error: usize,
    pub removed: usize,
}

impl JobOutcome {
    pub fn has_error(&self) -> bool {
        self.failed > 0 || self.server_error > 0
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.server_error + self.removed
    }

    pub(crate) fn record(&mut self, settled_as: Option<EntryStatus>) {
        match settled_as {
            Some(EntryStatus::Completed) => self.completed += 1,
            Some(EntryStatus::Failed) => self.failed += 1,
            Some(EntryStatus::ServerError) => self.server_error += 1,
            None => self.removed += 1,
            Some(_) => {}
        }
    }
}

/// Events emitted by the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// An entry changed status or checkpointed progress
    StatusChanged(StatusChangeEvent),
    /// Every entry of a course sync job reached a terminal status
    JobFinished {
        job: JobId,
        course_id: CourseId,
        outcome: JobOutcome,
    },
    /// Scheduling stopped; no new transfers start until resumed
    SyncHalted { reason: String },
    /// Scheduling resumed after a halt
    SyncResumed,
}

impl SyncEvent {
    /// The status change carried by this event, if any
    pub fn as_status_change(&self) -> Option<&StatusChangeEvent> {
        match self {
            Self::StatusChanged(change) => Some(change),
            _ => None,
        }
    }

    /// Entry referenced by this event, if any
    pub fn entry_id(&self) -> Option<&EntryId> {
        self.as_status_change().map(|c| &c.entry_id)
    }
}
