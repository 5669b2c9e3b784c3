//! Transfer slots and fair work selection
//!
//! The pool holds a fixed number of transfer slots and each course may hold
//! at most a fixed share of them. When a slot frees up, the next entry is
//! taken from the course with the fewest running transfers; within a
//! course entries go in composer order.

use crate::protocol::{CourseId, EntryStatus, SyncEntry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// A held transfer slot
/// When dropped, releases the slot and wakes the dispatcher
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    course_id: CourseId,
    slots: Arc<TransferSlots>,
}

impl SlotPermit {
    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        {
            let mut running = self.slots.running.lock();
            if let Some(count) = running.get_mut(&self.course_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    running.remove(&self.course_id);
                }
            }
        }
        self.slots.wake.notify_one();
    }
}

/// Pool of transfer slots with a per-course cap
pub struct TransferSlots {
    semaphore: Arc<Semaphore>,
    /// Slots held per course
    running: Mutex<HashMap<CourseId, usize>>,
    per_course: usize,
    wake: Arc<Notify>,
}

impl TransferSlots {
    pub fn new(max_concurrent: usize, per_course: usize, wake: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            running: Mutex::new(HashMap::new()),
            per_course: per_course.max(1),
            wake,
        })
    }

    /// Take a slot for `course_id` if both the pool and the course have room
    pub fn try_acquire(self: &Arc<Self>, course_id: &CourseId) -> Option<SlotPermit> {
        let mut running = self.running.lock();
        let held = running.get(course_id).copied().unwrap_or(0);
        if held >= self.per_course {
            return None;
        }
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        running.insert(course_id.clone(), held + 1);

        Some(SlotPermit {
            _permit: permit,
            course_id: course_id.clone(),
            slots: Arc::clone(self),
        })
    }

    /// Free slots in the pool
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held by a course
    pub fn running_for(&self, course_id: &CourseId) -> usize {
        self.running.lock().get(course_id).copied().unwrap_or(0)
    }

    pub fn has_room_for(&self, course_id: &CourseId) -> bool {
        self.running_for(course_id) < self.per_course
    }
}

/// Pick the next entry to dispatch.
///
/// `candidates` must be in age order (oldest first). Only queued entries
/// that are due, belong to a course that is not blocked and still has room
/// are eligible. Among them the course with the fewest running transfers
/// wins, then the oldest entry.
pub fn select_next(
    candidates: &[SyncEntry],
    slots: &TransferSlots,
    blocked: &HashSet<CourseId>,
    now: DateTime<Utc>,
) -> Option<usize> {
    let mut load: HashMap<&CourseId, usize> = HashMap::new();
    let mut best: Option<(usize, usize)> = None;

    for (index, entry) in candidates.iter().enumerate() {
        if entry.status != EntryStatus::Queued
            || !entry.is_due(now)
            || blocked.contains(&entry.course_id)
        {
            continue;
        }

        let running = *load
            .entry(&entry.course_id)
            .or_insert_with(|| slots.running_for(&entry.course_id));
        if running >= slots.per_course {
            continue;
        }

        if best.map_or(true, |(best_running, _)| running < best_running) {
            best = Some((running, index));
        }
    }

    best.map(|(_, index)| index)
}
