//! Protocol types for course-sync
//!
//! This module contains all types that cross the engine boundary:
//! - Identifiers and statuses
//! - Persistent sync entries and course summaries
//! - Events published on the event bus
//!
//! These types are designed for serialization and can be handed to a UI
//! layer or an IPC bridge unchanged.

mod entry;
mod events;
mod types;

pub use entry::{CourseSummary, SyncEntry};
pub use events::{JobOutcome, StatusChangeEvent, SyncEvent};
pub use types::{ContentKind, CourseId, EntryId, EntryStatus, JobId};
