//! # course-sync
//!
//! An offline course-content synchronization engine written in Rust.
//!
//! ## Features
//!
//! - **Course composition**: Expands a course content tree into downloadable entries
//! - **Bounded, fair scheduling**: Fixed transfer pool shared fairly between courses
//! - **Durable progress**: SQLite-backed entry store, resumable after a crash
//! - **Cooperative control**: Pause, resume and delete interact safely with running transfers
//! - **Async**: Built on Tokio, with an event bus for progress widgets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use course_sync::{CourseId, HttpTransport, ManifestSource, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::default().session_id("user-42");
//!     let source = Arc::new(ManifestSource::load("courses.json").await?);
//!     let transport = Arc::new(HttpTransport::new(&config.http)?);
//!     let engine = SyncEngine::new(config, source, transport).await?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Sync a course and wait for every entry to settle
//!     let mut job = engine.start_sync(&CourseId::new("101")).await?;
//!     let outcome = job.wait().await?;
//!     println!("Completed {} of {}", outcome.completed, outcome.total());
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

// Modules
pub mod bus;
pub mod composer;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod job;
pub mod protocol;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use bus::{EventBus, Subscription};
pub use composer::{reconcile, ContentComposer};
pub use config::{HttpConfig, RetryConfig, SyncConfig};
pub use engine::{EngineParts, RecoveryReport, SyncEngine};
pub use error::{FailureClass, NetworkErrorKind, Result, StorageErrorKind, SyncError};
pub use job::CourseSyncJob;
pub use protocol::{
    ContentKind, CourseId, CourseSummary, EntryId, EntryStatus, JobId, JobOutcome,
    StatusChangeEvent, SyncEntry, SyncEvent,
};
pub use source::{ContentSource, ContentUnit, Manifest, ManifestSource, UnitStream};

// Storage exports
#[cfg(feature = "storage")]
pub use storage::SqliteEntryStore;
pub use storage::{EntryChange, EntryMutation, EntryStore, MemoryEntryStore, TransactionOutcome};

// Disk exports
pub use disk::{Disk, LocalDisk, OfflineLayout};

// Transport exports
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{ByteStream, TransferBody, Transport};

// Scheduler exports
pub use scheduler::{RetryDecision, RetryPolicy, StopIntent};
