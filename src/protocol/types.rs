//! Core protocol types
//!
//! Identifiers and enumerations shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a course (opaque, supplied by the content API)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseId(String);

impl CourseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CourseId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CourseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identifier of a sync entry.
///
/// Composed from the course, the content kind and the remote id, so the
/// same content unit always maps onto the same entry and two courses never
/// collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Build the identifier for a content unit of a course
    pub fn compose(course_id: &CourseId, kind: ContentKind, remote_id: &str) -> Self {
        Self(format!("{}/{}/{}", course_id, kind.as_str(), remote_id))
    }

    /// Wrap an already composed identifier (e.g. read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a course sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Kind of content a sync entry stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Rendered HTML page
    Page,
    /// Course file attachment
    File,
    /// Module item body (assignment, quiz description, discussion)
    ModuleItem,
    /// Hosted media (video/audio) with a downloadable rendition
    StudioMedia,
    /// External tool launch; has no downloadable payload
    ExternalTool,
}

impl ContentKind {
    /// Whether units of this kind carry a payload that can be stored offline
    pub fn is_downloadable(&self) -> bool {
        !matches!(self, Self::ExternalTool)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::File => "file",
            Self::ModuleItem => "module_item",
            Self::StudioMedia => "studio_media",
            Self::ExternalTool => "external_tool",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(Self::Page),
            "file" => Ok(Self::File),
            "module_item" => Ok(Self::ModuleItem),
            "studio_media" => Ok(Self::StudioMedia),
            "external_tool" => Ok(Self::ExternalTool),
            _ => Err(format!("unknown content kind: {}", s)),
        }
    }
}

/// Lifecycle status of a sync entry
///
/// ```text
/// queued ──> active ──> completed
///   ^  \        │ \──> failed ──┐
///   │   \       │  \─> serverError
///   │    v      v               │
///   └── paused <┘   (resume) <──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for a transfer slot
    Queued,
    /// Owned by a transfer worker
    Active,
    /// Stopped by the user; partial progress kept
    Paused,
    /// Local file is complete
    Completed,
    /// Retry budget exhausted or failed without retry
    Failed,
    /// Remote server answered with an error status
    ServerError,
}

impl EntryStatus {
    /// Completed, failed and serverError entries need no further work
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::ServerError)
    }

    /// Statuses a manual resume moves back to queued
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Failed | Self::ServerError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ServerError => "server_error",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "server_error" => Ok(Self::ServerError),
            _ => Err(format!("unknown entry status: {}", s)),
        }
    }
}
