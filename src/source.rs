//! Content sources
//!
//! A content source resolves a course into the flat list of content units
//! the composer turns into sync entries. Sources that talk to a remote API
//! may reuse cached metadata when asked to; [`ManifestSource`] serves a
//! fixed manifest.

use crate::error::{Result, SyncError};
use crate::protocol::{ContentKind, CourseId};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One resolved unit of course content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    /// Identifier on the content API
    pub remote_id: String,
    pub kind: ContentKind,
    /// Where the payload can be fetched; `None` when there is nothing to download
    #[serde(default)]
    pub remote_locator: Option<String>,
    /// Version/etag used to detect changed content
    #[serde(default)]
    pub version: Option<String>,
    /// Size reported by the API, if any
    #[serde(default)]
    pub size_hint: Option<u64>,
}

impl ContentUnit {
    pub fn new(remote_id: impl Into<String>, kind: ContentKind, locator: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            kind,
            remote_locator: Some(locator.into()),
            version: None,
            size_hint: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    /// Whether this unit has a payload that can be stored offline
    pub fn is_downloadable(&self) -> bool {
        self.kind.is_downloadable()
            && self
                .remote_locator
                .as_deref()
                .is_some_and(|l| !l.trim().is_empty())
    }
}

/// Stream of resolved content units
pub type UnitStream = BoxStream<'static, Result<ContentUnit>>;

/// Resolves a course's content tree
pub trait ContentSource: Send + Sync {
    /// Walk the course's pages, files, module items and media.
    ///
    /// With `use_cache` the source may answer from previously resolved
    /// metadata whose version is unchanged.
    fn resolve_course_content_tree(&self, course_id: &CourseId, use_cache: bool) -> UnitStream;
}

/// Serialized manifest: course id to its content units
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub courses: HashMap<String, Vec<ContentUnit>>,
}

/// Content source serving a static manifest
#[derive(Default)]
pub struct ManifestSource {
    courses: RwLock<HashMap<CourseId, Vec<ContentUnit>>>,
}

impl ManifestSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a manifest JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json)?;
        let source = Self::new();
        for (course, units) in manifest.courses {
            source.set_course(CourseId::new(course), units);
        }
        Ok(source)
    }

    /// Load a manifest file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::io_at(e, path))?;
        Self::from_json(&json)
    }

    /// Replace the content of a course
    pub fn set_course(&self, course_id: CourseId, units: Vec<ContentUnit>) {
        self.courses.write().insert(course_id, units);
    }

    pub fn remove_course(&self, course_id: &CourseId) {
        self.courses.write().remove(course_id);
    }
}

impl ContentSource for ManifestSource {
    fn resolve_course_content_tree(&self, course_id: &CourseId, _use_cache: bool) -> UnitStream {
        match self.courses.read().get(course_id) {
            Some(units) => stream::iter(units.clone().into_iter().map(Ok)).boxed(),
            None => {
                let err = SyncError::composition(course_id.as_str(), "course not in manifest");
                stream::once(async move { Err(err) }).boxed()
            }
        }
    }
}
