//! Offline directory layout
//!
//! ```text
//! <root>/<session>/Offline/course-<courseId>/<kind>/<remoteId>
//! ```

use crate::protocol::{ContentKind, CourseId};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

const OFFLINE_DIR: &str = "Offline";

/// Maps entries onto deterministic paths under a session's offline root
#[derive(Debug, Clone)]
pub struct OfflineLayout {
    offline_root: PathBuf,
}

impl OfflineLayout {
    pub fn new(root_dir: impl AsRef<Path>, session_id: &str) -> Self {
        Self {
            offline_root: root_dir
                .as_ref()
                .join(encode_component(session_id))
                .join(OFFLINE_DIR),
        }
    }

    /// Directory every offline file of the session lives under
    pub fn offline_root(&self) -> &Path {
        &self.offline_root
    }

    pub fn course_dir(&self, course_id: &CourseId) -> PathBuf {
        self.offline_root
            .join(format!("course-{}", encode_component(course_id.as_str())))
    }

    /// Path of one content unit
    pub fn entry_path(&self, course_id: &CourseId, kind: ContentKind, remote_id: &str) -> PathBuf {
        self.course_dir(course_id)
            .join(kind.as_str())
            .join(encode_component(remote_id))
    }

    /// Whether `path` stays inside the offline root
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.offline_root)
            && !path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    }
}

/// Encode an identifier as one path component.
///
/// The mapping is one-to-one: every output except the two special forms
/// below percent-decodes back to the input. Unreserved characters pass
/// through, so plain ids such as `9001` or `notes.pdf` keep their names.
/// Leading and trailing dots are escaped so `.` and `..` never appear.
/// The empty id maps to `%`. An encoding longer than a file name allows is
/// cut and tagged with `%~` plus a SHA-256 prefix of the raw id; neither
/// form is valid percent-encoding, so they cannot meet a regular name.
pub fn encode_component(name: &str) -> String {
    const NAME_MAX: usize = 255;
    const DIGEST_CHARS: usize = 16;

    if name.is_empty() {
        return "%".to_string();
    }

    let mut encoded = urlencoding::encode(name).into_owned();
    if encoded.starts_with('.') {
        encoded.replace_range(..1, "%2E");
    }
    if encoded.ends_with('.') {
        let last = encoded.len() - 1;
        encoded.replace_range(last.., "%2E");
    }

    if encoded.len() <= NAME_MAX {
        return encoded;
    }

    // The encoding is ASCII; back off so no escape is split
    let keep = NAME_MAX - DIGEST_CHARS - 2;
    let cut = match encoded[keep - 2..keep].find('%') {
        Some(pos) => keep - 2 + pos,
        None => keep,
    };
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    format!("{}%~{}", &encoded[..cut], &digest[..DIGEST_CHARS])
}
