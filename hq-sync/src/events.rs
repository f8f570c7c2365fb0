//! Filesystem event model shared by the watcher, the queue, and the uploader.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::path::RelativePath;

/// What happened to a path under the HQ root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::AddDir => "addDir",
            Self::UnlinkDir => "unlinkDir",
        }
    }

    /// Directory events coalesce in their own lane.
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::AddDir | Self::UnlinkDir)
    }
}

/// A single observed filesystem change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub relative_path: RelativePath,
    pub absolute_path: PathBuf,
    pub timestamp_ms: i64,
}

impl FileEvent {
    pub fn new(
        kind: FileEventKind,
        relative_path: RelativePath,
        absolute_path: PathBuf,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            kind,
            relative_path,
            absolute_path,
            timestamp_ms,
        }
    }
}

/// Current millisecond timestamp, the engine-wide convention for event times.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
