//! Sync state store
//!
//! The durable record of what has been synced, consulted by both
//! directions to decide what changed. Persisted as a single JSON file
//! written temp-then-rename so the on-disk image is always either the
//! previous valid document or the new one, never a torn write.
//!
//! Exactly one store instance owns a given file; the download manager
//! holds it for the lifetime of the process. Two processes opening the
//! same state file is undefined behavior.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::now_ms;
use crate::fsutil;
use crate::path::RelativePath;

const STATE_VERSION: u32 = 1;

/// How many entry mutations accumulate before `maybe_save` persists.
const DEFAULT_AUTOSAVE_THRESHOLD: usize = 25;

/// Last-synced record for one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateEntry {
    /// Full object key, prefix included.
    pub key: String,
    pub relative_path: RelativePath,
    /// Remote last-modified, epoch milliseconds.
    pub last_modified: i64,
    pub size: u64,
    pub etag: String,
    /// Content hash when one was recorded at sync time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDocument {
    version: u32,
    user_id: String,
    prefix: String,
    last_poll_at: Option<i64>,
    entries: HashMap<String, SyncStateEntry>,
}

pub struct SyncStateStore {
    file_path: PathBuf,
    user_id: String,
    prefix: String,
    last_poll_at: Option<i64>,
    entries: HashMap<String, SyncStateEntry>,
    dirty_writes: usize,
    autosave_threshold: usize,
}

impl SyncStateStore {
    /// Load the store from `file_path`, or start empty when the file does
    /// not exist. A file that exists but does not parse is rotated aside
    /// (never deleted) and an empty state is used.
    pub async fn load(file_path: &Path, user_id: &str, prefix: &str) -> Result<Self> {
        let mut store = Self {
            file_path: file_path.to_path_buf(),
            user_id: user_id.to_string(),
            prefix: prefix.to_string(),
            last_poll_at: None,
            entries: HashMap::new(),
            dirty_writes: 0,
            autosave_threshold: DEFAULT_AUTOSAVE_THRESHOLD,
        };

        match tokio::fs::read_to_string(file_path).await {
            Ok(raw) => match serde_json::from_str::<StateDocument>(&raw) {
                Ok(doc) => {
                    store.last_poll_at = doc.last_poll_at;
                    store.entries = doc.entries;
                    debug!(
                        path = %file_path.display(),
                        entries = store.entries.len(),
                        "loaded sync state"
                    );
                }
                Err(e) => {
                    let name = file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "state".to_string());
                    let aside =
                        file_path.with_file_name(format!("{name}.corrupt-{}", now_ms()));
                    warn!(
                        path = %file_path.display(),
                        rotated_to = %aside.display(),
                        error = %e,
                        "sync state file corrupt, starting from empty state"
                    );
                    if let Err(rename_err) = tokio::fs::rename(file_path, &aside).await {
                        warn!(error = %rename_err, "failed to rotate corrupt state file aside");
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %file_path.display(), "no sync state file, starting empty");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(store)
    }

    pub fn get(&self, relative_path: &RelativePath) -> Option<&SyncStateEntry> {
        self.entries.get(relative_path.as_str())
    }

    /// Insert or replace the entry for its relative path. Persists when
    /// enough mutations have accumulated since the last save.
    pub async fn upsert(&mut self, entry: SyncStateEntry) -> Result<()> {
        self.entries
            .insert(entry.relative_path.as_str().to_string(), entry);
        self.dirty_writes += 1;
        self.maybe_save().await
    }

    pub async fn remove(&mut self, relative_path: &RelativePath) -> Result<()> {
        if self.entries.remove(relative_path.as_str()).is_some() {
            self.dirty_writes += 1;
            self.maybe_save().await?;
        }
        Ok(())
    }

    pub fn all(&self) -> impl Iterator<Item = &SyncStateEntry> {
        self.entries.values()
    }

    /// Number of tracked remote objects. This is the derived view over
    /// the entries map; no separate tracked set exists.
    pub fn tracked_files(&self) -> usize {
        self.entries.len()
    }

    pub fn last_poll_at(&self) -> Option<i64> {
        self.last_poll_at
    }

    pub fn record_poll(&mut self) {
        self.last_poll_at = Some(now_ms());
        self.dirty_writes += 1;
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.last_poll_at = None;
        self.save().await
    }

    async fn maybe_save(&mut self) -> Result<()> {
        if self.dirty_writes >= self.autosave_threshold {
            self.save().await?;
        }
        Ok(())
    }

    fn render(&self) -> Result<Vec<u8>> {
        let doc = StateDocument {
            version: STATE_VERSION,
            user_id: self.user_id.clone(),
            prefix: self.prefix.clone(),
            last_poll_at: self.last_poll_at,
            entries: self.entries.clone(),
        };
        let mut raw = serde_json::to_string_pretty(&doc)?;
        raw.push('\n');
        Ok(raw.into_bytes())
    }

    /// Persist atomically: write a sibling temp file, then rename over
    /// the target.
    pub async fn save(&mut self) -> Result<()> {
        let raw = self.render()?;
        fsutil::write_atomic(&self.file_path, &raw).await?;
        self.dirty_writes = 0;
        debug!(
            path = %self.file_path.display(),
            entries = self.entries.len(),
            "sync state saved"
        );
        Ok(())
    }

    /// Synchronous save for shutdown paths where no runtime is available.
    pub fn force_save(&mut self) -> Result<()> {
        let raw = self.render()?;
        fsutil::write_atomic_blocking(&self.file_path, &raw)?;
        self.dirty_writes = 0;
        Ok(())
    }
}
