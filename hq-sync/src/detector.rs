//! Change detector
//!
//! Lists the remote prefix page by page and diffs the result against the
//! sync state to produce the change list a download cycle will apply.
//! Directory marker keys (trailing `/`) and ignored paths are skipped.
//! A listing cut short by the page cap never marks entries deleted:
//! absence from a partial listing proves nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{DeletedFilePolicy, DownloadConfig};
use crate::error::Result;
use crate::ignore::IgnoreEngine;
use crate::path::RelativePath;
use crate::state::{SyncStateEntry, SyncStateStore};
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

/// One remote-side difference against the sync state.
#[derive(Debug, Clone)]
pub struct DetectedChange {
    pub kind: ChangeKind,
    pub relative_path: RelativePath,
    /// The listed remote record; `None` only for deletions.
    pub remote: Option<SyncStateEntry>,
    pub previous_last_modified: Option<i64>,
}

/// Result of one detection pass.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub changes: Vec<DetectedChange>,
    pub pages_listed: usize,
    /// True when the page cap stopped the listing early.
    pub truncated: bool,
}

pub struct ChangeDetector {
    store: Arc<dyn ObjectStore>,
    ignore: Arc<IgnoreEngine>,
    prefix: String,
    max_list_pages: usize,
    deleted_file_policy: DeletedFilePolicy,
    operation_timeout: Duration,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn ObjectStore>, ignore: Arc<IgnoreEngine>, config: &DownloadConfig) -> Self {
        Self {
            store,
            ignore,
            prefix: config.s3_prefix.clone(),
            max_list_pages: config.max_list_pages,
            deleted_file_policy: config.deleted_file_policy,
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }

    pub async fn detect(&self, state: &SyncStateStore) -> Result<ChangeSet> {
        let mut listed: HashMap<String, SyncStateEntry> = HashMap::new();
        let mut pages_listed = 0usize;
        let mut truncated = false;
        let mut continuation = None;

        loop {
            let page = tokio::time::timeout(
                self.operation_timeout,
                self.store.list_objects(&self.prefix, continuation),
            )
            .await
            .map_err(|_| crate::error::SyncError::Timeout(self.operation_timeout))??;
            pages_listed += 1;

            for object in page.items {
                if object.key.ends_with('/') {
                    // Directory marker.
                    continue;
                }
                let Some(rel_raw) = object.key.strip_prefix(&self.prefix) else {
                    continue;
                };
                let relative_path = match RelativePath::new(rel_raw) {
                    Ok(rel) => rel,
                    Err(e) => {
                        warn!(key = %object.key, error = %e, "skipping unrepresentable remote key");
                        continue;
                    }
                };
                if self.ignore.check(relative_path.as_str(), false).ignored {
                    continue;
                }
                listed.insert(
                    relative_path.as_str().to_string(),
                    SyncStateEntry {
                        key: object.key,
                        relative_path,
                        last_modified: object.last_modified,
                        size: object.size,
                        etag: object.etag,
                        content_hash: None,
                    },
                );
            }

            match page.next_token {
                Some(token) if pages_listed < self.max_list_pages => {
                    continuation = Some(token);
                }
                Some(_) => {
                    warn!(
                        pages = pages_listed,
                        max = self.max_list_pages,
                        "listing cut short by page cap, skipping deletion detection"
                    );
                    truncated = true;
                    break;
                }
                None => break,
            }
        }

        let mut changes = Vec::new();
        for entry in listed.values() {
            match state.get(&entry.relative_path) {
                None => changes.push(DetectedChange {
                    kind: ChangeKind::Added,
                    relative_path: entry.relative_path.clone(),
                    remote: Some(entry.clone()),
                    previous_last_modified: None,
                }),
                Some(prev) => {
                    let hash_differs = matches!(
                        (&prev.content_hash, &entry.content_hash),
                        (Some(a), Some(b)) if a != b
                    );
                    if prev.last_modified != entry.last_modified
                        || prev.etag != entry.etag
                        || hash_differs
                    {
                        changes.push(DetectedChange {
                            kind: ChangeKind::Modified,
                            relative_path: entry.relative_path.clone(),
                            remote: Some(entry.clone()),
                            previous_last_modified: Some(prev.last_modified),
                        });
                    }
                }
            }
        }

        if !truncated && self.deleted_file_policy != DeletedFilePolicy::Keep {
            for prev in state.all() {
                if !listed.contains_key(prev.relative_path.as_str()) {
                    changes.push(DetectedChange {
                        kind: ChangeKind::Deleted,
                        relative_path: prev.relative_path.clone(),
                        remote: None,
                        previous_last_modified: Some(prev.last_modified),
                    });
                }
            }
        }

        changes.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!(
            changes = changes.len(),
            pages = pages_listed,
            truncated,
            "change detection complete"
        );

        Ok(ChangeSet {
            changes,
            pages_listed,
            truncated,
        })
    }
}
