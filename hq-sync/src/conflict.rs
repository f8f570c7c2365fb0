//! Conflict subsystem
//!
//! A conflict exists when both sides of a path diverged from the last
//! synced record: the local content hash no longer matches the
//! last-synced hash AND the remote etag (or hash, when known) no longer
//! matches the last-synced etag. Detection is a pure function; the
//! resolver performs the filesystem action the chosen strategy dictates;
//! the log keeps a bounded, queryable history for the status surface.

use std::collections::VecDeque;
use std::path::PathBuf;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ConflictConfig, ConflictStrategy};
use crate::error::Result;
use crate::events::now_ms;
use crate::fsutil;
use crate::path::RelativePath;

pub const DEFAULT_CONFLICT_RETENTION: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Detected,
    Resolved,
    Deferred,
}

/// Local side of a divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictLocalSide {
    pub hash: String,
    pub last_synced_hash: Option<String>,
    pub size: Option<u64>,
    pub modified_ms: Option<i64>,
}

/// Remote side of a divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRemoteSide {
    pub key: String,
    pub etag: String,
    pub last_synced_etag: Option<String>,
    pub hash: Option<String>,
    pub size: u64,
    pub modified_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    pub relative_path: RelativePath,
    pub local: ConflictLocalSide,
    pub remote: ConflictRemoteSide,
    pub status: ConflictStatus,
    pub strategy: ConflictStrategy,
    pub detected_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
    pub conflict_file_path: Option<PathBuf>,
}

/// Inputs to one conflict check, gathered by the downloader.
#[derive(Debug, Clone)]
pub struct ConflictCheck<'a> {
    pub relative_path: &'a RelativePath,
    pub local_hash: &'a str,
    pub last_synced_hash: Option<&'a str>,
    pub remote_key: &'a str,
    pub remote_etag: &'a str,
    pub remote_hash: Option<&'a str>,
    pub last_synced_etag: Option<&'a str>,
    pub local_size: Option<u64>,
    pub local_modified_ms: Option<i64>,
    pub remote_size: u64,
    pub remote_modified_ms: i64,
}

pub struct ConflictDetector {
    config: ConflictConfig,
    overrides: Vec<(GlobMatcher, ConflictStrategy)>,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Result<Self> {
        let mut overrides = Vec::with_capacity(config.strategy_overrides.len());
        for (pattern, strategy) in &config.strategy_overrides {
            let matcher = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|e| {
                    crate::error::SyncError::Config(vec![format!(
                        "invalid conflict override glob '{pattern}': {e}"
                    )])
                })?
                .compile_matcher();
            overrides.push((matcher, *strategy));
        }
        Ok(Self { config, overrides })
    }

    /// Strategy for a path: the last matching override glob wins, else
    /// the configured default.
    pub fn strategy_for(&self, relative_path: &RelativePath) -> ConflictStrategy {
        let mut chosen = self.config.default_strategy;
        for (matcher, strategy) in &self.overrides {
            if matcher.is_match(relative_path.as_str()) {
                chosen = *strategy;
            }
        }
        chosen
    }

    /// Returns a conflict record iff both sides changed since last sync.
    pub fn check(&self, input: ConflictCheck<'_>) -> Option<SyncConflict> {
        let local_changed = match input.last_synced_hash {
            None => true,
            Some(last) => input.local_hash != last,
        };
        let remote_changed = match input.last_synced_etag {
            None => true,
            Some(last) => {
                input.remote_etag != last
                    || matches!(
                        (input.remote_hash, input.last_synced_hash),
                        (Some(remote), Some(synced)) if remote != synced
                    )
            }
        };

        if !(local_changed && remote_changed) {
            return None;
        }

        let strategy = self.strategy_for(input.relative_path);
        let conflict = SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            relative_path: input.relative_path.clone(),
            local: ConflictLocalSide {
                hash: input.local_hash.to_string(),
                last_synced_hash: input.last_synced_hash.map(str::to_string),
                size: input.local_size,
                modified_ms: input.local_modified_ms,
            },
            remote: ConflictRemoteSide {
                key: input.remote_key.to_string(),
                etag: input.remote_etag.to_string(),
                last_synced_etag: input.last_synced_etag.map(str::to_string),
                hash: input.remote_hash.map(str::to_string),
                size: input.remote_size,
                modified_ms: input.remote_modified_ms,
            },
            status: ConflictStatus::Detected,
            strategy,
            detected_at_ms: now_ms(),
            resolved_at_ms: None,
            conflict_file_path: None,
        };
        warn!(
            path = %conflict.relative_path,
            strategy = strategy.as_str(),
            "conflict detected, both sides changed since last sync"
        );
        Some(conflict)
    }
}

/// Builds the rename target for a keep-both resolution:
/// `{stem}.{millis}.conflict{.ext}`, timestamp optional per config.
pub fn conflict_file_name(
    relative_path: &RelativePath,
    suffix: &str,
    timestamp_ms: Option<i64>,
) -> String {
    let name = relative_path.file_name();
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    match timestamp_ms {
        Some(ts) => format!("{stem}.{ts}{suffix}{ext}"),
        None => format!("{stem}{suffix}{ext}"),
    }
}

pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Apply the conflict's strategy to the local file at `local_path`.
    ///
    /// Mutates the conflict in place: status, resolution time, and (for
    /// keep-both) the conflict file path. Calling again on an already
    /// resolved or deferred conflict is a no-op.
    pub async fn resolve(&self, conflict: &mut SyncConflict, local_path: &std::path::Path) -> Result<()> {
        if conflict.status != ConflictStatus::Detected {
            debug!(id = %conflict.id, "conflict already handled, skipping");
            return Ok(());
        }

        match conflict.strategy {
            ConflictStrategy::KeepBoth => {
                let timestamp = self
                    .config
                    .timestamp_conflict_files
                    .then(|| conflict.detected_at_ms);
                let renamed_name = conflict_file_name(
                    &conflict.relative_path,
                    &self.config.conflict_suffix,
                    timestamp,
                );
                let target = local_path.with_file_name(&renamed_name);
                if local_path.exists() {
                    fsutil::ensure_parent_dir(&target).await?;
                    tokio::fs::rename(local_path, &target).await?;
                }
                info!(
                    path = %conflict.relative_path,
                    renamed_to = %target.display(),
                    "kept both sides, local copy renamed"
                );
                conflict.conflict_file_path = Some(target);
                conflict.status = ConflictStatus::Resolved;
                conflict.resolved_at_ms = Some(now_ms());
            }
            ConflictStrategy::LocalWins | ConflictStrategy::RemoteWins => {
                // No filesystem action here: the downloader either skips
                // the download (local wins) or overwrites (remote wins).
                conflict.status = ConflictStatus::Resolved;
                conflict.resolved_at_ms = Some(now_ms());
            }
            ConflictStrategy::Manual => {
                conflict.status = ConflictStatus::Deferred;
            }
        }
        Ok(())
    }
}

/// Bounded in-memory log of conflicts, newest last.
pub struct ConflictLog {
    entries: VecDeque<SyncConflict>,
    retention: usize,
}

impl ConflictLog {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    pub fn record(&mut self, conflict: SyncConflict) {
        if let Some(existing) = self.entries.iter_mut().find(|c| c.id == conflict.id) {
            *existing = conflict;
            return;
        }
        if self.entries.len() >= self.retention {
            self.entries.pop_front();
        }
        self.entries.push_back(conflict);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &SyncConflict> {
        self.entries.iter()
    }

    pub fn by_status(&self, status: ConflictStatus) -> Vec<&SyncConflict> {
        self.entries.iter().filter(|c| c.status == status).collect()
    }

    pub fn by_path(&self, relative_path: &RelativePath) -> Vec<&SyncConflict> {
        self.entries
            .iter()
            .filter(|c| &c.relative_path == relative_path)
            .collect()
    }

    pub fn in_range(&self, from_ms: i64, to_ms: i64) -> Vec<&SyncConflict> {
        self.entries
            .iter()
            .filter(|c| c.detected_at_ms >= from_ms && c.detected_at_ms <= to_ms)
            .collect()
    }
}

impl Default for ConflictLog {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(config: ConflictConfig) -> ConflictDetector {
        ConflictDetector::new(config).unwrap()
    }

    fn check_input<'a>(
        rel: &'a RelativePath,
        local_hash: &'a str,
        last_hash: Option<&'a str>,
        etag: &'a str,
        last_etag: Option<&'a str>,
    ) -> ConflictCheck<'a> {
        ConflictCheck {
            relative_path: rel,
            local_hash,
            last_synced_hash: last_hash,
            remote_key: "u/hq/notes.md",
            remote_etag: etag,
            remote_hash: None,
            last_synced_etag: last_etag,
            local_size: Some(10),
            local_modified_ms: Some(1_000),
            remote_size: 12,
            remote_modified_ms: 2_000,
        }
    }

    #[test]
    fn conflict_requires_both_sides_changed() {
        let rel = RelativePath::new("notes.md").unwrap();
        let detector = detector(ConflictConfig::default());

        // Both changed.
        assert!(detector
            .check(check_input(&rel, "h1", Some("h0"), "e1", Some("e0")))
            .is_some());
        // Only local changed.
        assert!(detector
            .check(check_input(&rel, "h1", Some("h0"), "e0", Some("e0")))
            .is_none());
        // Only remote changed.
        assert!(detector
            .check(check_input(&rel, "h0", Some("h0"), "e1", Some("e0")))
            .is_none());
        // Unknown last-synced records count as changed on both sides.
        assert!(detector
            .check(check_input(&rel, "h1", None, "e1", None))
            .is_some());
    }

    #[test]
    fn matching_remote_hash_overrides_etag_drift() {
        let rel = RelativePath::new("notes.md").unwrap();
        let detector = detector(ConflictConfig::default());
        // Etag unchanged but remote hash differs from the synced hash:
        // remote changed.
        let mut input = check_input(&rel, "h1", Some("h0"), "e0", Some("e0"));
        input.remote_hash = Some("h2");
        assert!(detector.check(input).is_some());
    }

    #[test]
    fn strategy_overrides_last_match_wins() {
        let config = ConflictConfig {
            default_strategy: ConflictStrategy::KeepBoth,
            strategy_overrides: vec![
                ("*.md".to_string(), ConflictStrategy::Manual),
                ("notes.*".to_string(), ConflictStrategy::RemoteWins),
            ],
            ..Default::default()
        };
        let detector = detector(config);
        assert_eq!(
            detector.strategy_for(&RelativePath::new("notes.md").unwrap()),
            ConflictStrategy::RemoteWins
        );
        assert_eq!(
            detector.strategy_for(&RelativePath::new("other.md").unwrap()),
            ConflictStrategy::Manual
        );
        assert_eq!(
            detector.strategy_for(&RelativePath::new("data.bin").unwrap()),
            ConflictStrategy::KeepBoth
        );
    }

    #[test]
    fn conflict_file_name_shapes() {
        let rel = RelativePath::new("dir/notes.md").unwrap();
        assert_eq!(
            conflict_file_name(&rel, ".conflict", Some(1700000000000)),
            "notes.1700000000000.conflict.md"
        );
        assert_eq!(conflict_file_name(&rel, ".conflict", None), "notes.conflict.md");
        let no_ext = RelativePath::new("Makefile").unwrap();
        assert_eq!(
            conflict_file_name(&no_ext, ".conflict", Some(7)),
            "Makefile.7.conflict"
        );
    }

    #[tokio::test]
    async fn keep_both_renames_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("notes.md");
        tokio::fs::write(&local, b"local").await.unwrap();

        let rel = RelativePath::new("notes.md").unwrap();
        let detector = detector(ConflictConfig::default());
        let mut conflict = detector
            .check(check_input(&rel, "h1", Some("h0"), "e1", Some("e0")))
            .unwrap();

        let resolver = ConflictResolver::new(ConflictConfig::default());
        resolver.resolve(&mut conflict, &local).await.unwrap();

        assert_eq!(conflict.status, ConflictStatus::Resolved);
        let renamed = conflict.conflict_file_path.clone().unwrap();
        assert!(renamed.exists());
        assert!(!local.exists());
        let name = renamed.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("notes."));
        assert!(name.ends_with(".conflict.md"));

        // Second resolve must not touch the filesystem again.
        resolver.resolve(&mut conflict, &local).await.unwrap();
        assert_eq!(conflict.conflict_file_path.as_deref(), Some(renamed.as_path()));
    }

    #[tokio::test]
    async fn manual_strategy_defers() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConflictConfig {
            default_strategy: ConflictStrategy::Manual,
            ..Default::default()
        };
        let rel = RelativePath::new("a.txt").unwrap();
        let detector = detector(config.clone());
        let mut conflict = detector
            .check(check_input(&rel, "h1", Some("h0"), "e1", Some("e0")))
            .unwrap();
        ConflictResolver::new(config)
            .resolve(&mut conflict, &dir.path().join("a.txt"))
            .await
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::Deferred);
        assert!(conflict.resolved_at_ms.is_none());
    }

    #[test]
    fn log_retention_and_queries() {
        let mut log = ConflictLog::new(2);
        let rel = RelativePath::new("a").unwrap();
        let detector = detector(ConflictConfig::default());
        let make = |detected_at_ms: i64| {
            let mut c = detector
                .check(check_input(&rel, "h1", Some("h0"), "e1", Some("e0")))
                .unwrap();
            c.detected_at_ms = detected_at_ms;
            c
        };

        let first = make(100);
        let first_id = first.id.clone();
        log.record(first);
        log.record(make(200));
        log.record(make(300));
        assert_eq!(log.len(), 2);
        assert!(log.all().all(|c| c.id != first_id));

        assert_eq!(log.by_status(ConflictStatus::Detected).len(), 2);
        assert_eq!(log.by_path(&rel).len(), 2);
        assert_eq!(log.in_range(250, 400).len(), 1);

        // Re-recording an existing id updates in place.
        let mut updated = log.all().last().unwrap().clone();
        updated.status = ConflictStatus::Resolved;
        log.record(updated);
        assert_eq!(log.len(), 2);
        assert_eq!(log.by_status(ConflictStatus::Resolved).len(), 1);
    }
}
