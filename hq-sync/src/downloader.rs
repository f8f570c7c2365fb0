//! Downloader
//!
//! Materializes detected remote changes into the local tree. Downloads
//! stream to a temp sibling and rename into place so a failed transfer
//! never leaves a partial file at the target path. Before overwriting a
//! locally modified file the conflict subsystem is consulted and the
//! chosen strategy dispatched. Deletions follow the configured policy.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{ConflictStrategy, DeletedFilePolicy, DownloadConfig, HashAlgorithm};
use crate::conflict::{ConflictCheck, ConflictDetector, ConflictLog, ConflictResolver};
use crate::detector::{ChangeKind, DetectedChange};
use crate::error::{Result, SyncError};
use crate::fsutil;
use crate::hasher;
use crate::path::RelativePath;
use crate::state::{SyncStateEntry, SyncStateStore};
use crate::storage::ObjectStore;

/// Outcome of applying one detected change.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub relative_path: RelativePath,
    pub kind: ChangeKind,
    pub success: bool,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Success without a transfer (policy keep, local-wins, deferred).
    pub skipped: bool,
    pub conflict_id: Option<String>,
}

enum StateUpdate {
    Upsert(SyncStateEntry),
    Remove(RelativePath),
    None,
}

pub struct Downloader {
    config: DownloadConfig,
    store: Arc<dyn ObjectStore>,
    conflict_detector: Arc<ConflictDetector>,
    conflict_resolver: Arc<ConflictResolver>,
    conflict_log: Arc<Mutex<ConflictLog>>,
}

impl Downloader {
    pub fn new(
        config: DownloadConfig,
        store: Arc<dyn ObjectStore>,
        conflict_detector: Arc<ConflictDetector>,
        conflict_resolver: Arc<ConflictResolver>,
        conflict_log: Arc<Mutex<ConflictLog>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            conflict_detector,
            conflict_resolver,
            conflict_log,
        })
    }

    /// Apply a change list, at most `max_concurrent_downloads` transfers
    /// in flight. The state entry for each change is updated as soon as
    /// that change succeeds, in completion order.
    pub async fn apply(
        &self,
        changes: Vec<DetectedChange>,
        state: &mut SyncStateStore,
    ) -> Vec<DownloadResult> {
        let prior: Vec<Option<SyncStateEntry>> = changes
            .iter()
            .map(|change| state.get(&change.relative_path).cloned())
            .collect();

        let mut stream = futures::stream::iter(changes.into_iter().zip(prior))
            .map(|(change, prior)| self.process_one(change, prior))
            .buffer_unordered(self.config.max_concurrent_downloads);

        let mut results = Vec::new();
        while let Some((result, update)) = stream.next().await {
            match update {
                StateUpdate::Upsert(entry) => {
                    if let Err(e) = state.upsert(entry).await {
                        warn!(error = %e, "failed to persist state entry, will retry on next save");
                    }
                }
                StateUpdate::Remove(rel) => {
                    if let Err(e) = state.remove(&rel).await {
                        warn!(error = %e, "failed to remove state entry, will retry on next save");
                    }
                }
                StateUpdate::None => {}
            }
            results.push(result);
        }
        results
    }

    async fn process_one(
        &self,
        change: DetectedChange,
        prior: Option<SyncStateEntry>,
    ) -> (DownloadResult, StateUpdate) {
        let started = Instant::now();
        let mut result = DownloadResult {
            relative_path: change.relative_path.clone(),
            kind: change.kind,
            success: false,
            size_bytes: 0,
            duration_ms: 0,
            error: None,
            skipped: false,
            conflict_id: None,
        };

        let update = match change.kind {
            ChangeKind::Deleted => self.apply_deletion(&change, &mut result).await,
            ChangeKind::Added | ChangeKind::Modified => {
                self.apply_download(&change, prior, &mut result).await
            }
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        (result, update)
    }

    async fn apply_deletion(
        &self,
        change: &DetectedChange,
        result: &mut DownloadResult,
    ) -> StateUpdate {
        let local_path = change.relative_path.to_local(&self.config.local_dir);
        let outcome: Result<bool> = match self.config.deleted_file_policy {
            DeletedFilePolicy::Keep => Ok(false),
            DeletedFilePolicy::Delete => {
                fsutil::remove_file_idempotent(&local_path).await
            }
            DeletedFilePolicy::Trash => {
                let trash_dir = self.config.trash_dir.clone().unwrap_or_default();
                if local_path.exists() {
                    fsutil::move_to_trash(&local_path, &trash_dir, &change.relative_path)
                        .await
                        .map(|_| true)
                } else {
                    Ok(false)
                }
            }
        };

        match outcome {
            Ok(acted) => {
                result.success = true;
                result.skipped = !acted;
                if self.config.deleted_file_policy == DeletedFilePolicy::Keep {
                    StateUpdate::None
                } else {
                    info!(path = %change.relative_path, policy = ?self.config.deleted_file_policy, "applied remote deletion");
                    StateUpdate::Remove(change.relative_path.clone())
                }
            }
            Err(e) => {
                result.error = Some(e.to_string());
                StateUpdate::None
            }
        }
    }

    async fn apply_download(
        &self,
        change: &DetectedChange,
        prior: Option<SyncStateEntry>,
        result: &mut DownloadResult,
    ) -> StateUpdate {
        let Some(remote) = change.remote.clone() else {
            result.error = Some("change carries no remote record".to_string());
            return StateUpdate::None;
        };
        let local_path = change.relative_path.to_local(&self.config.local_dir);

        // Divergence check before overwriting local content.
        if local_path.exists() {
            match hasher::hash_file(&local_path, HashAlgorithm::Sha256).await {
                Ok(digest) => {
                    let check = ConflictCheck {
                        relative_path: &change.relative_path,
                        local_hash: &digest.hash,
                        last_synced_hash: prior.as_ref().and_then(|p| p.content_hash.as_deref()),
                        remote_key: &remote.key,
                        remote_etag: &remote.etag,
                        remote_hash: remote.content_hash.as_deref(),
                        last_synced_etag: prior.as_ref().map(|p| p.etag.as_str()),
                        local_size: Some(digest.size_bytes),
                        local_modified_ms: None,
                        remote_size: remote.size,
                        remote_modified_ms: remote.last_modified,
                    };
                    if let Some(mut conflict) = self.conflict_detector.check(check) {
                        result.conflict_id = Some(conflict.id.clone());
                        if let Err(e) = self
                            .conflict_resolver
                            .resolve(&mut conflict, &local_path)
                            .await
                        {
                            result.error = Some(format!("conflict resolution failed: {e}"));
                            self.record_conflict(conflict);
                            return StateUpdate::None;
                        }
                        let strategy = conflict.strategy;
                        self.record_conflict(conflict);
                        match strategy {
                            ConflictStrategy::Manual => {
                                // Deferred: local untouched, no download,
                                // re-detected next cycle.
                                result.success = true;
                                result.skipped = true;
                                return StateUpdate::None;
                            }
                            ConflictStrategy::LocalWins => {
                                // Skip the transfer but advance state to
                                // the remote record so the same change is
                                // not re-detected every cycle.
                                result.success = true;
                                result.skipped = true;
                                return StateUpdate::Upsert(remote);
                            }
                            ConflictStrategy::KeepBoth | ConflictStrategy::RemoteWins => {}
                        }
                    }
                }
                Err(e) => {
                    // Unhashable local file: skip the conflict check and
                    // let the remote copy win.
                    debug!(path = %change.relative_path, error = %e, "local hash failed, skipping conflict check");
                }
            }
        }

        let timeout = Duration::from_millis(self.config.operation_timeout_ms);
        let temp = fsutil::temp_sibling(&local_path);
        let transfer = tokio::time::timeout(
            timeout,
            self.download_file(&remote, &local_path, &temp),
        )
        .await
        .map_err(|_| SyncError::Timeout(timeout))
        .and_then(|inner| inner);
        match transfer {
            Ok(entry) => {
                result.success = true;
                result.size_bytes = entry.size;
                debug!(path = %change.relative_path, bytes = entry.size, "downloaded");
                StateUpdate::Upsert(entry)
            }
            Err(e) => {
                // Never leave a partial file behind, timeout included.
                let _ = tokio::fs::remove_file(&temp).await;
                result.error = Some(e.to_string());
                StateUpdate::None
            }
        }
    }

    /// Stream the object to the temp sibling, verify the byte count,
    /// then rename into place.
    async fn download_file(
        &self,
        remote: &SyncStateEntry,
        local_path: &Path,
        temp: &Path,
    ) -> Result<SyncStateEntry> {
        fsutil::ensure_parent_dir(local_path).await?;

        let written: Result<(u64, String)> = async {
            let mut body = self.store.get_object(&remote.key).await?;
            let mut file = tokio::fs::File::create(&temp).await?;
            let mut digest = hasher::IncrementalHasher::new(HashAlgorithm::Sha256);
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(SyncError::Io)?;
                tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
                digest.update(&chunk);
                written += chunk.len() as u64;
            }
            tokio::io::AsyncWriteExt::flush(&mut file).await?;
            Ok((written, digest.finalize()))
        }
        .await;

        let (written, hash) = match written {
            Ok(ok) => ok,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        if written != remote.size {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(SyncError::storage(format!(
                "short body for {}: got {written} bytes, expected {}",
                remote.key, remote.size
            )));
        }

        tokio::fs::rename(&temp, local_path).await?;
        if self.config.preserve_timestamps && remote.last_modified > 0 {
            if let Err(e) = fsutil::restore_mtime(local_path, remote.last_modified).await {
                warn!(path = %local_path.display(), error = %e, "failed to restore mtime");
            }
        }

        let mut entry = remote.clone();
        entry.content_hash = Some(hash);
        Ok(entry)
    }

    fn record_conflict(&self, conflict: crate::conflict::SyncConflict) {
        self.conflict_log
            .lock()
            .expect("conflict log lock poisoned")
            .record(conflict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictConfig;
    use crate::conflict::ConflictStatus;
    use crate::storage::MemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryObjectStore>,
        downloader: Downloader,
        state: SyncStateStore,
        local_dir: std::path::PathBuf,
        log: Arc<Mutex<ConflictLog>>,
    }

    async fn fixture(policy: DeletedFilePolicy, conflict_config: ConflictConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local_dir = dir.path().join("hq");
        tokio::fs::create_dir_all(&local_dir).await.unwrap();
        let config = DownloadConfig {
            bucket_name: "b".into(),
            s3_prefix: "u/hq/".into(),
            local_dir: local_dir.clone(),
            state_file_path: dir.path().join("state.json"),
            deleted_file_policy: policy,
            trash_dir: Some(dir.path().join("trash")),
            ..Default::default()
        };
        let store = Arc::new(MemoryObjectStore::new());
        let log = Arc::new(Mutex::new(ConflictLog::default()));
        let downloader = Downloader::new(
            config,
            store.clone(),
            Arc::new(ConflictDetector::new(conflict_config.clone()).unwrap()),
            Arc::new(ConflictResolver::new(conflict_config)),
            log.clone(),
        )
        .unwrap();
        let state = SyncStateStore::load(&dir.path().join("state.json"), "u", "u/hq/")
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            store,
            downloader,
            state,
            local_dir,
            log,
        }
    }

    fn added_change(rel: &str, size: u64, etag: &str) -> DetectedChange {
        DetectedChange {
            kind: ChangeKind::Added,
            relative_path: RelativePath::new(rel).unwrap(),
            remote: Some(SyncStateEntry {
                key: format!("u/hq/{rel}"),
                relative_path: RelativePath::new(rel).unwrap(),
                last_modified: 1_700_000_000_000,
                size,
                etag: etag.to_string(),
                content_hash: None,
            }),
            previous_last_modified: None,
        }
    }

    #[tokio::test]
    async fn writes_new_file_and_advances_state() {
        let mut f = fixture(DeletedFilePolicy::Keep, ConflictConfig::default()).await;
        f.store.insert_object("u/hq/a.txt", b"a", 1_700_000_000_000, "x");

        let results = f
            .downloader
            .apply(vec![added_change("a.txt", 1, "x")], &mut f.state)
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].success, "{:?}", results[0].error);
        let written = std::fs::read(f.local_dir.join("a.txt")).unwrap();
        assert_eq!(written, b"a");
        let entry = f.state.get(&RelativePath::new("a.txt").unwrap()).unwrap();
        assert_eq!(entry.etag, "x");
        assert!(entry.content_hash.is_some());
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let mut f = fixture(DeletedFilePolicy::Keep, ConflictConfig::default()).await;
        f.store.insert_object("u/hq/deep/nested/b.md", b"hi", 1, "e");

        let results = f
            .downloader
            .apply(vec![added_change("deep/nested/b.md", 2, "e")], &mut f.state)
            .await;
        assert!(results[0].success);
        assert!(f.local_dir.join("deep/nested/b.md").exists());
    }

    #[tokio::test]
    async fn short_body_fails_without_partial_file() {
        let mut f = fixture(DeletedFilePolicy::Keep, ConflictConfig::default()).await;
        f.store.insert_object("u/hq/a.txt", b"payload", 1, "e");
        f.store.truncate_body("u/hq/a.txt");

        let results = f
            .downloader
            .apply(vec![added_change("a.txt", 7, "e")], &mut f.state)
            .await;

        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("short body"));
        assert!(!f.local_dir.join("a.txt").exists());
        assert_eq!(f.state.tracked_files(), 0);
        // No stray temp siblings either.
        let leftovers = std::fs::read_dir(&f.local_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn deletion_policy_trash_relocates() {
        let mut f = fixture(DeletedFilePolicy::Trash, ConflictConfig::default()).await;
        let rel = RelativePath::new("gone.txt").unwrap();
        let local = rel.to_local(&f.local_dir);
        tokio::fs::write(&local, b"old").await.unwrap();
        f.state
            .upsert(SyncStateEntry {
                key: "u/hq/gone.txt".into(),
                relative_path: rel.clone(),
                last_modified: 1,
                size: 3,
                etag: "e".into(),
                content_hash: None,
            })
            .await
            .unwrap();

        let change = DetectedChange {
            kind: ChangeKind::Deleted,
            relative_path: rel.clone(),
            remote: None,
            previous_last_modified: Some(1),
        };
        let results = f.downloader.apply(vec![change], &mut f.state).await;

        assert!(results[0].success);
        assert!(!local.exists());
        let trashed = f._dir.path().join("trash/gone.txt");
        assert_eq!(std::fs::read(&trashed).unwrap(), b"old");
        assert_eq!(f.state.tracked_files(), 0);
    }

    #[tokio::test]
    async fn keep_both_conflict_renames_then_downloads() {
        let mut f = fixture(DeletedFilePolicy::Keep, ConflictConfig::default()).await;
        let rel = RelativePath::new("notes.md").unwrap();
        let local = rel.to_local(&f.local_dir);
        tokio::fs::write(&local, b"local edit").await.unwrap();

        // Last-synced record differs from both sides.
        f.state
            .upsert(SyncStateEntry {
                key: "u/hq/notes.md".into(),
                relative_path: rel.clone(),
                last_modified: 1,
                size: 5,
                etag: "e0".into(),
                content_hash: Some("h0".into()),
            })
            .await
            .unwrap();
        f.store
            .insert_object("u/hq/notes.md", b"remote edit", 2, "e1");

        let mut change = added_change("notes.md", 11, "e1");
        change.kind = ChangeKind::Modified;
        let results = f.downloader.apply(vec![change], &mut f.state).await;

        assert!(results[0].success);
        assert!(results[0].conflict_id.is_some());
        // Remote content at the original path.
        assert_eq!(std::fs::read(&local).unwrap(), b"remote edit");
        // Local content preserved under the conflict name.
        let conflict_file = std::fs::read_dir(&f.local_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| {
                e.file_name()
                    .to_string_lossy()
                    .contains(".conflict")
            })
            .expect("conflict file present");
        assert_eq!(std::fs::read(conflict_file.path()).unwrap(), b"local edit");

        let log = f.log.lock().unwrap();
        let recorded = log.by_path(&rel);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, ConflictStatus::Resolved);
    }

    #[tokio::test]
    async fn local_wins_skips_download_but_advances_state() {
        let conflict_config = ConflictConfig {
            default_strategy: ConflictStrategy::LocalWins,
            ..Default::default()
        };
        let mut f = fixture(DeletedFilePolicy::Keep, conflict_config).await;
        let rel = RelativePath::new("notes.md").unwrap();
        let local = rel.to_local(&f.local_dir);
        tokio::fs::write(&local, b"local edit").await.unwrap();
        f.state
            .upsert(SyncStateEntry {
                key: "u/hq/notes.md".into(),
                relative_path: rel.clone(),
                last_modified: 1,
                size: 5,
                etag: "e0".into(),
                content_hash: Some("h0".into()),
            })
            .await
            .unwrap();
        f.store.insert_object("u/hq/notes.md", b"remote edit", 2, "e1");

        let mut change = added_change("notes.md", 11, "e1");
        change.kind = ChangeKind::Modified;
        let results = f.downloader.apply(vec![change], &mut f.state).await;

        assert!(results[0].success);
        assert!(results[0].skipped);
        // Local content untouched.
        assert_eq!(std::fs::read(&local).unwrap(), b"local edit");
        // State advanced to the remote record to stop re-detection.
        let entry = f.state.get(&rel).unwrap();
        assert_eq!(entry.etag, "e1");
    }

    #[tokio::test]
    async fn manual_strategy_defers_and_leaves_state() {
        let conflict_config = ConflictConfig {
            default_strategy: ConflictStrategy::Manual,
            ..Default::default()
        };
        let mut f = fixture(DeletedFilePolicy::Keep, conflict_config).await;
        let rel = RelativePath::new("notes.md").unwrap();
        let local = rel.to_local(&f.local_dir);
        tokio::fs::write(&local, b"local edit").await.unwrap();
        f.state
            .upsert(SyncStateEntry {
                key: "u/hq/notes.md".into(),
                relative_path: rel.clone(),
                last_modified: 1,
                size: 5,
                etag: "e0".into(),
                content_hash: Some("h0".into()),
            })
            .await
            .unwrap();
        f.store.insert_object("u/hq/notes.md", b"remote edit", 2, "e1");

        let mut change = added_change("notes.md", 11, "e1");
        change.kind = ChangeKind::Modified;
        let results = f.downloader.apply(vec![change], &mut f.state).await;

        assert!(results[0].skipped);
        assert_eq!(std::fs::read(&local).unwrap(), b"local edit");
        assert_eq!(f.state.get(&rel).unwrap().etag, "e0");
        let log = f.log.lock().unwrap();
        assert_eq!(log.by_status(ConflictStatus::Deferred).len(), 1);
    }

    #[tokio::test]
    async fn concurrency_stays_within_bound() {
        let dir = tempfile::tempdir().unwrap();
        let local_dir = dir.path().join("hq");
        tokio::fs::create_dir_all(&local_dir).await.unwrap();
        let config = DownloadConfig {
            bucket_name: "b".into(),
            s3_prefix: "u/hq/".into(),
            local_dir: local_dir.clone(),
            state_file_path: dir.path().join("state.json"),
            max_concurrent_downloads: 2,
            ..Default::default()
        };

        struct CountingStore {
            inner: MemoryObjectStore,
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ObjectStore for CountingStore {
            async fn put_object(
                &self,
                key: &str,
                body: bytes::Bytes,
                metadata: &std::collections::HashMap<String, String>,
                content_type: &str,
            ) -> Result<crate::storage::PutResult> {
                self.inner.put_object(key, body, metadata, content_type).await
            }
            async fn multipart_put(
                &self,
                key: &str,
                source: &Path,
                part_size: u64,
                metadata: &std::collections::HashMap<String, String>,
                content_type: &str,
                progress: Option<crate::storage::ProgressFn>,
            ) -> Result<crate::storage::PutResult> {
                self.inner
                    .multipart_put(key, source, part_size, metadata, content_type, progress)
                    .await
            }
            async fn delete_object(&self, key: &str) -> Result<()> {
                self.inner.delete_object(key).await
            }
            async fn list_objects(
                &self,
                prefix: &str,
                continuation: Option<String>,
            ) -> Result<crate::storage::ListPage> {
                self.inner.list_objects(prefix, continuation).await
            }
            async fn get_object(&self, key: &str) -> Result<crate::storage::ObjectBody> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                let result = self.inner.get_object(key).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }

        let counting = Arc::new(CountingStore {
            inner: MemoryObjectStore::new(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let conflict_config = ConflictConfig::default();
        let log = Arc::new(Mutex::new(ConflictLog::default()));
        let downloader = Downloader::new(
            config,
            counting.clone(),
            Arc::new(ConflictDetector::new(conflict_config.clone()).unwrap()),
            Arc::new(ConflictResolver::new(conflict_config)),
            log,
        )
        .unwrap();
        let mut state = SyncStateStore::load(&dir.path().join("state.json"), "u", "u/hq/")
            .await
            .unwrap();

        let mut changes = Vec::new();
        for i in 0..5 {
            counting.inner.insert_object(&format!("u/hq/f{i}"), b"x", 1, "e");
            changes.push(added_change(&format!("f{i}"), 1, "e"));
        }

        let results = downloader.apply(changes, &mut state).await;
        assert!(results.iter().all(|r| r.success));
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }
}
