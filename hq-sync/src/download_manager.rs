//! Download manager
//!
//! Periodic poller wrapping the change detector and the downloader. It
//! exclusively owns the sync state: one poll cycle runs at a time, and
//! every cycle, changed or not, ends by recording the poll and saving
//! the state file.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConflictConfig, DownloadConfig};
use crate::conflict::{ConflictDetector, ConflictLog, ConflictResolver};
use crate::detector::{ChangeDetector, ChangeKind, ChangeSet};
use crate::downloader::Downloader;
use crate::error::Result;
use crate::events::now_ms;
use crate::ignore::IgnoreEngine;
use crate::state::SyncStateStore;
use crate::status::{ErrorDirection, StatusAggregator, SyncErrorRecord};
use crate::storage::ObjectStore;

/// Published download-side counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub is_polling: bool,
    pub poll_cycles_completed: u64,
    pub total_files_downloaded: u64,
    pub total_files_deleted: u64,
    pub total_errors: u64,
    pub last_poll_at: Option<i64>,
    pub last_poll_duration_ms: Option<u64>,
    pub tracked_files: usize,
}

/// Result of one completed poll cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollSummary {
    pub changes_detected: usize,
    pub files_downloaded: usize,
    pub files_deleted: usize,
    pub errors: usize,
    pub duration_ms: u64,
    pub listing_truncated: bool,
}

/// Outcome of a `poll_once` call.
#[derive(Debug, Clone, Copy)]
pub enum PollOutcome {
    Completed(PollSummary),
    /// Another cycle was already in flight.
    Skipped,
}

pub struct DownloadManager {
    config: DownloadConfig,
    detector: ChangeDetector,
    downloader: Downloader,
    state: tokio::sync::Mutex<SyncStateStore>,
    /// Held for the duration of a cycle; `try_lock` enforces the
    /// at-most-one-cycle invariant.
    cycle_guard: tokio::sync::Mutex<()>,
    stats: Mutex<DownloadStats>,
    conflict_log: Arc<Mutex<ConflictLog>>,
    status: Option<Arc<StatusAggregator>>,
    cancel: Mutex<CancellationToken>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    pub async fn new(
        config: DownloadConfig,
        store: Arc<dyn ObjectStore>,
        user_id: &str,
        conflict_config: ConflictConfig,
        status: Option<Arc<StatusAggregator>>,
    ) -> Result<Self> {
        config.validate()?;

        let ignore = Arc::new(IgnoreEngine::new(&config.exclude_patterns)?);
        let conflict_log = Arc::new(Mutex::new(ConflictLog::default()));
        let detector = ChangeDetector::new(store.clone(), ignore, &config);
        let downloader = Downloader::new(
            config.clone(),
            store,
            Arc::new(ConflictDetector::new(conflict_config.clone())?),
            Arc::new(ConflictResolver::new(conflict_config)),
            conflict_log.clone(),
        )?;
        let state =
            SyncStateStore::load(&config.state_file_path, user_id, &config.s3_prefix).await?;

        let stats = DownloadStats {
            tracked_files: state.tracked_files(),
            last_poll_at: state.last_poll_at(),
            ..Default::default()
        };

        Ok(Self {
            config,
            detector,
            downloader,
            state: tokio::sync::Mutex::new(state),
            cycle_guard: tokio::sync::Mutex::new(()),
            stats: Mutex::new(stats),
            conflict_log,
            status,
            cancel: Mutex::new(CancellationToken::new()),
            poll_task: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> DownloadStats {
        *self.stats.lock().expect("download stats lock poisoned")
    }

    pub fn conflict_log(&self) -> Arc<Mutex<ConflictLog>> {
        self.conflict_log.clone()
    }

    /// Run one poll cycle, or report `Skipped` when one is in flight.
    pub async fn poll_once(&self) -> PollOutcome {
        let Ok(_cycle) = self.cycle_guard.try_lock() else {
            debug!("poll cycle already in flight, skipping");
            return PollOutcome::Skipped;
        };

        let started = Instant::now();
        let mut summary = PollSummary::default();
        let mut state = self.state.lock().await;

        match self.detector.detect(&state).await {
            Ok(ChangeSet {
                changes,
                truncated,
                pages_listed,
            }) => {
                summary.changes_detected = changes.len();
                summary.listing_truncated = truncated;
                debug!(
                    changes = changes.len(),
                    pages = pages_listed,
                    "poll detected changes"
                );

                if !changes.is_empty() {
                    let results = self.downloader.apply(changes, &mut state).await;
                    for result in &results {
                        match (result.success, result.kind) {
                            (true, ChangeKind::Deleted) if !result.skipped => {
                                summary.files_deleted += 1
                            }
                            (true, ChangeKind::Added | ChangeKind::Modified)
                                if !result.skipped =>
                            {
                                summary.files_downloaded += 1
                            }
                            (true, _) => {}
                            (false, _) => {
                                summary.errors += 1;
                                let message = result
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| "download failed".to_string());
                                warn!(path = %result.relative_path, error = %message, "change failed");
                                if let Some(status) = &self.status {
                                    status.add_error(
                                        SyncErrorRecord::new(ErrorDirection::Download, message)
                                            .with_file(result.relative_path.as_str()),
                                    );
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                summary.errors += 1;
                warn!(error = %e, "remote listing failed");
                if let Some(status) = &self.status {
                    status.add_error(SyncErrorRecord::new(
                        ErrorDirection::Download,
                        format!("listing failed: {e}"),
                    ));
                }
            }
        }

        // Every cycle ends with a recorded poll and a saved state file.
        state.record_poll();
        if let Err(e) = state.save().await {
            summary.errors += 1;
            warn!(error = %e, "failed to save sync state");
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        let tracked_files = state.tracked_files();
        drop(state);

        {
            let mut stats = self.stats.lock().expect("download stats lock poisoned");
            stats.poll_cycles_completed += 1;
            stats.total_files_downloaded += summary.files_downloaded as u64;
            stats.total_files_deleted += summary.files_deleted as u64;
            stats.total_errors += summary.errors as u64;
            stats.last_poll_at = Some(now_ms());
            stats.last_poll_duration_ms = Some(summary.duration_ms);
            stats.tracked_files = tracked_files;
        }
        self.publish_stats();

        PollOutcome::Completed(summary)
    }

    /// Start the periodic poll loop.
    pub fn start_polling(self: &Arc<Self>) {
        let mut task_slot = self.poll_task.lock().expect("poll task lock poisoned");
        if task_slot.is_some() {
            debug!("poller already running");
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = cancel.clone();
        {
            let mut stats = self.stats.lock().expect("download stats lock poisoned");
            stats.is_polling = true;
        }
        self.publish_stats();

        let manager = Arc::clone(self);
        let interval_ms = self.config.poll_interval_ms;
        *task_slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            info!(interval_ms, "download polling started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = manager.poll_once().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            info!("download polling stopped");
        }));
    }

    /// Stop the poll loop, waiting for any in-flight cycle to finish.
    pub async fn stop_polling(&self) {
        self.cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
        let task = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        // Wait out a cycle the loop may have started before cancelling.
        let _settled = self.cycle_guard.lock().await;

        {
            let mut stats = self.stats.lock().expect("download stats lock poisoned");
            stats.is_polling = false;
        }
        self.publish_stats();
    }

    /// Drop all tracked entries and persist the empty state.
    pub async fn reset_state(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.clear().await?;
        let mut stats = self.stats.lock().expect("download stats lock poisoned");
        stats.tracked_files = 0;
        Ok(())
    }

    fn publish_stats(&self) {
        if let Some(status) = &self.status {
            status.update_download_stats(self.stats());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeletedFilePolicy;
    use crate::storage::MemoryObjectStore;

    async fn manager(
        dir: &std::path::Path,
        store: Arc<MemoryObjectStore>,
        policy: DeletedFilePolicy,
    ) -> Arc<DownloadManager> {
        let config = DownloadConfig {
            bucket_name: "hq-data".into(),
            s3_prefix: "user-1/hq/".into(),
            local_dir: dir.join("hq"),
            state_file_path: dir.join("state.json"),
            deleted_file_policy: policy,
            trash_dir: Some(dir.join("trash")),
            ..Default::default()
        };
        tokio::fs::create_dir_all(&config.local_dir).await.unwrap();
        Arc::new(
            DownloadManager::new(config, store, "user-1", ConflictConfig::default(), None)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn first_run_pull_materializes_remote_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert_object("user-1/hq/a.txt", b"1", 1_700_000_000_000, "x");

        let manager = manager(dir.path(), store, DeletedFilePolicy::Keep).await;
        let outcome = manager.poll_once().await;

        let PollOutcome::Completed(summary) = outcome else {
            panic!("cycle should run");
        };
        assert_eq!(summary.changes_detected, 1);
        assert_eq!(summary.files_downloaded, 1);
        assert_eq!(summary.errors, 0);

        assert_eq!(
            std::fs::read(dir.path().join("hq/a.txt")).unwrap(),
            b"1"
        );
        let stats = manager.stats();
        assert_eq!(stats.total_files_downloaded, 1);
        assert_eq!(stats.poll_cycles_completed, 1);
        assert_eq!(stats.tracked_files, 1);

        // State was saved with the new entry and poll record.
        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["entries"]["a.txt"]["etag"], "x");
        assert!(doc["lastPollAt"].is_i64());
    }

    #[tokio::test]
    async fn quiet_cycle_still_saves_and_records_poll() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let manager = manager(dir.path(), store, DeletedFilePolicy::Keep).await;

        let PollOutcome::Completed(summary) = manager.poll_once().await else {
            panic!("cycle should run");
        };
        assert_eq!(summary.changes_detected, 0);
        assert!(dir.path().join("state.json").exists());
        assert!(manager.stats().last_poll_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_poll_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let manager = manager(dir.path(), store, DeletedFilePolicy::Keep).await;

        // Hold the cycle guard to simulate an in-flight cycle.
        let guard = manager.cycle_guard.lock().await;
        let outcome = manager.poll_once().await;
        assert!(matches!(outcome, PollOutcome::Skipped));
        drop(guard);

        assert!(matches!(
            manager.poll_once().await,
            PollOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn listing_failure_counts_as_cycle_error_but_still_saves() {
        let dir = tempfile::tempdir().unwrap();

        struct FailingStore;
        #[async_trait::async_trait]
        impl ObjectStore for FailingStore {
            async fn put_object(
                &self,
                _: &str,
                _: bytes::Bytes,
                _: &std::collections::HashMap<String, String>,
                _: &str,
            ) -> Result<crate::storage::PutResult> {
                unreachable!()
            }
            async fn multipart_put(
                &self,
                _: &str,
                _: &std::path::Path,
                _: u64,
                _: &std::collections::HashMap<String, String>,
                _: &str,
                _: Option<crate::storage::ProgressFn>,
            ) -> Result<crate::storage::PutResult> {
                unreachable!()
            }
            async fn delete_object(&self, _: &str) -> Result<()> {
                unreachable!()
            }
            async fn list_objects(
                &self,
                _: &str,
                _: Option<String>,
            ) -> Result<crate::storage::ListPage> {
                Err(crate::error::SyncError::storage("503 slow down"))
            }
            async fn get_object(&self, _: &str) -> Result<crate::storage::ObjectBody> {
                unreachable!()
            }
        }

        let config = DownloadConfig {
            bucket_name: "hq-data".into(),
            s3_prefix: "user-1/hq/".into(),
            local_dir: dir.path().join("hq"),
            state_file_path: dir.path().join("state.json"),
            ..Default::default()
        };
        tokio::fs::create_dir_all(&config.local_dir).await.unwrap();
        let manager = DownloadManager::new(
            config,
            Arc::new(FailingStore),
            "user-1",
            ConflictConfig::default(),
            None,
        )
        .await
        .unwrap();

        let PollOutcome::Completed(summary) = manager.poll_once().await else {
            panic!("cycle should run");
        };
        assert_eq!(summary.errors, 1);
        assert_eq!(manager.stats().total_errors, 1);
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn polling_loop_runs_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert_object("user-1/hq/a.txt", b"1", 1, "x");

        let config = DownloadConfig {
            bucket_name: "hq-data".into(),
            s3_prefix: "user-1/hq/".into(),
            local_dir: dir.path().join("hq"),
            state_file_path: dir.path().join("state.json"),
            // Clamp-minimum interval; the first tick fires immediately.
            poll_interval_ms: 5_000,
            ..Default::default()
        };
        tokio::fs::create_dir_all(&config.local_dir).await.unwrap();
        let manager = Arc::new(
            DownloadManager::new(config, store, "user-1", ConflictConfig::default(), None)
                .await
                .unwrap(),
        );

        manager.start_polling();
        assert!(manager.stats().is_polling);

        // The immediate first tick completes one cycle.
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.stats().poll_cycles_completed == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.stats().poll_cycles_completed >= 1);

        manager.stop_polling().await;
        assert!(!manager.stats().is_polling);
        assert!(dir.path().join("hq/a.txt").exists());
    }

    #[tokio::test]
    async fn reset_state_clears_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert_object("user-1/hq/a.txt", b"1", 1, "x");

        let manager = manager(dir.path(), store, DeletedFilePolicy::Keep).await;
        manager.poll_once().await;
        assert_eq!(manager.stats().tracked_files, 1);

        manager.reset_state().await.unwrap();
        assert_eq!(manager.stats().tracked_files, 0);
        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(doc["entries"].as_object().unwrap().is_empty());
    }
}
