//! Status aggregator
//!
//! Single externally observable surface over the daemon, the uploader
//! results, the download manager, and the conflict subsystem. Holds only
//! published snapshots; it never reaches into another component's locks.
//! Snapshots are copies, never interior handles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StatusConfig;
use crate::daemon::{DaemonState, DaemonStats, SyncDaemon};
use crate::download_manager::DownloadStats;
use crate::events::now_ms;

/// Coarse health label derived from recent errors and daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    Healthy,
    Degraded,
    Error,
    Offline,
}

/// Errors at or above this ring count degrade health to `error`.
const ERROR_HEALTH_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDirection {
    Upload,
    Download,
    Both,
}

/// One user-visible sync error, kept in a bounded ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorRecord {
    pub direction: ErrorDirection,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub timestamp_ms: i64,
}

impl SyncErrorRecord {
    pub fn new(direction: ErrorDirection, message: impl Into<String>) -> Self {
        Self {
            direction,
            message: message.into(),
            code: None,
            file_path: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }
}

/// Transfer progress while a cycle is in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub direction: ErrorDirection,
    pub files_completed: usize,
    pub files_total: usize,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub total_files_uploaded: u64,
    pub sync_cycles_completed: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub is_polling: bool,
    pub total_files_downloaded: u64,
    pub total_files_deleted: u64,
    pub total_errors: u64,
    pub last_poll_at: Option<i64>,
}

/// Complete observable snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub daemon_state: DaemonState,
    pub health: SyncHealth,
    pub is_syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<SyncProgress>,
    pub last_sync_at: Option<i64>,
    pub last_sync_duration_ms: Option<u64>,
    pub pending_changes: usize,
    pub tracked_files: usize,
    pub upload: UploadSummary,
    pub download: DownloadSummary,
    pub recent_errors: Vec<SyncErrorRecord>,
    pub generated_at: i64,
}

/// Outcome of a trigger request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Default)]
struct Inner {
    daemon_stats: Option<DaemonStats>,
    download_stats: Option<DownloadStats>,
    /// Newest first.
    errors: VecDeque<SyncErrorRecord>,
    trigger_in_progress: bool,
    progress: Option<SyncProgress>,
}

pub struct StatusAggregator {
    inner: Mutex<Inner>,
    config: StatusConfig,
}

/// Pure health derivation; see the property tests.
pub fn derive_health(daemon_state: Option<DaemonState>, error_count: usize) -> SyncHealth {
    match daemon_state {
        None | Some(DaemonState::Idle) | Some(DaemonState::Stopped) | Some(DaemonState::Stopping) => {
            SyncHealth::Offline
        }
        Some(_) if error_count >= ERROR_HEALTH_THRESHOLD => SyncHealth::Error,
        Some(_) if error_count >= 1 => SyncHealth::Degraded,
        Some(_) => SyncHealth::Healthy,
    }
}

impl StatusAggregator {
    pub fn new(config: StatusConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("status lock poisoned")
    }

    pub fn update_daemon_stats(&self, stats: DaemonStats) {
        self.lock().daemon_stats = Some(stats);
    }

    pub fn update_download_stats(&self, stats: DownloadStats) {
        self.lock().download_stats = Some(stats);
    }

    pub fn set_progress(&self, progress: SyncProgress) {
        self.lock().progress = Some(progress);
    }

    pub fn clear_progress(&self) {
        self.lock().progress = None;
    }

    pub fn add_error(&self, error: SyncErrorRecord) {
        let mut inner = self.lock();
        inner.errors.push_front(error);
        while inner.errors.len() > self.config.max_recent_errors {
            inner.errors.pop_back();
        }
    }

    pub fn clear_errors(&self) {
        self.lock().errors.clear();
    }

    pub fn set_trigger_in_progress(&self, value: bool) {
        self.lock().trigger_in_progress = value;
    }

    pub fn trigger_in_progress(&self) -> bool {
        self.lock().trigger_in_progress
    }

    pub fn snapshot(&self) -> SyncStatus {
        let inner = self.lock();
        let daemon_state = inner
            .daemon_stats
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(DaemonState::Idle);
        let health = derive_health(
            inner.daemon_stats.as_ref().map(|s| s.state),
            inner.errors.len(),
        );

        let upload = inner
            .daemon_stats
            .as_ref()
            .map(|s| UploadSummary {
                total_files_uploaded: s.files_synced,
                sync_cycles_completed: s.sync_cycles_completed,
                total_errors: s.sync_errors,
            })
            .unwrap_or_default();

        let download = inner
            .download_stats
            .as_ref()
            .map(|s| DownloadSummary {
                is_polling: s.is_polling,
                total_files_downloaded: s.total_files_downloaded,
                total_files_deleted: s.total_files_deleted,
                total_errors: s.total_errors,
                last_poll_at: s.last_poll_at,
            })
            .unwrap_or_default();

        SyncStatus {
            daemon_state,
            health,
            is_syncing: inner.trigger_in_progress || inner.progress.is_some(),
            progress: inner.progress.clone(),
            last_sync_at: inner.daemon_stats.as_ref().and_then(|s| s.last_sync_at),
            last_sync_duration_ms: inner
                .daemon_stats
                .as_ref()
                .and_then(|s| s.last_sync_duration_ms),
            pending_changes: inner
                .daemon_stats
                .as_ref()
                .map(|s| s.pending_events)
                .unwrap_or(0),
            tracked_files: inner
                .download_stats
                .as_ref()
                .map(|s| s.tracked_files)
                .unwrap_or(0),
            upload,
            download,
            recent_errors: inner.errors.iter().cloned().collect(),
            generated_at: now_ms(),
        }
    }

    /// Gate for user-triggered syncs: accepted iff the daemon is running
    /// or paused and no trigger is already in flight. On accept the
    /// trigger flag is set and cleared again by a guard when the
    /// underlying `trigger_sync` finishes, on every exit path.
    pub fn request_trigger(self: &Arc<Self>, daemon: &Arc<SyncDaemon>) -> TriggerResponse {
        let state = daemon.state();
        if !matches!(state, DaemonState::Running | DaemonState::Paused) {
            return TriggerResponse {
                accepted: false,
                reason: Some(format!("daemon is {}", state.as_str())),
            };
        }

        {
            let mut inner = self.lock();
            if inner.trigger_in_progress {
                return TriggerResponse {
                    accepted: false,
                    reason: Some("a triggered sync is already in progress".to_string()),
                };
            }
            inner.trigger_in_progress = true;
        }

        let aggregator = Arc::clone(self);
        let daemon = Arc::clone(daemon);
        tokio::spawn(async move {
            let _guard = TriggerGuard(aggregator.clone());
            match daemon.trigger_sync().await {
                Ok(()) => debug!("triggered sync completed"),
                Err(e) => {
                    warn!(error = %e, "triggered sync failed");
                    aggregator.add_error(SyncErrorRecord::new(
                        ErrorDirection::Upload,
                        format!("triggered sync failed: {e}"),
                    ));
                }
            }
        });

        TriggerResponse {
            accepted: true,
            reason: None,
        }
    }
}

/// Clears the trigger flag when dropped, so the gate reopens even if the
/// triggered flush panics.
struct TriggerGuard(Arc<StatusAggregator>);

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        self.0.set_trigger_in_progress(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon_stats(state: DaemonState) -> DaemonStats {
        DaemonStats {
            state,
            started_at: Some(1),
            sync_cycles_completed: 3,
            files_synced: 7,
            sync_errors: 1,
            pending_events: 2,
            last_sync_at: Some(9),
            last_sync_duration_ms: Some(12),
            dropped_events: 0,
        }
    }

    #[test]
    fn health_is_a_pure_function_of_inputs() {
        assert_eq!(derive_health(None, 0), SyncHealth::Offline);
        assert_eq!(derive_health(Some(DaemonState::Idle), 0), SyncHealth::Offline);
        assert_eq!(derive_health(Some(DaemonState::Stopping), 0), SyncHealth::Offline);
        assert_eq!(derive_health(Some(DaemonState::Stopped), 9), SyncHealth::Offline);
        assert_eq!(derive_health(Some(DaemonState::Running), 0), SyncHealth::Healthy);
        assert_eq!(derive_health(Some(DaemonState::Running), 1), SyncHealth::Degraded);
        assert_eq!(derive_health(Some(DaemonState::Running), 4), SyncHealth::Degraded);
        assert_eq!(derive_health(Some(DaemonState::Running), 5), SyncHealth::Error);
        assert_eq!(derive_health(Some(DaemonState::Paused), 2), SyncHealth::Degraded);
    }

    #[test]
    fn snapshot_without_updates_is_offline_idle() {
        let aggregator = StatusAggregator::new(StatusConfig::default());
        let status = aggregator.snapshot();
        assert_eq!(status.daemon_state, DaemonState::Idle);
        assert_eq!(status.health, SyncHealth::Offline);
        assert!(!status.is_syncing);
        assert!(status.recent_errors.is_empty());
    }

    #[test]
    fn snapshot_merges_both_directions() {
        let aggregator = StatusAggregator::new(StatusConfig::default());
        aggregator.update_daemon_stats(daemon_stats(DaemonState::Running));
        aggregator.update_download_stats(DownloadStats {
            is_polling: true,
            poll_cycles_completed: 4,
            total_files_downloaded: 5,
            total_files_deleted: 1,
            total_errors: 0,
            last_poll_at: Some(77),
            last_poll_duration_ms: Some(3),
            tracked_files: 11,
        });

        let status = aggregator.snapshot();
        assert_eq!(status.health, SyncHealth::Healthy);
        assert_eq!(status.upload.total_files_uploaded, 7);
        assert_eq!(status.upload.sync_cycles_completed, 3);
        assert_eq!(status.download.total_files_downloaded, 5);
        assert_eq!(status.download.last_poll_at, Some(77));
        assert_eq!(status.pending_changes, 2);
        assert_eq!(status.tracked_files, 11);
        assert_eq!(status.last_sync_at, Some(9));
    }

    #[test]
    fn error_ring_is_bounded_newest_first() {
        let aggregator = StatusAggregator::new(StatusConfig {
            max_recent_errors: 3,
        });
        for i in 0..5 {
            aggregator.add_error(SyncErrorRecord::new(
                ErrorDirection::Download,
                format!("error {i}"),
            ));
        }
        let status = aggregator.snapshot();
        assert_eq!(status.recent_errors.len(), 3);
        assert_eq!(status.recent_errors[0].message, "error 4");
        assert_eq!(status.recent_errors[2].message, "error 2");

        aggregator.clear_errors();
        assert!(aggregator.snapshot().recent_errors.is_empty());
    }

    #[test]
    fn error_count_drives_health_through_snapshot() {
        let aggregator = StatusAggregator::new(StatusConfig::default());
        aggregator.update_daemon_stats(daemon_stats(DaemonState::Running));
        for i in 0..5 {
            aggregator.add_error(SyncErrorRecord::new(ErrorDirection::Both, format!("e{i}")));
        }
        assert_eq!(aggregator.snapshot().health, SyncHealth::Error);
    }

    #[test]
    fn progress_marks_syncing() {
        let aggregator = StatusAggregator::new(StatusConfig::default());
        aggregator.update_daemon_stats(daemon_stats(DaemonState::Running));
        aggregator.set_progress(SyncProgress {
            direction: ErrorDirection::Upload,
            files_completed: 1,
            files_total: 4,
            bytes_transferred: 10,
            bytes_total: 40,
            current_file: Some("a.txt".into()),
            estimated_remaining_ms: None,
        });
        assert!(aggregator.snapshot().is_syncing);
        aggregator.clear_progress();
        assert!(!aggregator.snapshot().is_syncing);
    }
}
