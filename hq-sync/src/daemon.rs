//! Sync daemon
//!
//! Orchestrates watcher -> queue -> uploader. Lifecycle is linear:
//!
//! ```text
//! idle -- start() --> starting -- watcher ready --> running
//! running -- pause() --> paused -- resume() --> running
//! running|paused -- stop() --> stopping -- final drain --> stopped
//! any -- fatal --> stopped
//! ```
//!
//! A scheduled flush drains the queue every `sync_interval_ms` while
//! running; `trigger_sync` flushes immediately. At most one flush runs
//! at a time. Failed events are re-queued with exponential backoff up to
//! `max_retries`; the uploader itself never retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::{Result, SyncError};
use crate::events::{now_ms, FileEvent, FileEventKind};
use crate::ignore::IgnoreEngine;
use crate::queue::EventQueue;
use crate::status::{ErrorDirection, StatusAggregator, SyncErrorRecord, SyncProgress};
use crate::uploader::{UploadResult, Uploader};
use crate::watcher::{FileWatcher, WatcherConfig, WatcherState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Typed subscription events, in place of string event names.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Started,
    Stopped,
    FileEvent {
        kind: FileEventKind,
        relative_path: String,
    },
    SyncStart {
        pending: usize,
    },
    SyncComplete {
        synced: usize,
        failed: usize,
        duration_ms: u64,
    },
    FileSynced {
        kind: FileEventKind,
        relative_path: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStats {
    pub state: DaemonState,
    pub started_at: Option<i64>,
    pub sync_cycles_completed: u64,
    pub files_synced: u64,
    pub sync_errors: u64,
    pub pending_events: usize,
    pub last_sync_at: Option<i64>,
    pub last_sync_duration_ms: Option<u64>,
    pub dropped_events: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct StatsInner {
    started_at: Option<i64>,
    sync_cycles_completed: u64,
    files_synced: u64,
    sync_errors: u64,
    last_sync_at: Option<i64>,
    last_sync_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushSummary {
    pub events: usize,
    pub synced: usize,
    pub failed: usize,
    pub vanished: usize,
    pub duration_ms: u64,
}

pub struct SyncDaemon {
    config: DaemonConfig,
    queue: Arc<EventQueue>,
    uploader: Arc<Uploader>,
    ignore: Arc<IgnoreEngine>,
    status: Option<Arc<StatusAggregator>>,
    state: Mutex<DaemonState>,
    stats: Mutex<StatsInner>,
    /// Held for the duration of one flush; `try_lock` enforces the
    /// single-flush invariant.
    flush_guard: tokio::sync::Mutex<()>,
    /// Failed-upload attempt counts by relative path.
    retry_attempts: Mutex<HashMap<String, u32>>,
    events_tx: broadcast::Sender<DaemonEvent>,
    watcher: tokio::sync::Mutex<Option<FileWatcher>>,
    cancel: Mutex<CancellationToken>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncDaemon {
    pub fn new(
        config: DaemonConfig,
        uploader: Arc<Uploader>,
        status: Option<Arc<StatusAggregator>>,
    ) -> Result<Self> {
        config.validate()?;
        let ignore = Arc::new(IgnoreEngine::new(&config.exclude_patterns)?);
        let queue = Arc::new(EventQueue::new(config.max_queue_size));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            queue,
            uploader,
            ignore,
            status,
            state: Mutex::new(DaemonState::Idle),
            stats: Mutex::new(StatsInner::default()),
            flush_guard: tokio::sync::Mutex::new(()),
            retry_attempts: Mutex::new(HashMap::new()),
            events_tx,
            watcher: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            flush_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().expect("daemon state lock poisoned")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events_tx.subscribe()
    }

    /// The queue the watcher feeds; exposed so embedders and tests can
    /// inject events without a live filesystem watcher.
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    pub fn stats(&self) -> DaemonStats {
        let inner = *self.stats.lock().expect("daemon stats lock poisoned");
        let queue_stats = self.queue.stats();
        DaemonStats {
            state: self.state(),
            started_at: inner.started_at,
            sync_cycles_completed: inner.sync_cycles_completed,
            files_synced: inner.files_synced,
            sync_errors: inner.sync_errors,
            pending_events: queue_stats.pending_files + queue_stats.pending_dirs,
            last_sync_at: inner.last_sync_at,
            last_sync_duration_ms: inner.last_sync_duration_ms,
            dropped_events: queue_stats.dropped_events,
        }
    }

    fn transition(&self, allowed_from: &[DaemonState], to: DaemonState) -> Result<DaemonState> {
        let mut state = self.state.lock().expect("daemon state lock poisoned");
        if !allowed_from.contains(&state) {
            return Err(SyncError::InvalidTransition {
                from: state.as_str(),
                to: to.as_str(),
            });
        }
        let previous = *state;
        *state = to;
        Ok(previous)
    }

    fn force_state(&self, to: DaemonState) {
        *self.state.lock().expect("daemon state lock poisoned") = to;
    }

    fn emit(&self, event: DaemonEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish_stats(&self) {
        if let Some(status) = &self.status {
            status.update_daemon_stats(self.stats());
        }
    }

    /// Start the watcher and the scheduled flush loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(&[DaemonState::Idle], DaemonState::Starting)?;

        let watcher_config = WatcherConfig {
            root_dir: self.config.root_dir.clone(),
            ..Default::default()
        };
        let mut watcher =
            FileWatcher::new(watcher_config, self.ignore.clone(), self.queue.clone());
        let events_tx = self.events_tx.clone();
        watcher.on_state_change(Arc::new(move |state| {
            if state == WatcherState::Degraded {
                let _ = events_tx.send(DaemonEvent::Error {
                    message: "filesystem watcher degraded to periodic rescan".to_string(),
                });
            }
        }));

        if let Err(e) = watcher.start(self.config.sync_on_start) {
            // Fatal: an unwatchable root stops the daemon immediately.
            self.force_state(DaemonState::Stopped);
            self.publish_stats();
            return Err(e);
        }
        *self.watcher.lock().await = Some(watcher);

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = cancel.clone();

        let daemon = Arc::clone(self);
        let interval_ms = self.config.sync_interval_ms;
        *self.flush_task.lock().expect("flush task lock poisoned") =
            Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                // Swallow the immediate first tick; the initial scan has
                // only just seeded the queue.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if daemon.state() == DaemonState::Running {
                                daemon.scheduled_flush().await;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                debug!("scheduled flush loop stopped");
            }));

        {
            let mut stats = self.stats.lock().expect("daemon stats lock poisoned");
            stats.started_at = Some(now_ms());
        }
        self.force_state(DaemonState::Running);
        info!(root = %self.config.root_dir.display(), "sync daemon running");
        self.emit(DaemonEvent::Started);
        self.publish_stats();
        Ok(())
    }

    /// Suspend flushes; the watcher stays live and events keep
    /// accumulating (and coalescing) in the queue.
    pub fn pause(&self) -> Result<()> {
        self.transition(&[DaemonState::Running], DaemonState::Paused)?;
        info!("sync daemon paused");
        self.publish_stats();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(&[DaemonState::Paused], DaemonState::Running)?;
        info!("sync daemon resumed");
        self.publish_stats();
        Ok(())
    }

    /// Stop the watcher, run one final drain, wait for in-flight
    /// uploads, and transition to stopped.
    pub async fn stop(&self) -> Result<()> {
        self.transition(
            &[DaemonState::Running, DaemonState::Paused],
            DaemonState::Stopping,
        )?;
        self.publish_stats();

        self.cancel.lock().expect("cancel lock poisoned").cancel();
        let task = self
            .flush_task
            .lock()
            .expect("flush task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }

        // Final drain; the guard also waits out any in-flight flush.
        let _guard = self.flush_guard.lock().await;
        self.run_flush().await;
        drop(_guard);

        self.force_state(DaemonState::Stopped);
        info!("sync daemon stopped");
        self.emit(DaemonEvent::Stopped);
        self.publish_stats();
        Ok(())
    }

    /// Flush the current batch immediately, outside the usual cadence.
    /// Rejected unless running or paused, and while a flush is already
    /// in progress.
    pub async fn trigger_sync(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, DaemonState::Running | DaemonState::Paused) {
            return Err(SyncError::Other(format!(
                "cannot trigger sync while daemon is {}",
                state.as_str()
            )));
        }
        let Ok(_guard) = self.flush_guard.try_lock() else {
            return Err(SyncError::Other("a flush is already in progress".to_string()));
        };
        let summary = self.run_flush().await;
        debug!(
            events = summary.events,
            synced = summary.synced,
            failed = summary.failed,
            "triggered flush complete"
        );
        Ok(())
    }

    async fn scheduled_flush(&self) {
        // Never stack a scheduled flush on top of a running one.
        let Ok(_guard) = self.flush_guard.try_lock() else {
            debug!("flush already in progress, skipping scheduled tick");
            return;
        };
        self.run_flush().await;
    }

    /// One flush cycle. Caller holds the flush guard.
    async fn run_flush(&self) -> FlushSummary {
        let started = Instant::now();
        let mut batch = self.queue.drain();
        if !self.config.enable_deletions {
            batch.retain(|event| {
                !matches!(
                    event.kind,
                    FileEventKind::Unlink | FileEventKind::UnlinkDir
                )
            });
        }

        let mut summary = FlushSummary {
            events: batch.len(),
            ..Default::default()
        };

        if batch.is_empty() {
            let mut stats = self.stats.lock().expect("daemon stats lock poisoned");
            stats.sync_cycles_completed += 1;
            stats.last_sync_at = Some(now_ms());
            stats.last_sync_duration_ms = Some(0);
            drop(stats);
            self.publish_stats();
            return summary;
        }

        self.emit(DaemonEvent::SyncStart {
            pending: batch.len(),
        });
        for event in &batch {
            self.emit(DaemonEvent::FileEvent {
                kind: event.kind,
                relative_path: event.relative_path.as_str().to_string(),
            });
        }
        if let Some(status) = &self.status {
            status.set_progress(SyncProgress {
                direction: ErrorDirection::Upload,
                files_completed: 0,
                files_total: batch.len(),
                bytes_transferred: 0,
                bytes_total: 0,
                current_file: None,
                estimated_remaining_ms: None,
            });
        }

        let total = batch.len();
        let mut completed = 0usize;
        while !batch.is_empty() {
            let chunk: Vec<FileEvent> = batch
                .drain(..batch.len().min(self.config.batch_size))
                .collect();
            let results = self.uploader.process_batch(chunk, None).await;
            completed += results.len();
            if let Some(status) = &self.status {
                status.set_progress(SyncProgress {
                    direction: ErrorDirection::Upload,
                    files_completed: completed,
                    files_total: total,
                    bytes_transferred: 0,
                    bytes_total: 0,
                    current_file: None,
                    estimated_remaining_ms: None,
                });
            }
            for result in results {
                self.collate_result(result, &mut summary);
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock().expect("daemon stats lock poisoned");
            stats.sync_cycles_completed += 1;
            stats.files_synced += summary.synced as u64;
            stats.sync_errors += summary.failed as u64;
            stats.last_sync_at = Some(now_ms());
            stats.last_sync_duration_ms = Some(summary.duration_ms);
        }
        if let Some(status) = &self.status {
            status.clear_progress();
        }
        self.emit(DaemonEvent::SyncComplete {
            synced: summary.synced,
            failed: summary.failed,
            duration_ms: summary.duration_ms,
        });
        self.publish_stats();
        summary
    }

    fn collate_result(&self, result: UploadResult, summary: &mut FlushSummary) {
        let path_key = result.relative_path.as_str().to_string();
        if result.success {
            if result.vanished {
                summary.vanished += 1;
            } else {
                summary.synced += 1;
                self.emit(DaemonEvent::FileSynced {
                    kind: result.kind,
                    relative_path: path_key.clone(),
                });
            }
            self.retry_attempts
                .lock()
                .expect("retry lock poisoned")
                .remove(&path_key);
            return;
        }

        summary.failed += 1;
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "upload failed".to_string());
        warn!(path = %path_key, error = %message, "upload failed");
        self.emit(DaemonEvent::Error {
            message: format!("{path_key}: {message}"),
        });
        if let Some(status) = &self.status {
            status.add_error(
                SyncErrorRecord::new(ErrorDirection::Upload, message).with_file(&path_key),
            );
        }
        self.schedule_retry(result, path_key);
    }

    /// Re-queue a failed event after exponential backoff, up to
    /// `max_retries` attempts, then give up until the path changes again.
    fn schedule_retry(&self, result: UploadResult, path_key: String) {
        let attempts = {
            let mut attempts = self.retry_attempts.lock().expect("retry lock poisoned");
            let entry = attempts.entry(path_key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts > self.config.max_retries {
            warn!(path = %path_key, attempts, "giving up on event after max retries");
            self.retry_attempts
                .lock()
                .expect("retry lock poisoned")
                .remove(&path_key);
            return;
        }

        let backoff_ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << (attempts - 1).min(16));
        debug!(path = %path_key, attempts, backoff_ms, "scheduling upload retry");

        let queue = self.queue.clone();
        let absolute_path = result.relative_path.to_local(&self.config.root_dir);
        let event = FileEvent::new(result.kind, result.relative_path, absolute_path, now_ms());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            queue.push(event);
        });
    }
}
