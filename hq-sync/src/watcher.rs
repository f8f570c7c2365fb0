//! File watcher
//!
//! Recursive notify-backed watcher over the HQ root, producing typed
//! [`FileEvent`]s into the shared queue. Raw notifications are debounced
//! per path with a quiet window (editors write temp files and rename;
//! one settled event is enough), then classified by stat plus a known
//! path set: new path -> add/addDir, known path -> change, missing known
//! path -> unlink/unlinkDir. Ignored paths never produce events.
//!
//! When the native watcher cannot be initialized the watcher degrades to
//! a periodic full rescan that diffs an mtime/size snapshot; the owner
//! is told through the state callback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::events::{now_ms, FileEvent, FileEventKind};
use crate::ignore::IgnoreEngine;
use crate::path::RelativePath;
use crate::queue::EventQueue;

pub const DEFAULT_DEBOUNCE_MS: u64 = 200;
pub const DEFAULT_RESCAN_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Active,
    Degraded,
    Stopped,
}

pub type WatcherStateCallback = Arc<dyn Fn(WatcherState) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub root_dir: PathBuf,
    /// Per-path quiet window before an event is emitted.
    pub debounce_ms: u64,
    /// Full-rescan cadence in degraded mode.
    pub rescan_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            rescan_interval_ms: DEFAULT_RESCAN_INTERVAL_MS,
        }
    }
}

/// What the watcher remembers about a path it has observed.
#[derive(Debug, Clone, Copy)]
struct KnownEntry {
    is_dir: bool,
    modified_ms: i64,
    size: u64,
}

pub struct FileWatcher {
    config: WatcherConfig,
    ignore: Arc<IgnoreEngine>,
    queue: Arc<EventQueue>,
    state_callback: Option<WatcherStateCallback>,
    cancel: CancellationToken,
    native: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn new(config: WatcherConfig, ignore: Arc<IgnoreEngine>, queue: Arc<EventQueue>) -> Self {
        Self {
            config,
            ignore,
            queue,
            state_callback: None,
            cancel: CancellationToken::new(),
            native: None,
            tasks: Vec::new(),
        }
    }

    /// Register the owner's state callback before `start`.
    pub fn on_state_change(&mut self, callback: WatcherStateCallback) {
        self.state_callback = Some(callback);
    }

    fn notify_state(&self, state: WatcherState) {
        if let Some(callback) = &self.state_callback {
            callback(state);
        }
    }

    /// Start watching. Emits add/addDir events for existing content when
    /// `emit_initial_events` (the daemon's sync-on-start behavior). Falls
    /// back to rescan mode when the native watcher cannot be set up;
    /// a missing root is fatal.
    pub fn start(&mut self, emit_initial_events: bool) -> Result<()> {
        if !self.config.root_dir.is_dir() {
            return Err(SyncError::Watch(format!(
                "watch root is not a directory: {}",
                self.config.root_dir.display()
            )));
        }

        let known = self.initial_scan(emit_initial_events);
        info!(
            root = %self.config.root_dir.display(),
            known = known.len(),
            "initial scan complete"
        );

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let native = Self::build_native_watcher(&self.config.root_dir, raw_tx);
        match native {
            Ok(watcher) => {
                self.native = Some(watcher);
                self.tasks.push(self.spawn_debouncer(raw_rx, known));
                info!("native filesystem watcher active");
                self.notify_state(WatcherState::Active);
            }
            Err(e) => {
                warn!(error = %e, "native watcher unavailable, degrading to periodic rescan");
                self.tasks.push(self.spawn_rescanner(known));
                self.notify_state(WatcherState::Degraded);
            }
        }
        Ok(())
    }

    /// Force rescan mode regardless of native watcher availability.
    pub fn start_rescan_only(&mut self, emit_initial_events: bool) -> Result<()> {
        if !self.config.root_dir.is_dir() {
            return Err(SyncError::Watch(format!(
                "watch root is not a directory: {}",
                self.config.root_dir.display()
            )));
        }
        let known = self.initial_scan(emit_initial_events);
        self.tasks.push(self.spawn_rescanner(known));
        self.notify_state(WatcherState::Degraded);
        Ok(())
    }

    /// Stop the watcher and wait for its tasks to settle.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.native = None;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.notify_state(WatcherState::Stopped);
    }

    fn build_native_watcher(
        root: &Path,
        raw_tx: mpsc::UnboundedSender<PathBuf>,
    ) -> Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| SyncError::Watch(e.to_string()))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Watch(e.to_string()))?;
        Ok(watcher)
    }

    /// Walk the root to seed the known-path map, optionally emitting
    /// add events for everything found. Ignored directories are not
    /// descended into.
    fn initial_scan(&self, emit: bool) -> HashMap<PathBuf, KnownEntry> {
        let mut known = HashMap::new();
        let mut timestamps = MonotonicClock::default();
        let root = self.config.root_dir.clone();

        let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
            if entry.path() == root {
                return true;
            }
            match RelativePath::from_local(&root, entry.path()) {
                Ok(rel) => {
                    !self
                        .ignore
                        .check(rel.as_str(), entry.file_type().is_dir())
                        .ignored
                }
                Err(_) => false,
            }
        });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path == root {
                continue;
            }
            let Ok(rel) = RelativePath::from_local(&root, path) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            let snapshot = KnownEntry {
                is_dir: meta.is_dir(),
                modified_ms: modified_ms_of(&meta),
                size: meta.len(),
            };
            known.insert(path.to_path_buf(), snapshot);

            if emit {
                let kind = if snapshot.is_dir {
                    FileEventKind::AddDir
                } else {
                    FileEventKind::Add
                };
                self.queue.push(FileEvent::new(
                    kind,
                    rel,
                    path.to_path_buf(),
                    timestamps.next(),
                ));
            }
        }
        known
    }

    fn spawn_debouncer(
        &self,
        mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
        mut known: HashMap<PathBuf, KnownEntry>,
    ) -> JoinHandle<()> {
        let root = self.config.root_dir.clone();
        let debounce = Duration::from_millis(self.config.debounce_ms);
        let ignore = self.ignore.clone();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
            let tick = Duration::from_millis((debounce.as_millis() as u64 / 4).max(10));
            let mut interval = tokio::time::interval(tick);
            let mut timestamps = MonotonicClock::default();

            loop {
                tokio::select! {
                    raw = raw_rx.recv() => {
                        match raw {
                            Some(path) => {
                                pending.insert(path, Instant::now());
                            }
                            None => break,
                        }
                    }
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let due: Vec<PathBuf> = pending
                            .iter()
                            .filter(|(_, touched)| now.duration_since(**touched) >= debounce)
                            .map(|(path, _)| path.clone())
                            .collect();
                        for path in due {
                            pending.remove(&path);
                            classify_and_emit(
                                &root, &path, &ignore, &queue, &mut known, &mut timestamps,
                            );
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("watcher debouncer stopped");
        })
    }

    fn spawn_rescanner(&self, known: HashMap<PathBuf, KnownEntry>) -> JoinHandle<()> {
        let root = self.config.root_dir.clone();
        let interval_ms = self.config.rescan_interval_ms;
        let ignore = self.ignore.clone();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut snapshot = known;
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
            // The first tick fires immediately; skip it so the initial
            // scan is not re-diffed against itself.
            interval.tick().await;
            let mut timestamps = MonotonicClock::default();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        snapshot = rescan_once(&root, &ignore, &queue, snapshot, &mut timestamps);
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("watcher rescanner stopped");
        })
    }
}

/// Timestamps that never go backwards within one watcher instance.
#[derive(Default)]
struct MonotonicClock {
    last_ms: i64,
}

impl MonotonicClock {
    fn next(&mut self) -> i64 {
        let now = now_ms();
        self.last_ms = now.max(self.last_ms);
        self.last_ms
    }
}

fn modified_ms_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Settle one debounced path: stat it, compare against the known set,
/// and emit the representative event.
fn classify_and_emit(
    root: &Path,
    path: &Path,
    ignore: &IgnoreEngine,
    queue: &EventQueue,
    known: &mut HashMap<PathBuf, KnownEntry>,
    timestamps: &mut MonotonicClock,
) {
    let Ok(rel) = RelativePath::from_local(root, path) else {
        return;
    };

    match std::fs::metadata(path) {
        Ok(meta) => {
            let is_dir = meta.is_dir();
            if ignore.check(rel.as_str(), is_dir).ignored {
                return;
            }
            let snapshot = KnownEntry {
                is_dir,
                modified_ms: modified_ms_of(&meta),
                size: meta.len(),
            };
            let previous = known.insert(path.to_path_buf(), snapshot);
            let kind = match previous {
                None if is_dir => FileEventKind::AddDir,
                None => FileEventKind::Add,
                // Re-notified directories carry no new content.
                Some(prev) if is_dir && prev.is_dir => return,
                // A file replaced by a directory is a fresh directory.
                Some(_) if is_dir => FileEventKind::AddDir,
                Some(_) => FileEventKind::Change,
            };
            queue.push(FileEvent::new(
                kind,
                rel,
                path.to_path_buf(),
                timestamps.next(),
            ));
        }
        Err(_) => {
            // Path is gone. Only report it if we ever observed it.
            let Some(previous) = known.remove(path) else {
                return;
            };
            if ignore.check(rel.as_str(), previous.is_dir).ignored {
                return;
            }
            let kind = if previous.is_dir {
                FileEventKind::UnlinkDir
            } else {
                FileEventKind::Unlink
            };
            queue.push(FileEvent::new(
                kind,
                rel,
                path.to_path_buf(),
                timestamps.next(),
            ));
        }
    }
}

/// One degraded-mode rescan: walk the tree, diff against the previous
/// snapshot, emit events for every difference, return the new snapshot.
fn rescan_once(
    root: &Path,
    ignore: &IgnoreEngine,
    queue: &EventQueue,
    previous: HashMap<PathBuf, KnownEntry>,
    timestamps: &mut MonotonicClock,
) -> HashMap<PathBuf, KnownEntry> {
    let mut current: HashMap<PathBuf, KnownEntry> = HashMap::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.path() == root {
            return true;
        }
        match RelativePath::from_local(root, entry.path()) {
            Ok(rel) => {
                !ignore
                    .check(rel.as_str(), entry.file_type().is_dir())
                    .ignored
            }
            Err(_) => false,
        }
    });

    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == root {
            continue;
        }
        let Ok(rel) = RelativePath::from_local(root, path) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };
        let snapshot = KnownEntry {
            is_dir: meta.is_dir(),
            modified_ms: modified_ms_of(&meta),
            size: meta.len(),
        };
        current.insert(path.to_path_buf(), snapshot);

        match previous.get(path) {
            None => {
                let kind = if snapshot.is_dir {
                    FileEventKind::AddDir
                } else {
                    FileEventKind::Add
                };
                queue.push(FileEvent::new(kind, rel, path.to_path_buf(), timestamps.next()));
            }
            Some(prev)
                if !snapshot.is_dir
                    && (prev.modified_ms != snapshot.modified_ms || prev.size != snapshot.size) =>
            {
                queue.push(FileEvent::new(
                    FileEventKind::Change,
                    rel,
                    path.to_path_buf(),
                    timestamps.next(),
                ));
            }
            Some(_) => {}
        }
    }

    for (path, prev) in &previous {
        if !current.contains_key(path) {
            let Ok(rel) = RelativePath::from_local(root, path) else {
                continue;
            };
            let kind = if prev.is_dir {
                FileEventKind::UnlinkDir
            } else {
                FileEventKind::Unlink
            };
            queue.push(FileEvent::new(kind, rel, path.clone(), timestamps.next()));
        }
    }

    current
}
