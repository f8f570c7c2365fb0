//! Coalescing event queue
//!
//! Bounded FIFO between the watcher and the daemon. Multiple events on
//! the same path collapse into the minimal representative event so at
//! most one event per path is pending per drain. File and directory
//! events coalesce in separate lanes.
//!
//! Overflow policy: when the queue is full, the oldest pending event is
//! dropped (not the incoming one) and `dropped_events` is incremented in
//! the stats. Consumers that care about missed history must watch that
//! counter.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::events::{FileEvent, FileEventKind};

/// Counters exposed through the daemon stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_files: usize,
    pub pending_dirs: usize,
    pub coalesced_events: u64,
    pub dropped_events: u64,
}

#[derive(Default)]
struct Lanes {
    files: VecDeque<FileEvent>,
    dirs: VecDeque<FileEvent>,
    coalesced_events: u64,
    dropped_events: u64,
}

pub struct EventQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
}

/// Merge an already-queued event kind with a newer one on the same path.
/// `None` means both cancel out and the path disappears from the queue.
fn coalesce(old: FileEventKind, new: FileEventKind) -> Option<FileEventKind> {
    use FileEventKind::*;
    match (old, new) {
        (Add, Unlink) => None,
        (Add, _) => Some(Add),
        (_, Unlink) => Some(Unlink),
        (Unlink, Add) => Some(Change),
        (AddDir, UnlinkDir) => None,
        (UnlinkDir, AddDir) => Some(AddDir),
        (_, new) => Some(new),
    }
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
        }
    }

    /// Enqueue an event, coalescing against any pending event on the
    /// same path within the event's lane.
    pub fn push(&self, event: FileEvent) {
        let mut lanes = self.lanes.lock().expect("event queue lock poisoned");

        let lane = if event.kind.is_dir() {
            &mut lanes.dirs
        } else {
            &mut lanes.files
        };

        if let Some(idx) = lane
            .iter()
            .position(|pending| pending.relative_path == event.relative_path)
        {
            let old = lane[idx].kind;
            match coalesce(old, event.kind) {
                Some(kind) => {
                    let slot = &mut lane[idx];
                    slot.kind = kind;
                    slot.absolute_path = event.absolute_path;
                    slot.timestamp_ms = event.timestamp_ms;
                }
                None => {
                    lane.remove(idx);
                    debug!(
                        path = %event.relative_path,
                        "events cancelled out, path never observed"
                    );
                }
            }
            lanes.coalesced_events += 1;
            return;
        }

        if lanes.files.len() + lanes.dirs.len() >= self.capacity {
            // Drop the globally oldest pending event.
            let drop_from_files = match (lanes.files.front(), lanes.dirs.front()) {
                (Some(f), Some(d)) => f.timestamp_ms <= d.timestamp_ms,
                (Some(_), None) => true,
                _ => false,
            };
            let dropped = if drop_from_files {
                lanes.files.pop_front()
            } else {
                lanes.dirs.pop_front()
            };
            lanes.dropped_events += 1;
            if let Some(dropped) = dropped {
                warn!(
                    path = %dropped.relative_path,
                    kind = dropped.kind.as_str(),
                    "event queue full, dropped oldest event"
                );
            }
        }

        let lane = if event.kind.is_dir() {
            &mut lanes.dirs
        } else {
            &mut lanes.files
        };
        lane.push_back(event);
    }

    /// Atomically take the current batch and reset for the next cycle.
    /// Directory events come first so structure exists before content.
    /// Pushes racing with a drain land in the next batch.
    pub fn drain(&self) -> Vec<FileEvent> {
        let mut lanes = self.lanes.lock().expect("event queue lock poisoned");
        let mut batch = Vec::with_capacity(lanes.files.len() + lanes.dirs.len());
        batch.extend(lanes.dirs.drain(..));
        batch.extend(lanes.files.drain(..));
        batch
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock().expect("event queue lock poisoned");
        lanes.files.len() + lanes.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let lanes = self.lanes.lock().expect("event queue lock poisoned");
        QueueStats {
            pending_files: lanes.files.len(),
            pending_dirs: lanes.dirs.len(),
            coalesced_events: lanes.coalesced_events,
            dropped_events: lanes.dropped_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::now_ms;
    use crate::path::RelativePath;
    use std::path::PathBuf;

    fn event(kind: FileEventKind, path: &str, ts: i64) -> FileEvent {
        FileEvent::new(
            kind,
            RelativePath::new(path).unwrap(),
            PathBuf::from(format!("/root/{path}")),
            ts,
        )
    }

    #[test]
    fn add_then_change_stays_add() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Add, "x", 1));
        queue.push(event(FileEventKind::Change, "x", 2));
        let batch = queue.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, FileEventKind::Add);
        assert_eq!(batch[0].timestamp_ms, 2);
    }

    #[test]
    fn add_then_unlink_cancels() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Add, "x", 1));
        queue.push(event(FileEventKind::Change, "x", 2));
        queue.push(event(FileEventKind::Change, "x", 3));
        queue.push(event(FileEventKind::Unlink, "x", 4));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn change_then_unlink_is_unlink() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Change, "x", 1));
        queue.push(event(FileEventKind::Unlink, "x", 2));
        let batch = queue.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, FileEventKind::Unlink);
    }

    #[test]
    fn unlink_then_add_is_change() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Unlink, "x", 1));
        queue.push(event(FileEventKind::Add, "x", 2));
        let batch = queue.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, FileEventKind::Change);
    }

    #[test]
    fn dir_lane_coalesces_independently() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::AddDir, "d", 1));
        queue.push(event(FileEventKind::UnlinkDir, "d", 2));
        queue.push(event(FileEventKind::Add, "d/file", 3));
        let batch = queue.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].relative_path.as_str(), "d/file");
    }

    #[test]
    fn distinct_paths_do_not_coalesce() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Add, "a", 1));
        queue.push(event(FileEventKind::Add, "b", 2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dirs_drain_before_files() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Add, "d/file", 1));
        queue.push(event(FileEventKind::AddDir, "d", 2));
        let batch = queue.drain();
        assert_eq!(batch[0].kind, FileEventKind::AddDir);
        assert_eq!(batch[1].kind, FileEventKind::Add);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue = EventQueue::new(2);
        queue.push(event(FileEventKind::Add, "a", 1));
        queue.push(event(FileEventKind::Add, "b", 2));
        queue.push(event(FileEventKind::Add, "c", 3));
        let stats = queue.stats();
        assert_eq!(stats.dropped_events, 1);
        let batch = queue.drain();
        let paths: Vec<&str> = batch.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["b", "c"]);
    }

    #[test]
    fn coalescing_does_not_trigger_overflow() {
        let queue = EventQueue::new(1);
        queue.push(event(FileEventKind::Add, "a", 1));
        queue.push(event(FileEventKind::Change, "a", 2));
        let stats = queue.stats();
        assert_eq!(stats.dropped_events, 0);
        assert_eq!(stats.coalesced_events, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_resets_for_next_cycle() {
        let queue = EventQueue::new(100);
        queue.push(event(FileEventKind::Add, "a", now_ms()));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
        queue.push(event(FileEventKind::Change, "a", now_ms()));
        assert_eq!(queue.len(), 1);
    }

    /// Random well-formed event streams (a file is only changed or
    /// unlinked after being added) over paths that did not exist before
    /// the batch never drain to an unlink: the add/unlink pair cancels.
    #[test]
    fn no_unlink_without_observed_existence() {
        let mut seed: u64 = 0x5eed;
        let mut next = move || {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            seed >> 33
        };

        for _ in 0..200 {
            let queue = EventQueue::new(100);
            let mut exists = [false; 3];
            for step in 0..40 {
                let idx = (next() % 3) as usize;
                let path = format!("p{idx}");
                let kind = if exists[idx] {
                    if next() % 2 == 0 {
                        FileEventKind::Change
                    } else {
                        exists[idx] = false;
                        FileEventKind::Unlink
                    }
                } else {
                    exists[idx] = true;
                    FileEventKind::Add
                };
                queue.push(event(kind, &path, step));
            }
            for drained in queue.drain() {
                assert_ne!(drained.kind, FileEventKind::Unlink);
            }
        }
    }
}
