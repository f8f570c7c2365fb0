//! Filesystem helpers
//!
//! Small wrappers over `tokio::fs` shared by the state store and the
//! downloader. Writes that must never be observed half-done go through a
//! sibling temp file followed by a rename; on platforms without atomic
//! rename the rename call itself provides the closest equivalent.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::Result;
use crate::events::now_ms;
use crate::path::RelativePath;

/// Sibling path used for in-flight writes next to `target`.
pub fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!(".{name}.{}.part", now_ms()))
}

pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write `content` to `path` atomically: temp sibling, then rename.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent_dir(path).await?;
    let temp = temp_sibling(path);
    tokio::fs::write(&temp, content).await?;
    match tokio::fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            Err(e.into())
        }
    }
}

/// Blocking variant for shutdown paths outside the runtime.
pub fn write_atomic_blocking(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp = temp_sibling(path);
    std::fs::write(&temp, content)?;
    match std::fs::rename(&temp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            Err(e.into())
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_idempotent(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Move a local file into the trash directory, preserving its relative
/// path. An existing file at the target is overwritten.
pub async fn move_to_trash(
    local_path: &Path,
    trash_dir: &Path,
    relative_path: &RelativePath,
) -> Result<PathBuf> {
    let target = relative_path.to_local(trash_dir);
    ensure_parent_dir(&target).await?;
    match tokio::fs::rename(local_path, &target).await {
        Ok(()) => {}
        Err(_) => {
            // Rename across filesystems fails; fall back to copy + remove.
            tokio::fs::copy(local_path, &target).await?;
            tokio::fs::remove_file(local_path).await?;
        }
    }
    debug!(
        from = %local_path.display(),
        to = %target.display(),
        "moved file to trash"
    );
    Ok(target)
}

/// Set a file's modification time from epoch milliseconds.
pub async fn restore_mtime(path: &Path, modified_ms: i64) -> Result<()> {
    let path = path.to_path_buf();
    let mtime = UNIX_EPOCH + Duration::from_millis(modified_ms.max(0) as u64);
    tokio::task::spawn_blocking(move || set_mtime_blocking(&path, mtime))
        .await
        .map_err(|e| std::io::Error::other(e))??;
    Ok(())
}

fn set_mtime_blocking(path: &Path, mtime: SystemTime) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(mtime)?;
    Ok(())
}
