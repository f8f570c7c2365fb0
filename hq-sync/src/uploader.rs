//! Uploader
//!
//! Executes a drained event batch against the object store, one result
//! per event. Add/change events hash the file, tag the standard metadata
//! set, and pick single-shot or multipart by size. Deletes are
//! idempotent. The uploader never retries; the daemon owns retry policy.
//!
//! Per-path ordering holds because the queue coalesces to at most one
//! pending event per path per cycle; across paths, results complete in
//! any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::UploaderConfig;
use crate::error::{Result, SyncError};
use crate::events::{FileEvent, FileEventKind};
use crate::hasher::{self, FileDigest};
use crate::path::RelativePath;
use crate::storage::{ObjectStore, ProgressFn};

/// Content type for directory marker objects.
const DIRECTORY_MARKER_CONTENT_TYPE: &str = "application/x-directory";

/// Outcome of one uploaded event.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub relative_path: RelativePath,
    pub kind: FileEventKind,
    pub success: bool,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// The local file vanished between the event and the upload.
    pub vanished: bool,
    pub etag: Option<String>,
}

pub struct Uploader {
    config: UploaderConfig,
    store: Arc<dyn ObjectStore>,
    semaphore: Arc<Semaphore>,
}

impl Uploader {
    pub fn new(config: UploaderConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_uploads));
        Ok(Self {
            config,
            store,
            semaphore,
        })
    }

    /// Object key for a relative path: `{userId}/hq/{path}`. Separator
    /// normalization happened when the `RelativePath` was built.
    pub fn derive_key(&self, relative_path: &RelativePath) -> String {
        format!("{}/hq/{}", self.config.user_id, relative_path)
    }

    /// Process a drained batch, up to `max_concurrent_uploads` events in
    /// flight. Results arrive in completion order.
    pub async fn process_batch(
        self: &Arc<Self>,
        events: Vec<FileEvent>,
        progress: Option<ProgressFn>,
    ) -> Vec<UploadResult> {
        let mut tasks: JoinSet<UploadResult> = JoinSet::new();
        for event in events {
            let uploader = Arc::clone(self);
            let progress = progress.clone();
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("upload semaphore closed");
            tasks.spawn(async move {
                let _permit = permit;
                uploader.process_event(event, progress).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "upload task aborted"),
            }
        }
        results
    }

    async fn process_event(&self, event: FileEvent, progress: Option<ProgressFn>) -> UploadResult {
        let started = Instant::now();
        let mut result = UploadResult {
            relative_path: event.relative_path.clone(),
            kind: event.kind,
            success: false,
            size_bytes: 0,
            duration_ms: 0,
            error: None,
            vanished: false,
            etag: None,
        };

        let outcome = match event.kind {
            FileEventKind::Unlink => self.delete(&event, false).await,
            FileEventKind::UnlinkDir => self.delete(&event, true).await,
            FileEventKind::AddDir => self.put_directory_marker(&event).await,
            FileEventKind::Add | FileEventKind::Change => {
                self.upload_file(&event, progress, &mut result).await
            }
        };

        match outcome {
            Ok(()) => result.success = true,
            Err(e) => result.error = Some(e.to_string()),
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn delete(&self, event: &FileEvent, directory: bool) -> Result<()> {
        let mut key = self.derive_key(&event.relative_path);
        if directory {
            key.push('/');
        }
        // Deleting an object that never existed is a success.
        self.store.delete_object(&key).await?;
        debug!(key, "deleted remote object");
        Ok(())
    }

    async fn put_directory_marker(&self, event: &FileEvent) -> Result<()> {
        let key = format!("{}/", self.derive_key(&event.relative_path));
        let metadata = self.base_metadata();
        self.store
            .put_object(&key, Bytes::new(), &metadata, DIRECTORY_MARKER_CONTENT_TYPE)
            .await?;
        debug!(key, "put directory marker");
        Ok(())
    }

    async fn upload_file(
        &self,
        event: &FileEvent,
        progress: Option<ProgressFn>,
        result: &mut UploadResult,
    ) -> Result<()> {
        if !event.absolute_path.exists() {
            result.vanished = true;
            debug!(path = %event.relative_path, "file vanished before upload, skipping");
            return Ok(());
        }

        let digest = match hasher::hash_file(&event.absolute_path, self.config.hash_algorithm).await
        {
            Ok(digest) => digest,
            Err(e) if !event.absolute_path.exists() => {
                result.vanished = true;
                debug!(path = %event.relative_path, error = %e, "file vanished mid-hash, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let key = self.derive_key(&event.relative_path);
        let metadata = self.file_metadata(event, &digest).await;
        let content_type = content_type_for_path(&event.relative_path);
        result.size_bytes = digest.size_bytes;

        let timeout = Duration::from_millis(self.config.operation_timeout_ms);
        let put = if digest.size_bytes <= self.config.multipart_threshold_bytes {
            let body = tokio::fs::read(&event.absolute_path).await?;
            tokio::time::timeout(
                timeout,
                self.store
                    .put_object(&key, Bytes::from(body), &metadata, content_type),
            )
            .await
            .map_err(|_| SyncError::Timeout(timeout))??
        } else {
            tokio::time::timeout(
                timeout,
                self.store.multipart_put(
                    &key,
                    &event.absolute_path,
                    self.config.multipart_part_size_bytes,
                    &metadata,
                    content_type,
                    progress,
                ),
            )
            .await
            .map_err(|_| SyncError::Timeout(timeout))??
        };

        result.etag = Some(put.etag);
        debug!(key, bytes = digest.size_bytes, "uploaded");
        Ok(())
    }

    fn metadata_key(&self, key: &str) -> String {
        match &self.config.metadata_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    fn base_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                self.metadata_key("uploaded-by"),
                self.config.user_id.clone(),
            ),
            (
                self.metadata_key("sync-agent-version"),
                self.config.sync_agent_version.clone(),
            ),
        ])
    }

    async fn file_metadata(&self, event: &FileEvent, digest: &FileDigest) -> HashMap<String, String> {
        let last_modified_local = match tokio::fs::metadata(&event.absolute_path).await {
            Ok(meta) => meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            Err(_) => Utc::now(),
        };

        let mut metadata = self.base_metadata();
        metadata.insert(self.metadata_key("content-hash"), digest.hash.clone());
        metadata.insert(
            self.metadata_key("hash-algorithm"),
            digest.algorithm.as_str().to_string(),
        );
        metadata.insert(
            self.metadata_key("local-path"),
            event.absolute_path.display().to_string(),
        );
        metadata.insert(
            self.metadata_key("last-modified-local"),
            last_modified_local.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        metadata.insert(
            self.metadata_key("file-size"),
            digest.size_bytes.to_string(),
        );
        metadata
    }
}

/// Infer a `Content-Type` from the file extension.
pub fn content_type_for_path(relative_path: &RelativePath) -> &'static str {
    match relative_path
        .extension()
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("md") | Some("markdown") => "text/markdown",
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("js") | Some("mjs") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
