//! Engine configuration
//!
//! One config struct per component, defaults matching the deployed HQ
//! agent. `validate()` accumulates every violation instead of failing on
//! the first so a misconfigured engine reports the full list and refuses
//! to start.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;

pub const DEFAULT_MULTIPART_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MULTIPART_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 5;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 5_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const MAX_CONCURRENT_DOWNLOADS_LIMIT: usize = 50;
pub const DEFAULT_MAX_LIST_PAGES: usize = 100;

pub const DEFAULT_CONFLICT_SUFFIX: &str = ".conflict";
pub const DEFAULT_MAX_RECENT_ERRORS: usize = 50;

/// Ceiling for one object-store operation (put, part, get, list).
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 120_000;

/// Content-hash algorithm used for upload metadata and conflict checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha-256",
            Self::Sha1 => "sha-1",
        }
    }
}

/// What the downloader does with a local file whose remote copy is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedFilePolicy {
    Keep,
    Delete,
    Trash,
}

impl Default for DeletedFilePolicy {
    fn default() -> Self {
        Self::Keep
    }
}

/// How a detected conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    KeepBoth,
    LocalWins,
    RemoteWins,
    Manual,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::KeepBoth
    }
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepBoth => "keep_both",
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::Manual => "manual",
        }
    }
}

/// Sync daemon (local -> remote) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Local directory mirrored to the object store.
    pub root_dir: PathBuf,
    pub sync_interval_ms: u64,
    /// Maximum events handed to the uploader per invocation within a flush.
    pub batch_size: usize,
    /// When false, unlink/unlinkDir events are dropped at flush time.
    pub enable_deletions: bool,
    pub exclude_patterns: Vec<String>,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_queue_size: usize,
    /// Seed the queue with a full scan of the root on start().
    pub sync_on_start: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::new(),
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            enable_deletions: true,
            exclude_patterns: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            sync_on_start: true,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.root_dir.as_os_str().is_empty() {
            problems.push("rootDir is required".to_string());
        }
        if self.sync_interval_ms == 0 {
            problems.push("syncIntervalMs must be > 0".to_string());
        }
        if self.batch_size == 0 {
            problems.push("batchSize must be > 0".to_string());
        }
        if self.max_queue_size == 0 {
            problems.push("maxQueueSize must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(problems))
        }
    }
}

/// Uploader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploaderConfig {
    pub bucket_name: String,
    pub region: String,
    pub user_id: String,
    pub sync_agent_version: String,
    pub hash_algorithm: HashAlgorithm,
    pub multipart_threshold_bytes: u64,
    pub multipart_part_size_bytes: u64,
    pub max_concurrent_uploads: usize,
    /// Optional prefix applied to every metadata key.
    pub metadata_prefix: Option<String>,
    /// Per-operation ceiling; a timed-out upload fails that event with a
    /// transient error and the cycle continues.
    pub operation_timeout_ms: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            region: String::new(),
            user_id: String::new(),
            sync_agent_version: env!("CARGO_PKG_VERSION").to_string(),
            hash_algorithm: HashAlgorithm::default(),
            multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD_BYTES,
            multipart_part_size_bytes: DEFAULT_MULTIPART_PART_SIZE_BYTES,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            metadata_prefix: None,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl UploaderConfig {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.bucket_name.is_empty() {
            problems.push("bucketName is required".to_string());
        }
        if self.user_id.is_empty() {
            problems.push("userId is required".to_string());
        }
        if self.multipart_part_size_bytes < 5 * 1024 * 1024 {
            problems.push("multipartPartSizeBytes must be >= 5 MiB".to_string());
        }
        if self.max_concurrent_uploads == 0 {
            problems.push("maxConcurrentUploads must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(problems))
        }
    }
}

/// Download manager (remote -> local) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadConfig {
    pub bucket_name: String,
    pub region: String,
    /// Remote key prefix, normally `{userId}/hq/`.
    pub s3_prefix: String,
    pub local_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub max_concurrent_downloads: usize,
    pub deleted_file_policy: DeletedFilePolicy,
    /// Required when the policy is `trash`.
    pub trash_dir: Option<PathBuf>,
    pub state_file_path: PathBuf,
    pub exclude_patterns: Vec<String>,
    pub preserve_timestamps: bool,
    pub max_list_pages: usize,
    /// Per-operation ceiling; a timed-out list or download fails that
    /// item with a transient error and the cycle continues.
    pub operation_timeout_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            region: String::new(),
            s3_prefix: String::new(),
            local_dir: PathBuf::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            deleted_file_policy: DeletedFilePolicy::default(),
            trash_dir: None,
            state_file_path: PathBuf::new(),
            exclude_patterns: Vec::new(),
            preserve_timestamps: true,
            max_list_pages: DEFAULT_MAX_LIST_PAGES,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.bucket_name.is_empty() {
            problems.push("bucketName is required".to_string());
        }
        if self.s3_prefix.is_empty() {
            problems.push("s3Prefix is required".to_string());
        }
        if self.local_dir.as_os_str().is_empty() {
            problems.push("localDir is required".to_string());
        }
        if self.state_file_path.as_os_str().is_empty() {
            problems.push("stateFilePath is required".to_string());
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS || self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            problems.push(format!(
                "pollIntervalMs must be within {}..={}",
                MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS
            ));
        }
        if self.max_concurrent_downloads == 0
            || self.max_concurrent_downloads > MAX_CONCURRENT_DOWNLOADS_LIMIT
        {
            problems.push(format!(
                "maxConcurrentDownloads must be within 1..={}",
                MAX_CONCURRENT_DOWNLOADS_LIMIT
            ));
        }
        if self.deleted_file_policy == DeletedFilePolicy::Trash && self.trash_dir.is_none() {
            problems.push("trashDir is required when deletedFilePolicy is trash".to_string());
        }
        if self.max_list_pages == 0 {
            problems.push("maxListPages must be >= 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(problems))
        }
    }
}

/// Conflict subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConflictConfig {
    pub default_strategy: ConflictStrategy,
    /// Ordered glob -> strategy pairs; the last matching glob wins.
    pub strategy_overrides: Vec<(String, ConflictStrategy)>,
    pub conflict_suffix: String,
    pub timestamp_conflict_files: bool,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: ConflictStrategy::default(),
            strategy_overrides: Vec::new(),
            conflict_suffix: DEFAULT_CONFLICT_SUFFIX.to_string(),
            timestamp_conflict_files: true,
        }
    }
}

/// Status aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusConfig {
    pub max_recent_errors: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            max_recent_errors: DEFAULT_MAX_RECENT_ERRORS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_config_accumulates_all_violations() {
        let config = DownloadConfig {
            poll_interval_ms: 100,
            max_concurrent_downloads: 99,
            deleted_file_policy: DeletedFilePolicy::Trash,
            trash_dir: None,
            max_list_pages: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        match err {
            SyncError::Config(problems) => {
                // bucket, prefix, localDir, stateFile, poll interval,
                // concurrency, trashDir, maxListPages
                assert_eq!(problems.len(), 8);
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn default_download_config_ranges() {
        let config = DownloadConfig {
            bucket_name: "hq-data".into(),
            s3_prefix: "user-1/hq/".into(),
            local_dir: PathBuf::from("/tmp/hq"),
            state_file_path: PathBuf::from("/tmp/hq/.hq-sync-state.json"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval_ms, 30_000);
        assert_eq!(config.max_concurrent_downloads, 5);
    }

    #[test]
    fn strategy_serde_uses_snake_case() {
        let json = serde_json::to_string(&ConflictStrategy::KeepBoth).unwrap();
        assert_eq!(json, "\"keep_both\"");
        let back: ConflictStrategy = serde_json::from_str("\"remote_wins\"").unwrap();
        assert_eq!(back, ConflictStrategy::RemoteWins);
    }

    #[test]
    fn hash_algorithm_names() {
        assert_eq!(HashAlgorithm::Sha256.as_str(), "sha-256");
        assert_eq!(HashAlgorithm::Sha1.as_str(), "sha-1");
    }
}
