//! Daemon settings
//!
//! Layered configuration: TOML file, then environment overrides, then
//! derived defaults (prefix, state file, trash directory). The engine
//! validates ranges itself; this module only assembles the structs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use hq_sync::config::{
    ConflictConfig, DaemonConfig, DeletedFilePolicy, DownloadConfig, StatusConfig, UploaderConfig,
};

pub const DEFAULT_CONFIG_FILE: &str = "sync.toml";
pub const STATE_FILE_NAME: &str = ".hq-sync-state.json";
pub const TRASH_DIR_NAME: &str = ".hq-trash";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub bucket_name: String,
    pub region: String,
    pub user_id: String,
    pub root_dir: PathBuf,
    /// Use the `aws` CLI subprocess backend instead of the SDK.
    pub use_cli_fallback: bool,
    pub daemon: DaemonConfig,
    pub uploader: UploaderConfig,
    pub download: DownloadConfig,
    pub conflict: ConflictConfig,
    pub status: StatusConfig,
}

impl Settings {
    /// Load from `path` (or the default config location when `None`),
    /// apply environment overrides, then derive the per-component
    /// configs from the top-level fields.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(file) if file.exists() => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading config file {}", file.display()))?;
                let parsed: Settings = toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", file.display()))?;
                debug!(file = %file.display(), "loaded configuration");
                parsed
            }
            _ => Settings::default(),
        };

        settings.apply_env();
        settings.resolve();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(bucket) = std::env::var("S3_BUCKET_NAME") {
            self.bucket_name = bucket;
        }
        if let Ok(region) = std::env::var("S3_REGION") {
            self.region = region;
        }
        if let Ok(user) = std::env::var("HQ_USER_ID") {
            self.user_id = user;
        }
        if let Ok(dir) = std::env::var("HQ_DIR") {
            self.root_dir = PathBuf::from(dir);
        }
        if let Ok(ms) = std::env::var("HQ_DOWNLOAD_POLL_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                self.download.poll_interval_ms = ms;
            }
        }
        if let Ok(n) = std::env::var("HQ_DOWNLOAD_MAX_CONCURRENT") {
            if let Ok(n) = n.parse() {
                self.download.max_concurrent_downloads = n;
            }
        }
        if let Ok(policy) = std::env::var("HQ_DOWNLOAD_DELETED_POLICY") {
            match policy.as_str() {
                "keep" => self.download.deleted_file_policy = DeletedFilePolicy::Keep,
                "delete" => self.download.deleted_file_policy = DeletedFilePolicy::Delete,
                "trash" => self.download.deleted_file_policy = DeletedFilePolicy::Trash,
                other => debug!(policy = other, "unrecognized deleted-file policy, ignoring"),
            }
        }
        if let Ok(dir) = std::env::var("HQ_DOWNLOAD_TRASH_DIR") {
            self.download.trash_dir = Some(PathBuf::from(dir));
        }
        if let Ok(file) = std::env::var("HQ_DOWNLOAD_STATE_FILE") {
            self.download.state_file_path = PathBuf::from(file);
        }
        if let Ok(patterns) = std::env::var("HQ_DOWNLOAD_EXCLUDE") {
            self.download.exclude_patterns = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Fill the per-component configs from the shared top-level fields.
    fn resolve(&mut self) {
        self.daemon.root_dir = self.root_dir.clone();

        self.uploader.bucket_name = self.bucket_name.clone();
        self.uploader.region = self.region.clone();
        self.uploader.user_id = self.user_id.clone();
        self.uploader.sync_agent_version = hq_sync::SYNC_AGENT_VERSION.to_string();

        self.download.bucket_name = self.bucket_name.clone();
        self.download.region = self.region.clone();
        if self.download.s3_prefix.is_empty() {
            self.download.s3_prefix = format!("{}/hq/", self.user_id);
        }
        if self.download.local_dir.as_os_str().is_empty() {
            self.download.local_dir = self.root_dir.clone();
        }
        if self.download.state_file_path.as_os_str().is_empty() {
            self.download.state_file_path = self.root_dir.join(STATE_FILE_NAME);
        }
        if self.download.deleted_file_policy == DeletedFilePolicy::Trash
            && self.download.trash_dir.is_none()
        {
            self.download.trash_dir = Some(self.root_dir.join(TRASH_DIR_NAME));
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hq").join(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_and_derives_configs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sync.toml");
        std::fs::write(
            &file,
            r#"
bucketName = "hq-data"
region = "eu-west-1"
userId = "user-9"
rootDir = "/tmp/hq-root"

[download]
pollIntervalMs = 10000
deletedFilePolicy = "trash"

[conflict]
defaultStrategy = "remote_wins"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&file)).unwrap();
        assert_eq!(settings.bucket_name, "hq-data");
        assert_eq!(settings.uploader.user_id, "user-9");
        assert_eq!(settings.download.s3_prefix, "user-9/hq/");
        assert_eq!(settings.download.poll_interval_ms, 10_000);
        assert_eq!(
            settings.download.state_file_path,
            PathBuf::from("/tmp/hq-root").join(STATE_FILE_NAME)
        );
        assert_eq!(
            settings.download.trash_dir,
            Some(PathBuf::from("/tmp/hq-root").join(TRASH_DIR_NAME))
        );
        assert_eq!(settings.daemon.root_dir, PathBuf::from("/tmp/hq-root"));
        assert_eq!(
            settings.conflict.default_strategy,
            hq_sync::config::ConflictStrategy::RemoteWins
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.download.poll_interval_ms, 30_000);
        assert_eq!(settings.download.max_concurrent_downloads, 5);
    }
}
