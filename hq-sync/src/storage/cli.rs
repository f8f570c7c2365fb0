//! `aws s3api` subprocess fallback backend.
//!
//! Used on hosts where the SDK credential chain is unavailable but the
//! AWS CLI is configured. One subprocess per operation; bodies round-trip
//! through temp files because `s3api` only speaks paths. Multipart
//! uploads delegate to a single `put-object` (the CLI chunks large
//! transfers internally), so progress is reported once on completion.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

use super::{ListPage, ObjectBody, ObjectStore, ProgressFn, PutResult, RemoteObject};

pub struct CliObjectStore {
    bucket: String,
    region: String,
    binary: String,
}

#[derive(Debug, Deserialize)]
struct CliPutResponse {
    #[serde(rename = "ETag")]
    etag: Option<String>,
    #[serde(rename = "VersionId")]
    version_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliListedObject {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: Option<String>,
    #[serde(rename = "Size")]
    size: Option<u64>,
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliListResponse {
    #[serde(rename = "Contents", default)]
    contents: Vec<CliListedObject>,
    #[serde(rename = "NextContinuationToken")]
    next_continuation_token: Option<String>,
}

impl CliObjectStore {
    pub fn new(bucket: &str, region: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            binary: "aws".to_string(),
        }
    }

    /// Override the CLI binary, mainly for tests.
    pub fn with_binary(bucket: &str, region: &str, binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            ..Self::new(bucket, region)
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(binary = %self.binary, ?args, "invoking aws cli");
        let output = Command::new(&self.binary)
            .args(["s3api"])
            .args(args)
            .args(["--region", self.region.as_str(), "--output", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SyncError::storage(format!("failed to spawn {}: {e}", self.binary)))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("AccessDenied") || stderr.contains("InvalidAccessKeyId") {
            return Err(SyncError::Auth(stderr));
        }
        Err(SyncError::storage(format!(
            "aws cli exited with {}: {stderr}",
            output.status
        )))
    }

    fn metadata_arg(metadata: &HashMap<String, String>) -> String {
        let mut pairs: Vec<String> = metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        pairs.join(",")
    }

    async fn put_from_path(
        &self,
        key: &str,
        body_path: &Path,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<PutResult> {
        let body_arg = format!("fileb://{}", body_path.display());
        let metadata_arg = Self::metadata_arg(metadata);
        let mut args = vec![
            "put-object",
            "--bucket",
            &self.bucket,
            "--key",
            key,
            "--body",
            &body_arg,
            "--content-type",
            content_type,
        ];
        if !metadata_arg.is_empty() {
            args.push("--metadata");
            args.push(&metadata_arg);
        }
        let stdout = self.run(&args).await?;
        let parsed: CliPutResponse = serde_json::from_slice(&stdout)
            .map_err(|e| SyncError::storage(format!("unparseable put-object output: {e}")))?;
        Ok(PutResult {
            etag: parsed.etag.unwrap_or_default().trim_matches('"').to_string(),
            version_id: parsed.version_id,
        })
    }
}

#[async_trait]
impl ObjectStore for CliObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<PutResult> {
        let temp = tempfile_for_body()?;
        tokio::fs::write(temp.path(), &body).await?;
        self.put_from_path(key, temp.path(), metadata, content_type)
            .await
    }

    async fn multipart_put(
        &self,
        key: &str,
        source: &Path,
        _part_size: u64,
        metadata: &HashMap<String, String>,
        content_type: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PutResult> {
        let total = tokio::fs::metadata(source).await?.len();
        let result = self
            .put_from_path(key, source, metadata, content_type)
            .await?;
        if let Some(progress) = progress {
            progress(total, total);
        }
        Ok(result)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match self
            .run(&["delete-object", "--bucket", &self.bucket, "--key", key])
            .await
        {
            Ok(_) => Ok(()),
            // Missing keys are a successful delete.
            Err(SyncError::Storage { message, .. })
                if message.contains("NoSuchKey") || message.contains("404") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        let mut args = vec![
            "list-objects-v2",
            "--bucket",
            &self.bucket,
            "--prefix",
            prefix,
        ];
        if let Some(token) = &continuation {
            args.push("--continuation-token");
            args.push(token);
        }
        let stdout = self.run(&args).await?;
        if stdout.iter().all(|b| b.is_ascii_whitespace()) {
            // The CLI prints nothing for an empty prefix.
            return Ok(ListPage::default());
        }
        let parsed: CliListResponse = serde_json::from_slice(&stdout)
            .map_err(|e| SyncError::storage(format!("unparseable list output: {e}")))?;

        let items = parsed
            .contents
            .into_iter()
            .map(|obj| {
                let last_modified = obj
                    .last_modified
                    .as_deref()
                    .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or_default();
                RemoteObject {
                    key: obj.key,
                    last_modified,
                    size: obj.size.unwrap_or_default(),
                    etag: obj.etag.unwrap_or_default().trim_matches('"').to_string(),
                }
            })
            .collect();

        Ok(ListPage {
            items,
            next_token: parsed.next_continuation_token,
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody> {
        let temp = tempfile_for_body()?;
        let outfile = temp.path().display().to_string();
        self.run(&["get-object", "--bucket", &self.bucket, "--key", key, &outfile])
            .await?;
        // Small-object fallback path: buffer the temp file and stream one
        // chunk so the temp file can be reclaimed immediately.
        let data = tokio::fs::read(temp.path()).await?;
        let chunk = Bytes::from(data);
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }
}

fn tempfile_for_body() -> Result<tempfile::NamedTempFile> {
    tempfile::NamedTempFile::new().map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_arg_is_sorted_key_value_pairs() {
        let metadata = HashMap::from([
            ("file-size".to_string(), "2".to_string()),
            ("content-hash".to_string(), "abc".to_string()),
        ]);
        assert_eq!(
            CliObjectStore::metadata_arg(&metadata),
            "content-hash=abc,file-size=2"
        );
    }

    #[test]
    fn parses_list_output() {
        let raw = r#"{
            "Contents": [
                {"Key": "u/hq/a.txt", "LastModified": "2025-03-01T10:00:00+00:00", "Size": 5, "ETag": "\"abc\""}
            ],
            "NextContinuationToken": "tok"
        }"#;
        let parsed: CliListResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.contents.len(), 1);
        assert_eq!(parsed.contents[0].key, "u/hq/a.txt");
        assert_eq!(parsed.next_continuation_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_transient_storage_error() {
        let store = CliObjectStore::with_binary("b", "us-east-1", "/nonexistent/aws-cli");
        let err = store.list_objects("p/", None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
