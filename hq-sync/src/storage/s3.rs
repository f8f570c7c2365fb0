//! AWS SDK object store backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

use super::{ListPage, ObjectBody, ObjectStore, ProgressFn, PutResult, RemoteObject};

/// Upper bound on concurrently uploading parts of one multipart put.
const MAX_IN_FLIGHT_PARTS: usize = 4;

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS credential chain.
    pub async fn new(bucket: &str, region: &str) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&shared),
            bucket: bucket.to_string(),
        }
    }

    pub fn from_client(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }
}

fn map_sdk_err<E>(op: &str, err: SdkError<E>) -> SyncError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("{op}: {}", DisplayErrorContext(&err));
    match status {
        Some(401) | Some(403) => SyncError::Auth(message),
        Some(code) if code >= 500 || code == 429 => SyncError::Storage {
            message,
            transient: true,
        },
        Some(_) => SyncError::Storage {
            message,
            transient: false,
        },
        // Dispatch failures (DNS, connect, timeout) are worth retrying.
        None => SyncError::Storage {
            message,
            transient: true,
        },
    }
}

fn etag_of(raw: Option<&str>) -> String {
    raw.unwrap_or_default().trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<PutResult> {
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| map_sdk_err("put_object", e))?;

        Ok(PutResult {
            etag: etag_of(resp.e_tag()),
            version_id: resp.version_id().map(str::to_string),
        })
    }

    async fn multipart_put(
        &self,
        key: &str,
        source: &Path,
        part_size: u64,
        metadata: &HashMap<String, String>,
        content_type: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PutResult> {
        let total = tokio::fs::metadata(source).await?.len();

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| map_sdk_err("create_multipart_upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| SyncError::storage("create_multipart_upload returned no upload id"))?
            .to_string();

        let outcome = self
            .upload_parts(key, source, part_size, total, &upload_id, progress)
            .await;

        match outcome {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                let resp = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| map_sdk_err("complete_multipart_upload", e))?;
                Ok(PutResult {
                    etag: etag_of(resp.e_tag()),
                    version_id: resp.version_id().map(str::to_string),
                })
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort_err), "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        // S3 deletes are idempotent; a missing key is still a 204.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err("delete_object", e))?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| map_sdk_err("list_objects_v2", e))?;

        let mut items = Vec::new();
        for object in resp.contents() {
            let Some(key) = object.key() else { continue };
            let last_modified = object
                .last_modified()
                .and_then(|dt| dt.to_millis().ok())
                .unwrap_or_default();
            items.push(RemoteObject {
                key: key.to_string(),
                last_modified,
                size: object.size().unwrap_or_default().max(0) as u64,
                etag: etag_of(object.e_tag()),
            });
        }

        Ok(ListPage {
            items,
            next_token: resp.next_continuation_token().map(str::to_string),
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err("get_object", e))?;
        let reader = resp.body.into_async_read();
        Ok(Box::pin(tokio_util::io::ReaderStream::new(reader)))
    }
}

impl S3ObjectStore {
    async fn upload_parts(
        &self,
        key: &str,
        source: &Path,
        part_size: u64,
        total: u64,
        upload_id: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<CompletedPart>> {
        let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT_PARTS));
        let bytes_done = Arc::new(AtomicU64::new(0));
        let mut tasks: JoinSet<Result<CompletedPart>> = JoinSet::new();

        let mut file = tokio::fs::File::open(source).await?;
        let mut part_number: i32 = 0;
        loop {
            let mut chunk = vec![0u8; part_size as usize];
            let mut filled = 0usize;
            while filled < chunk.len() {
                let count = file.read(&mut chunk[filled..]).await?;
                if count == 0 {
                    break;
                }
                filled += count;
            }
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);
            part_number += 1;

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("part semaphore closed");
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let progress = progress.clone();
            let bytes_done = bytes_done.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let part_len = chunk.len() as u64;
                let resp = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(|e| map_sdk_err("upload_part", e))?;
                let done = bytes_done.fetch_add(part_len, Ordering::Relaxed) + part_len;
                if let Some(progress) = &progress {
                    progress(done, total);
                }
                debug!(part = part_number, bytes = part_len, "uploaded part");
                Ok(CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag_of(resp.e_tag()))
                    .build())
            });

            if filled < part_size as usize {
                break;
            }
        }

        let mut parts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let part = joined.map_err(|e| SyncError::Other(format!("part upload task: {e}")))??;
            parts.push(part);
        }
        parts.sort_by_key(|p| p.part_number());
        Ok(parts)
    }
}
