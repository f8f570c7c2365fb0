//! Object store abstraction
//!
//! The one external interface the engine consumes. Three interchangeable
//! implementations:
//!   * [`S3ObjectStore`] — the official AWS SDK
//!   * [`CliObjectStore`] — `aws s3api` subprocess fallback for hosts
//!     where the SDK cannot be used
//!   * [`MemoryObjectStore`] — in-memory test double

mod cli;
mod memory;
mod s3;

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;

pub use cli::CliObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Streamed object body: chunks of bytes or the error that ended them.
pub type ObjectBody = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Progress callback: (bytes transferred so far, total bytes).
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Outcome of a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub etag: String,
    pub version_id: Option<String>,
}

/// One listed remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    /// Epoch milliseconds.
    pub last_modified: i64,
    pub size: u64,
    pub etag: String,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<RemoteObject>,
    pub next_token: Option<String>,
}

/// Minimal CRUD surface the sync engine needs from a bucket.
///
/// Deletes are idempotent: removing a key that does not exist succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single-shot put of an in-memory body.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<PutResult>;

    /// Multipart put streamed from a local file, `part_size` bytes per
    /// part, bounded in-flight parts. `progress` is invoked after each
    /// completed part.
    async fn multipart_put(
        &self,
        key: &str,
        source: &Path,
        part_size: u64,
        metadata: &HashMap<String, String>,
        content_type: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PutResult>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    /// One `ListObjectsV2`-style page under `prefix`.
    async fn list_objects(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage>;

    /// Stream an object's content.
    async fn get_object(&self, key: &str) -> Result<ObjectBody>;
}
