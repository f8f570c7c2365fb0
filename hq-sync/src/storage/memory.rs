//! In-memory object store double used by the test suites.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::config::HashAlgorithm;
use crate::error::{Result, SyncError};
use crate::events::now_ms;
use crate::hasher;

use super::{ListPage, ObjectBody, ObjectStore, ProgressFn, PutResult, RemoteObject};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
    pub content_type: String,
    pub etag: String,
    pub last_modified: i64,
    /// When set, `size`/`etag` report this object but `get_object`
    /// streams `data` as-is. Lets tests simulate truncated bodies.
    pub reported_size: Option<u64>,
}

pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    page_size: usize,
    list_calls: Mutex<u64>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: 1_000,
            list_calls: Mutex::new(0),
        }
    }

    /// Shrink listing pages to force pagination in tests.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::new()
        }
    }

    fn etag_for(data: &[u8]) -> String {
        hasher::hash_bytes(data, HashAlgorithm::Sha256)[..32].to_string()
    }

    /// Seed an object directly, bypassing the trait surface.
    pub fn insert_object(&self, key: &str, data: &[u8], last_modified: i64, etag: &str) {
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                metadata: HashMap::new(),
                content_type: "application/octet-stream".to_string(),
                etag: etag.to_string(),
                last_modified,
                reported_size: None,
            },
        );
    }

    /// Make `get_object` return an empty body while the listing still
    /// reports the original size.
    pub fn truncate_body(&self, key: &str) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(obj) = objects.get_mut(key) {
            obj.reported_size = Some(obj.data.len() as u64);
            obj.data = Bytes::new();
        }
    }

    pub fn get_data(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    pub fn get_stored(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects.lock().unwrap().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many list pages have been requested, for pagination-cap tests.
    pub fn list_calls(&self) -> u64 {
        *self.list_calls.lock().unwrap()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<PutResult> {
        let etag = Self::etag_for(&body);
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                metadata: metadata.clone(),
                content_type: content_type.to_string(),
                etag: etag.clone(),
                last_modified: now_ms(),
                reported_size: None,
            },
        );
        Ok(PutResult {
            etag,
            version_id: None,
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
        let mut file = tokio::fs::File::open(source).await?;
        let total = file.metadata().await?.len();
        let mut data = Vec::with_capacity(total as usize);
        let mut buffer = vec![0u8; part_size.max(1) as usize];
        loop {
            let count = file.read(&mut buffer).await?;
            if count == 0 {
                break;
            }
            data.extend_from_slice(&buffer[..count]);
            if let Some(progress) = &progress {
                progress(data.len() as u64, total);
            }
        }
        self.put_object(key, Bytes::from(data), metadata, content_type)
            .await
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        *self.list_calls.lock().unwrap() += 1;
        let objects = self.objects.lock().unwrap();

        let start_after = continuation.unwrap_or_default();
        let mut items = Vec::new();
        let mut next_token = None;
        for (key, obj) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if *key <= start_after {
                continue;
            }
            if items.len() >= self.page_size {
                next_token = items
                    .last()
                    .map(|last: &RemoteObject| last.key.clone());
                break;
            }
            items.push(RemoteObject {
                key: key.clone(),
                last_modified: obj.last_modified,
                size: obj.reported_size.unwrap_or(obj.data.len() as u64),
                etag: obj.etag.clone(),
            });
        }
        Ok(ListPage { items, next_token })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| SyncError::storage_permanent(format!("no such key: {key}")))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }
}
