//! In-process collaborators.
//!
//! Used for local runs and as the fakes in handler tests. The filesystem content store is the
//! only one that survives a restart.

use crate::batch::{Accepted, BatchResponse, BatchSink, WorkItem};
use crate::collaborators::{
    Cache, ContentStore, Execution, KeyValueStore, SearchIndex, Subscriber, SubscriberRegistry,
    WorkflowStarter,
};
use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Queue or bus that keeps every accepted entry in arrival order.
pub struct MemoryQueue {
    name: &'static str,
    deduplicate: bool,
    /// item id -> sink id, for entries already accepted
    accepted: DashMap<String, String>,
    entries: Mutex<Vec<WorkItem>>,
}

impl MemoryQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            deduplicate: false,
            accepted: DashMap::new(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// A queue that accepts an item id at most once and answers repeats with the first sink id.
    pub fn deduplicating(name: &'static str) -> Self {
        Self {
            deduplicate: true,
            ..Self::new(name)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<WorkItem> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BatchSink for MemoryQueue {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn submit_batch(&self, entries: &[WorkItem]) -> Result<BatchResponse> {
        let mut stored = self
            .entries
            .lock()
            .map_err(|_| PipelineError::TransientSink(format!("{} is poisoned", self.name)))?;

        let mut response = BatchResponse::default();
        for entry in entries {
            if self.deduplicate
                && let Some(sink_id) = self.accepted.get(&entry.item_id)
            {
                response.successful.push(Accepted {
                    id: entry.item_id.clone(),
                    sink_id: Some(sink_id.clone()),
                });
                continue;
            }

            let sink_id = Uuid::new_v4().to_string();
            self.accepted.insert(entry.item_id.clone(), sink_id.clone());
            stored.push(entry.clone());
            response.successful.push(Accepted {
                id: entry.item_id.clone(),
                sink_id: Some(sink_id),
            });
        }
        Ok(response)
    }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    items: DashMap<(String, String), Map<String, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Map<String, Value>> {
        self.items
            .get(&(table.to_string(), key.to_string()))
            .map(|item| item.clone())
    }

    pub fn len(&self, table: &str) -> usize {
        self.items.iter().filter(|e| e.key().0 == table).count()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, table: &str, key: &str, item: Map<String, Value>) -> Result<()> {
        self.items
            .insert((table.to_string(), key.to_string()), item);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

#[derive(Default)]
pub struct MemoryContentStore {
    objects: DashMap<(String, String), StoredObject>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.clone())
    }

    /// Keys in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == bucket)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.object(bucket, key)
            .map(|o| o.body)
            .ok_or_else(|| PipelineError::NotFound(format!("{bucket}/{key}")))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

/// Content store rooted at a local directory; buckets are subdirectories.
pub struct FilesystemContentStore {
    root: PathBuf,
}

impl FilesystemContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        for part in [bucket, key] {
            let relative = Path::new(part);
            if part.is_empty()
                || !relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(PipelineError::InvalidPayload(format!(
                    "invalid object path: {bucket}/{key}"
                )));
            }
        }
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ContentStore for FilesystemContentStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::NotFound(format!("{bucket}/{key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await?;
        tracing::debug!(path = %path.display(), content_type, bytes = body.len(), "Stored object");
        Ok(())
    }
}

/// Bounded cache of generated content.
pub struct MemoryCache {
    cache: moka::sync::Cache<String, String>,
}

impl MemoryCache {
    pub fn new(capacity: u64, ttl: Option<Duration>) -> Self {
        let mut builder = moka::sync::Cache::builder().max_capacity(capacity);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cache.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySubscriberRegistry {
    subscribers: DashMap<String, Subscriber>,
}

impl MemorySubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriberRegistry for MemorySubscriberRegistry {
    /// Sorted by subscriber id.
    async fn list(&self) -> Result<Vec<Subscriber>> {
        let mut subscribers: Vec<Subscriber> =
            self.subscribers.iter().map(|s| s.value().clone()).collect();
        subscribers.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        Ok(subscribers)
    }

    async fn register(&self, subscriber: Subscriber) -> Result<()> {
        self.subscribers
            .insert(subscriber.subscriber_id.clone(), subscriber);
        Ok(())
    }

    async fn remove(&self, subscriber_id: &str) -> Result<()> {
        self.subscribers.remove(subscriber_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySearchIndex {
    documents: DashMap<(String, String), Value>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, index: &str, doc_id: &str) -> Option<Value> {
        self.documents
            .get(&(index.to_string(), doc_id.to_string()))
            .map(|d| d.clone())
    }

    pub fn len(&self, index: &str) -> usize {
        self.documents.iter().filter(|e| e.key().0 == index).count()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()> {
        self.documents
            .insert((index.to_string(), doc_id.to_string()), document.clone());
        Ok(())
    }
}

/// Records started executions instead of running them.
#[derive(Default)]
pub struct MemoryWorkflowStarter {
    /// execution name -> input
    executions: DashMap<String, String>,
}

impl MemoryWorkflowStarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.executions.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl WorkflowStarter for MemoryWorkflowStarter {
    async fn start(&self, execution_name: &str, input: &str) -> Result<Execution> {
        self.executions
            .insert(execution_name.to_string(), input.to_string());
        Ok(Execution {
            execution_id: format!("local:{execution_name}"),
            start_time: Utc::now(),
        })
    }
}
