//! Narrow interfaces to the managed services the handlers talk to.
//!
//! Implementations live in [`crate::memory`] (in-process) and [`crate::remote`] (HTTP).

use crate::errors::{DeliveryError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A started workflow execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
}

#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    /// Starts one execution. `execution_name` must be unique per call.
    async fn start(&self, execution_name: &str, input: &str) -> Result<Execution>;
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub subscriber_id: String,
    /// Where notifications for this subscriber are delivered.
    pub endpoint: String,
}

#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<Subscriber>>;
    async fn register(&self, subscriber: Subscriber) -> Result<()>;
    async fn remove(&self, subscriber_id: &str) -> Result<()>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn deliver(
        &self,
        subscriber: &Subscriber,
        notification: &Value,
    ) -> std::result::Result<(), DeliveryError>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;
    async fn put(&self, bucket: &str, key: &str, body: Bytes, content_type: &str) -> Result<()>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes `item` under `key`, replacing any previous item.
    async fn put(&self, table: &str, key: &str, item: Map<String, Value>) -> Result<()>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Indexes `document` under `doc_id`; indexing the same id twice overwrites.
    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Model identifier, part of the cache key.
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}
