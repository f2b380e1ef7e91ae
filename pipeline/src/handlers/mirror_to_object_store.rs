use super::Handler;
use crate::collaborators::ContentStore;
use crate::errors::{PipelineError, Result};
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use uuid::Uuid;

const ID_FIELDS: [&str; 4] = ["id", "Id", "messageId", "MessageId"];

/// A change captured from the key-value store.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeRecord {
    #[serde(default)]
    event_name: Option<String>,
    /// Item after the change; absent for removals.
    #[serde(default)]
    new_image: Option<Map<String, Value>>,
    #[serde(default)]
    keys: Option<Map<String, Value>>,
}

/// Mirrors key-value change records into the object store as JSON documents.
pub struct MirrorToObjectStore {
    store: Arc<dyn ContentStore>,
    bucket: Option<String>,
}

impl MirrorToObjectStore {
    pub fn new(store: Arc<dyn ContentStore>, bucket: Option<String>) -> Self {
        Self { store, bucket }
    }

    async fn mirror(&self, bucket: &str, body: &str) -> Result<String> {
        let change: ChangeRecord = serde_json::from_str(body)
            .map_err(|e| PipelineError::InvalidPayload(format!("not a change record: {e}")))?;

        let item = change
            .new_image
            .or_else(|| change.keys.clone())
            .unwrap_or_default();
        let item_id = id_from_item(&item)
            .or_else(|| change.keys.as_ref().and_then(id_from_keys))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let timestamp = Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string()
            .replace(':', "_");
        let key = format!("{item_id}_{timestamp}.json");

        let document = json!({"eventType": change.event_name, "item": item});
        self.store
            .put(
                bucket,
                &key,
                Bytes::from(serde_json::to_vec(&document)?),
                "application/json",
            )
            .await?;
        Ok(key)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_from_item(item: &Map<String, Value>) -> Option<String> {
    ID_FIELDS
        .iter()
        .find_map(|field| item.get(*field).and_then(scalar_text))
}

/// `pk-a_sk-2` for keys `{"pk": "a", "sk": 2}`.
fn id_from_keys(keys: &Map<String, Value>) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let parts: Vec<String> = keys
        .iter()
        .map(|(name, value)| {
            let value = scalar_text(value).unwrap_or_else(|| value.to_string());
            format!("{name}-{value}")
        })
        .collect();
    Some(parts.join("_"))
}

#[async_trait]
impl Handler for MirrorToObjectStore {
    fn name(&self) -> &'static str {
        "mirror_to_object_store"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let bucket = self
            .bucket
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("mirror bucket".into()))?;

        let mut failed = Vec::new();
        let mut objects = Vec::new();
        for record in &envelope.records {
            match self.mirror(bucket, &record.body).await {
                Ok(key) => {
                    tracing::info!(record_id = %record.id, bucket, key = %key, "Mirrored change");
                    objects.push(key);
                }
                Err(e) => {
                    tracing::error!(record_id = %record.id, error = %e, "Mirroring failed");
                    failed.push(record.id.clone());
                }
            }
        }

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"status": "ok", "objects": objects}),
        ))
    }
}
