use super::{Handler, require};
use crate::collaborators::{ContentStore, SearchIndex};
use crate::envelope::{Envelope, ObjectRef, ParsedBody, normalize};
use crate::errors::{PipelineError, Result};
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use url::form_urlencoded;

const SENDER_FIELDS: [&str; 4] = ["from", "senderId", "source", "user"];

/// Indexes stored objects into the search engine.
pub struct IndexDocument {
    content: Arc<dyn ContentStore>,
    search: Option<Arc<dyn SearchIndex>>,
    index: Option<String>,
}

impl IndexDocument {
    pub fn new(
        content: Arc<dyn ContentStore>,
        search: Option<Arc<dyn SearchIndex>>,
        index: Option<String>,
    ) -> Self {
        Self {
            content,
            search,
            index,
        }
    }

    async fn index_object(
        &self,
        search: &dyn SearchIndex,
        index: &str,
        object: &ObjectRef,
    ) -> Result<String> {
        let data = self.content.get(&object.bucket, &object.key).await?;
        let text = String::from_utf8_lossy(&data);
        let document = Value::Object(prepare_document(&text));

        // The object key is the document id, so reindexing an object overwrites it
        let doc_id: String = form_urlencoded::byte_serialize(object.key.as_bytes()).collect();
        search.put_document(index, &doc_id, &document).await?;
        Ok(doc_id)
    }
}

/// JSON objects are indexed as-is, anything else as `{"message": text}`. Fills `sender` and
/// `@timestamp` when missing.
fn prepare_document(text: &str) -> Map<String, Value> {
    let mut document = match ParsedBody::parse(text) {
        ParsedBody::Json(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("message".into(), Value::String(text.to_string()));
            map
        }
    };

    if !document.contains_key("sender")
        && let Some(sender) = SENDER_FIELDS.iter().find_map(|f| document.get(*f))
    {
        let sender = sender.clone();
        document.insert("sender".into(), sender);
    }
    if !document.contains_key("@timestamp") {
        document.insert(
            "@timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
    document
}

#[async_trait]
impl Handler for IndexDocument {
    fn name(&self) -> &'static str {
        "index_document"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let search = require(&self.search, "search index")?;
        let index = self
            .index
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("search index".into()))?;

        let mut failed = Vec::new();
        let mut indexed = Vec::new();
        for record in &envelope.records {
            let outcome = match normalize(&record.body) {
                Envelope::Object(object) => self.index_object(search.as_ref(), index, &object).await,
                _ => Err(PipelineError::InvalidPayload(
                    "record does not reference a stored object".into(),
                )),
            };
            match outcome {
                Ok(doc_id) => indexed.push(doc_id),
                Err(e) => {
                    tracing::error!(record_id = %record.id, index, error = %e, "Indexing failed");
                    failed.push(record.id.clone());
                }
            }
        }

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"status": "ok", "indexed": indexed}),
        ))
    }
}
