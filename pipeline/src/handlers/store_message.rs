use super::Handler;
use crate::collaborators::KeyValueStore;
use crate::envelope::{Envelope, normalize};
use crate::errors::Result;
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

const DEFAULT_MESSAGE: &str = "Message without content";

/// Persists the message carried by each bus event, keyed by record id.
pub struct StoreMessage {
    store: Arc<dyn KeyValueStore>,
    table: String,
}

impl StoreMessage {
    pub fn new(store: Arc<dyn KeyValueStore>, table: String) -> Self {
        Self { store, table }
    }
}

fn message_of(body: &str) -> String {
    match normalize(body) {
        Envelope::Message(message) | Envelope::Raw(message) => message,
        _ => DEFAULT_MESSAGE.to_string(),
    }
}

#[async_trait]
impl Handler for StoreMessage {
    fn name(&self) -> &'static str {
        "store_message"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let mut failed = Vec::new();
        for record in &envelope.records {
            let mut item = Map::new();
            item.insert("MessageId".into(), Value::String(record.id.clone()));
            item.insert("Message".into(), Value::String(message_of(&record.body)));

            // Keyed by record id, so a redelivered record overwrites instead of duplicating
            if let Err(e) = self.store.put(&self.table, &record.id, item).await {
                tracing::error!(record_id = %record.id, table = %self.table, error = %e, "Store failed");
                failed.push(record.id.clone());
            }
        }

        let stored = envelope.records.len() - failed.len();
        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"status": "Message stored", "stored": stored}),
        ))
    }
}
