use super::{Handler, require};
use crate::batch::{BatchDispatcher, BatchSink, WorkItem};
use crate::envelope::{Envelope, event_messages, normalize};
use crate::errors::Result;
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Fans the messages carried by bus events out onto the queue.
pub struct EventToQueue {
    queue: Option<Arc<dyn BatchSink>>,
    dispatcher: BatchDispatcher,
}

impl EventToQueue {
    pub fn new(queue: Option<Arc<dyn BatchSink>>, dispatcher: BatchDispatcher) -> Self {
        Self { queue, dispatcher }
    }
}

fn messages_of(body: &str) -> Result<Vec<Value>> {
    if let Some(messages) = event_messages(body) {
        return Ok(messages);
    }
    Ok(match normalize(body) {
        Envelope::Messages(messages) => messages,
        Envelope::Message(message) | Envelope::Raw(message) => vec![Value::String(message)],
        Envelope::Object(object) => vec![serde_json::to_value(object)?],
        Envelope::Document(document) => vec![document],
    })
}

#[async_trait]
impl Handler for EventToQueue {
    fn name(&self) -> &'static str {
        "event_to_queue"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let queue = require(&self.queue, "queue")?;

        let mut items = Vec::new();
        // item id -> record id
        let mut owners = HashMap::new();
        for record in &envelope.records {
            for (index, message) in messages_of(&record.body)?.iter().enumerate() {
                let item_id = format!("{}:{index}", record.id);
                items.push(WorkItem::from_json(item_id.clone(), message)?);
                owners.insert(item_id, record.id.as_str());
            }
        }

        let report = self.dispatcher.dispatch(items, queue).await?;
        let failed_records: HashSet<&str> = report
            .persistent_failures
            .iter()
            .filter_map(|f| owners.get(f.id.as_str()).copied())
            .collect();
        let failed = envelope
            .records
            .iter()
            .filter(|r| failed_records.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();

        tracing::info!(
            records = envelope.records.len(),
            batches = report.batches_sent,
            queued = report.succeeded.len(),
            "Fanned out events"
        );

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({
                "ok": true,
                "batchesSent": report.batches_sent,
                "queued": report.succeeded.len(),
            }),
        ))
    }
}
