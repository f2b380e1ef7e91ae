use super::{Handler, require};
use crate::batch::{BatchDispatcher, BatchSink, WorkItem};
use crate::envelope::ParsedBody;
use crate::errors::{PipelineError, Result};
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_MESSAGE: &str = "Hello from API";

/// Accepts client messages and places each one on the queue.
pub struct SubmitMessage {
    queue: Option<Arc<dyn BatchSink>>,
    dispatcher: BatchDispatcher,
}

impl SubmitMessage {
    pub fn new(queue: Option<Arc<dyn BatchSink>>, dispatcher: BatchDispatcher) -> Self {
        Self { queue, dispatcher }
    }
}

fn message_of(body: &str) -> Result<String> {
    match ParsedBody::parse(body) {
        ParsedBody::Json(Value::Object(mut map)) => Ok(match map.remove("message") {
            Some(Value::String(message)) => message,
            Some(Value::Null) | None => DEFAULT_MESSAGE.to_string(),
            Some(other) => other.to_string(),
        }),
        _ => Err(PipelineError::InvalidPayload(
            "request body must be a JSON object".into(),
        )),
    }
}

#[async_trait]
impl Handler for SubmitMessage {
    fn name(&self) -> &'static str {
        "submit_message"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let queue = require(&self.queue, "queue")?;
        if envelope.records.is_empty() {
            return Err(PipelineError::InvalidPayload("no message submitted".into()));
        }

        let mut items = Vec::with_capacity(envelope.records.len());
        let mut failed = Vec::new();
        for record in &envelope.records {
            match message_of(&record.body) {
                Ok(message) => items.push(WorkItem::new(record.id.clone(), message)),
                Err(e) => {
                    tracing::warn!(record_id = %record.id, error = %e, "Rejected message");
                    failed.push(record.id.clone());
                }
            }
        }

        let report = self.dispatcher.dispatch(items, queue).await?;
        failed.extend(report.persistent_failures.iter().map(|f| f.id.clone()));

        let message_ids: Vec<&str> = report
            .succeeded
            .iter()
            .map(|d| d.sink_id.as_deref().unwrap_or(d.item_id.as_str()))
            .collect();
        let success = match message_ids.as_slice() {
            [message_id] => json!({"messageId": message_id, "status": "Message sent"}),
            _ => json!({"messageIds": message_ids, "status": "Message sent"}),
        };

        Ok(InvocationResponse::from_failed_records(failed, success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DispatchConfig;
    use crate::invocation::InboundRecord;
    use crate::memory::MemoryQueue;

    fn handler(queue: Arc<MemoryQueue>) -> SubmitMessage {
        SubmitMessage::new(
            Some(queue),
            BatchDispatcher::new(DispatchConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_message_is_queued() {
        let queue = Arc::new(MemoryQueue::new("queue"));
        let response = handler(queue.clone())
            .handle(InvocationEnvelope {
                records: vec![InboundRecord::new("req-1", r#"{"message": "hola"}"#)],
            })
            .await
            .unwrap();

        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "hola");

        let body = match response {
            InvocationResponse::Completed(body) => body,
            other => panic!("expected success, got {other:?}"),
        };
        assert_eq!(body["status"], "Message sent");
        assert!(body["messageId"].is_string());
    }

    #[tokio::test]
    async fn test_default_message() {
        let queue = Arc::new(MemoryQueue::new("queue"));
        handler(queue.clone())
            .handle(InvocationEnvelope {
                records: vec![InboundRecord::new("req-1", "{}")],
            })
            .await
            .unwrap();
        assert_eq!(queue.entries()[0].payload, DEFAULT_MESSAGE);
    }

    #[tokio::test]
    async fn test_rejects_non_json_body() {
        let queue = Arc::new(MemoryQueue::new("queue"));
        let response = handler(queue.clone())
            .handle(InvocationEnvelope {
                records: vec![InboundRecord::new("req-1", "not json")],
            })
            .await
            .unwrap();
        assert_eq!(response.failed_records(), vec!["req-1"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_bad_record_does_not_block_the_rest() {
        let queue = Arc::new(MemoryQueue::new("queue"));
        let response = handler(queue.clone())
            .handle(InvocationEnvelope {
                records: vec![
                    InboundRecord::new("m1", r#"{"message": "ok"}"#),
                    InboundRecord::new("m2", "not json"),
                ],
            })
            .await
            .unwrap();

        assert_eq!(response.failed_records(), vec!["m2"]);
        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "ok");
    }
}
