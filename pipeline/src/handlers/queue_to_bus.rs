use super::{Handler, require};
use crate::batch::{BatchDispatcher, BatchSink, WorkItem};
use crate::config::BusConfig;
use crate::envelope::ParsedBody;
use crate::errors::{PipelineError, Result};
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Publishes every queued record to the event bus, one event per record.
pub struct QueueToBus {
    bus: Option<Arc<dyn BatchSink>>,
    config: Option<BusConfig>,
    dispatcher: BatchDispatcher,
}

impl QueueToBus {
    pub fn new(
        bus: Option<Arc<dyn BatchSink>>,
        config: Option<BusConfig>,
        dispatcher: BatchDispatcher,
    ) -> Self {
        Self {
            bus,
            config,
            dispatcher,
        }
    }
}

#[async_trait]
impl Handler for QueueToBus {
    fn name(&self) -> &'static str {
        "queue_to_bus"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let bus = require(&self.bus, "bus")?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("bus".into()))?;

        let mut items = Vec::with_capacity(envelope.records.len());
        for record in &envelope.records {
            let detail = match ParsedBody::parse(&record.body) {
                ParsedBody::Json(value) => value,
                ParsedBody::Raw(text) => {
                    tracing::debug!(record_id = %record.id, "Publishing plain text body");
                    json!({"message": text})
                }
            };
            let event = json!({
                "source": config.source,
                "detailType": config.detail_type,
                "detail": detail,
            });
            items.push(WorkItem::new(record.id.clone(), event.to_string()));
        }

        let report = self.dispatcher.dispatch(items, bus).await?;
        let failed = report
            .persistent_failures
            .iter()
            .map(|f| f.id.clone())
            .collect();

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"status": "done", "published": report.succeeded.len()}),
        ))
    }
}
