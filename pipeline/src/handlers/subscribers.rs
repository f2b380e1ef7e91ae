use super::Handler;
use crate::collaborators::{Subscriber, SubscriberRegistry};
use crate::envelope::ParsedBody;
use crate::errors::{PipelineError, Result};
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use url::Url;

/// Accepts either a bare URL or `{"endpoint": "<url>"}`.
fn endpoint_of(body: &str) -> Result<String> {
    let candidate = match ParsedBody::parse(body) {
        ParsedBody::Json(value) => value
            .get("endpoint")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::InvalidPayload("missing endpoint".into()))?,
        ParsedBody::Raw(text) => text.trim().to_string(),
    };
    Url::parse(&candidate)
        .map_err(|e| PipelineError::InvalidPayload(format!("invalid endpoint {candidate:?}: {e}")))?;
    Ok(candidate)
}

/// Registers the sender of each record as a notification subscriber.
pub struct Subscribe {
    registry: Arc<dyn SubscriberRegistry>,
}

impl Subscribe {
    pub fn new(registry: Arc<dyn SubscriberRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for Subscribe {
    fn name(&self) -> &'static str {
        "subscribe"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let mut failed = Vec::new();
        let mut registered = Vec::new();
        for record in &envelope.records {
            let outcome = match endpoint_of(&record.body) {
                Ok(endpoint) => {
                    self.registry
                        .register(Subscriber {
                            subscriber_id: record.id.clone(),
                            endpoint,
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => registered.push(record.id.clone()),
                Err(e) => {
                    tracing::warn!(subscriber_id = %record.id, error = %e, "Subscription rejected");
                    failed.push(record.id.clone());
                }
            }
        }

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"status": "subscribed", "subscribers": registered}),
        ))
    }
}

/// Removes the subscriber named by each record id.
pub struct Unsubscribe {
    registry: Arc<dyn SubscriberRegistry>,
}

impl Unsubscribe {
    pub fn new(registry: Arc<dyn SubscriberRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for Unsubscribe {
    fn name(&self) -> &'static str {
        "unsubscribe"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let mut failed = Vec::new();
        for record in &envelope.records {
            if let Err(e) = self.registry.remove(&record.id).await {
                tracing::error!(subscriber_id = %record.id, error = %e, "Unsubscribe failed");
                failed.push(record.id.clone());
            }
        }

        let removed = envelope.records.len() - failed.len();
        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"status": "unsubscribed", "removed": removed}),
        ))
    }
}
