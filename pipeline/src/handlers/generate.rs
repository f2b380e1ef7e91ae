use super::{Handler, require};
use crate::collaborators::{Cache, ContentStore, TextGenerator};
use crate::envelope::{Envelope, ObjectRef, normalize};
use crate::errors::{PipelineError, Result};
use crate::generation::{CacheAsideGenerator, Source, cache_key};
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct Answer {
    prompt: String,
    response: String,
    source: Source,
}

/// Asks the text generator about each mirrored message and broadcasts the answer.
pub struct Generate {
    content: Arc<dyn ContentStore>,
    generator: Option<Arc<dyn TextGenerator>>,
    cache_aside: Arc<CacheAsideGenerator>,
    cache: Arc<dyn Cache>,
    record_prompt_history: bool,
}

impl Generate {
    pub fn new(
        content: Arc<dyn ContentStore>,
        generator: Option<Arc<dyn TextGenerator>>,
        cache_aside: Arc<CacheAsideGenerator>,
        cache: Arc<dyn Cache>,
        record_prompt_history: bool,
    ) -> Self {
        Self {
            content,
            generator,
            cache_aside,
            cache,
            record_prompt_history,
        }
    }

    async fn answer(&self, generator: &dyn TextGenerator, object: &ObjectRef) -> Result<Answer> {
        let data = self.content.get(&object.bucket, &object.key).await?;
        let document: Value = serde_json::from_slice(&data)?;
        let message = document
            .get("item")
            .and_then(|item| item.get("Message"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if message.is_empty() {
            return Err(PipelineError::InvalidPayload(format!(
                "{}/{} has no message text",
                object.bucket, object.key
            )));
        }

        let prompt = format!("What's the meaning of '{message}'?");
        let key = cache_key(generator.model(), &prompt);
        let result = self
            .cache_aside
            .generate(&key, || generator.generate(&prompt))
            .await?;

        if self.record_prompt_history && result.source == Source::Generated {
            let history_key = format!("prompt:{}", Utc::now().to_rfc3339());
            if let Err(e) = self.cache.set(&history_key, &prompt).await {
                tracing::warn!(error = %e, "Failed to record prompt history");
            }
        }

        Ok(Answer {
            prompt,
            response: result.content,
            source: result.source,
        })
    }
}

#[async_trait]
impl Handler for Generate {
    fn name(&self) -> &'static str {
        "generate"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        let generator = require(&self.generator, "text generator")?;

        let mut failed = Vec::new();
        let mut results = Vec::new();
        for record in &envelope.records {
            let outcome = match normalize(&record.body) {
                Envelope::Object(object) => self.answer(generator.as_ref(), &object).await,
                _ => Err(PipelineError::InvalidPayload(
                    "record does not reference a stored object".into(),
                )),
            };
            match outcome {
                Ok(answer) => {
                    tracing::info!(record_id = %record.id, source = ?answer.source, "Generated answer");
                    results.push(answer);
                }
                Err(e) => {
                    tracing::error!(record_id = %record.id, error = %e, "Generation failed");
                    failed.push(record.id.clone());
                }
            }
        }

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({"results": results}),
        ))
    }
}
