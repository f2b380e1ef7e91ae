use super::{Handler, require};
use crate::collaborators::{Execution, WorkflowStarter};
use crate::envelope::parse_nested;
use crate::errors::Result;
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use crate::retry::RetryPolicy;
use crate::workflow::start_with_retry;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Starts one workflow execution per queued record.
pub struct QueueToWorkflow {
    starter: Option<Arc<dyn WorkflowStarter>>,
    retry: RetryPolicy,
}

impl QueueToWorkflow {
    pub fn new(starter: Option<Arc<dyn WorkflowStarter>>, retry: RetryPolicy) -> Self {
        Self { starter, retry }
    }
}

#[async_trait]
impl Handler for QueueToWorkflow {
    fn name(&self) -> &'static str {
        "queue_to_workflow"
    }

    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse> {
        if envelope.records.is_empty() {
            tracing::info!("No records, nothing to start");
            return Ok(InvocationResponse::Completed(json!({"ok": true, "count": 0})));
        }
        let starter = require(&self.starter, "workflow state machine")?;

        let mut failed = Vec::new();
        let mut executions: Vec<Execution> = Vec::new();
        for record in &envelope.records {
            let input = json!({
                "messageId": record.id,
                "body": parse_nested(&record.body),
            })
            .to_string();

            match start_with_retry(starter.as_ref(), &self.retry, &input).await {
                Ok(execution) => {
                    tracing::info!(
                        record_id = %record.id,
                        execution_id = %execution.execution_id,
                        "Workflow started"
                    );
                    executions.push(execution);
                }
                Err(e) => {
                    tracing::error!(record_id = %record.id, error = %e, "Could not start workflow");
                    failed.push(record.id.clone());
                }
            }
        }

        Ok(InvocationResponse::from_failed_records(
            failed,
            json!({
                "ok": true,
                "count": envelope.records.len(),
                "executions": executions,
            }),
        ))
    }
}
