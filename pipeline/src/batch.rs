//! Batched dispatch with per-item failure tracking.
//!
//! A dispatch call partitions its items into batches of at most `max_batch_size`, submits each
//! batch to a [`BatchSink`] and resubmits only the items the sink rejected. Resubmission follows
//! the same linear backoff as [`crate::retry::submit_with_retry`]: retry round `n` waits
//! `n * backoff_base` and runs while `n <= max_retries`. Items that still fail after the last
//! round are reported as persistent failures so the invoker can redeliver exactly those.
//!
//! ```text
//! items ──partition──▶ [b0] [b1] [b2]
//!                        │
//!                 round 0: submit all ──▶ ok: a,b,c   failed: d
//!                 round 1: submit d   ──▶ ok: d
//! ```

use crate::errors::{PipelineError, Result};
use crate::metrics_defs::{DISPATCH_BATCHES, DISPATCH_PERSISTENT_FAILURES, DISPATCH_RETRY_ROUNDS};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Largest batch any supported sink accepts in one round-trip.
pub const MAX_BATCH_SIZE: usize = 10;

/// One unit of outbound work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    /// Caller-assigned identifier, unique within a dispatch call.
    pub item_id: String,
    /// Serialized body handed to the sink as-is.
    pub payload: String,
}

impl WorkItem {
    pub fn new(item_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            payload: payload.into(),
        }
    }

    /// Builds an item whose payload is `value` rendered as JSON. Strings are sent verbatim.
    pub fn from_json(item_id: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        let payload = match value {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        Ok(Self::new(item_id, payload))
    }
}

/// An entry the sink accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub id: String,
    /// Identifier assigned by the sink, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_id: Option<String>,
}

/// An entry the sink rejected, or an item that exhausted its retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// Per-entry result of one `submit_batch` round-trip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub successful: Vec<Accepted>,
    #[serde(default)]
    pub failed: Vec<ItemFailure>,
}

/// Downstream that accepts up to [`MAX_BATCH_SIZE`] entries per call.
#[async_trait]
pub trait BatchSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submits `entries` in one round-trip.
    ///
    /// Returning an error means nothing is known about the entries; the dispatcher treats all of
    /// them as failed for this round, or as failed for good when the error is not retryable.
    async fn submit_batch(&self, entries: &[WorkItem]) -> Result<BatchResponse>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded { sink_id: Option<String> },
    /// Retryable while rounds remain.
    Failed { reason: String },
    PermanentlyFailed { reason: String },
}

impl DispatchOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivered {
    pub item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Batches formed from the input. Retry rounds are not counted.
    pub batches_sent: usize,
    pub succeeded: Vec<Delivered>,
    pub persistent_failures: Vec<ItemFailure>,
}

impl DispatchReport {
    pub fn succeeded_ids(&self) -> impl Iterator<Item = &str> {
        self.succeeded.iter().map(|d| d.item_id.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.persistent_failures.is_empty()
    }

    fn record(&mut self, item_id: String, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Succeeded { sink_id } => {
                self.succeeded.push(Delivered { item_id, sink_id })
            }
            DispatchOutcome::Failed { reason } | DispatchOutcome::PermanentlyFailed { reason } => {
                self.persistent_failures.push(ItemFailure {
                    id: item_id,
                    reason,
                })
            }
        }
    }
}

fn default_max_batch_size() -> usize {
    MAX_BATCH_SIZE
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(flatten)]
    pub retry: RetryPolicy,
    /// Submit independent batches concurrently instead of one after the other.
    #[serde(default)]
    pub parallel_batches: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            retry: RetryPolicy::default(),
            parallel_batches: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchDispatcher {
    config: DispatchConfig,
}

impl BatchDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        let max_batch_size = config.max_batch_size.clamp(1, MAX_BATCH_SIZE);
        Self {
            config: DispatchConfig {
                max_batch_size,
                ..config
            },
        }
    }

    /// Dispatches `items` to `sink` and reports the terminal outcome of every item.
    ///
    /// Fails only when the input violates the id uniqueness precondition; sink failures are
    /// reported per item in the returned report.
    pub async fn dispatch(
        &self,
        items: Vec<WorkItem>,
        sink: Arc<dyn BatchSink>,
    ) -> Result<DispatchReport> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(item.item_id.as_str()) {
                return Err(PipelineError::InvalidPayload(format!(
                    "duplicate item id {}",
                    item.item_id
                )));
            }
        }

        let batches = partition(items, self.config.max_batch_size);
        let mut report = DispatchReport {
            batches_sent: batches.len(),
            ..Default::default()
        };
        counter!(DISPATCH_BATCHES, "sink" => sink.name()).increment(batches.len() as u64);
        tracing::debug!(sink = sink.name(), batches = batches.len(), "Dispatching");

        if self.config.parallel_batches && batches.len() > 1 {
            self.dispatch_parallel(batches, sink.clone(), &mut report).await;
        } else {
            for batch in batches {
                for (item_id, outcome) in
                    dispatch_batch(sink.as_ref(), batch, &self.config.retry).await
                {
                    report.record(item_id, outcome);
                }
            }
        }

        if !report.persistent_failures.is_empty() {
            counter!(DISPATCH_PERSISTENT_FAILURES, "sink" => sink.name())
                .increment(report.persistent_failures.len() as u64);
            tracing::warn!(
                sink = sink.name(),
                failed = report.persistent_failures.len(),
                succeeded = report.succeeded.len(),
                "Items failed after exhausting retries"
            );
        }

        Ok(report)
    }

    async fn dispatch_parallel(
        &self,
        batches: Vec<Vec<WorkItem>>,
        sink: Arc<dyn BatchSink>,
        report: &mut DispatchReport,
    ) {
        let mut join_set = JoinSet::new();
        // Tracks which items each task owns, so a task that dies still reports them
        let mut task_items: HashMap<tokio::task::Id, Vec<String>> = HashMap::new();

        for batch in batches {
            let ids = batch.iter().map(|item| item.item_id.clone()).collect();
            let sink = sink.clone();
            let policy = self.config.retry;
            let handle =
                join_set.spawn(async move { dispatch_batch(sink.as_ref(), batch, &policy).await });
            task_items.insert(handle.id(), ids);
        }

        while let Some(result) = join_set.join_next_with_id().await {
            match result {
                Ok((task_id, outcomes)) => {
                    task_items.remove(&task_id);
                    for (item_id, outcome) in outcomes {
                        report.record(item_id, outcome);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Batch task failed");
                    for item_id in task_items.remove(&e.id()).unwrap_or_default() {
                        report.record(
                            item_id,
                            DispatchOutcome::PermanentlyFailed {
                                reason: format!("dispatch task failed: {e}"),
                            },
                        );
                    }
                }
            }
        }
    }
}

fn partition(items: Vec<WorkItem>, size: usize) -> Vec<Vec<WorkItem>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Runs one batch through its retry rounds and returns a terminal outcome per item.
async fn dispatch_batch(
    sink: &dyn BatchSink,
    batch: Vec<WorkItem>,
    policy: &RetryPolicy,
) -> Vec<(String, DispatchOutcome)> {
    let mut terminal = Vec::with_capacity(batch.len());
    let mut pending = batch;
    let mut attempt = 0;

    loop {
        let mut still_failed = Vec::new();
        for (item, outcome) in submit_round(sink, pending).await {
            match outcome {
                DispatchOutcome::Failed { reason } => still_failed.push((item, reason)),
                outcome => terminal.push((item.item_id, outcome)),
            }
        }

        if still_failed.is_empty() {
            break;
        }

        attempt += 1;
        if attempt > policy.max_retries {
            terminal.extend(still_failed.into_iter().map(|(item, reason)| {
                (item.item_id, DispatchOutcome::PermanentlyFailed { reason })
            }));
            break;
        }

        tracing::debug!(
            sink = sink.name(),
            attempt,
            failed = still_failed.len(),
            "Retrying failed subset"
        );
        counter!(DISPATCH_RETRY_ROUNDS, "sink" => sink.name()).increment(1);
        sleep(policy.backoff(attempt)).await;
        pending = still_failed.into_iter().map(|(item, _)| item).collect();
    }

    terminal
}

/// Submits `pending` once and classifies every entry.
async fn submit_round(
    sink: &dyn BatchSink,
    pending: Vec<WorkItem>,
) -> Vec<(WorkItem, DispatchOutcome)> {
    let response = match sink.submit_batch(&pending).await {
        Ok(response) => response,
        Err(e) => {
            let reason = e.to_string();
            let retryable = e.is_retryable();
            tracing::warn!(
                sink = sink.name(),
                entries = pending.len(),
                retryable,
                error = %reason,
                "Batch submission failed"
            );
            return pending
                .into_iter()
                .map(|item| {
                    let reason = reason.clone();
                    let outcome = if retryable {
                        DispatchOutcome::Failed { reason }
                    } else {
                        DispatchOutcome::PermanentlyFailed { reason }
                    };
                    (item, outcome)
                })
                .collect();
        }
    };

    let mut accepted: HashMap<String, Option<String>> = response
        .successful
        .into_iter()
        .map(|a| (a.id, a.sink_id))
        .collect();
    let mut rejected: HashMap<String, String> = response
        .failed
        .into_iter()
        .map(|f| (f.id, f.reason))
        .collect();

    let outcomes = pending
        .into_iter()
        .map(|item| {
            let outcome = if let Some(sink_id) = accepted.remove(&item.item_id) {
                rejected.remove(&item.item_id);
                DispatchOutcome::Succeeded { sink_id }
            } else if let Some(reason) = rejected.remove(&item.item_id) {
                DispatchOutcome::Failed { reason }
            } else {
                DispatchOutcome::Failed {
                    reason: "missing from sink response".to_string(),
                }
            };
            (item, outcome)
        })
        .collect();

    let unknown = accepted.len() + rejected.len();
    if unknown > 0 {
        tracing::warn!(sink = sink.name(), unknown, "Sink reported ids that were not submitted");
    }

    outcomes
}
