//! Request handlers, one per pipeline stage.
//!
//! ```text
//! submit_message ──▶ queue ──▶ queue_to_bus ──▶ bus ──▶ store_message ──▶ key-value store
//! event_to_queue ──▶ queue ──▶ queue_to_workflow ──▶ workflow
//! change stream ──▶ mirror_to_object_store ──▶ object store ──▶ generate / index_document
//! ```

mod event_to_queue;
mod generate;
mod index_document;
mod mirror_to_object_store;
mod queue_to_bus;
mod queue_to_workflow;
mod store_message;
mod submit_message;
mod subscribers;

pub use event_to_queue::EventToQueue;
pub use generate::Generate;
pub use index_document::IndexDocument;
pub use mirror_to_object_store::MirrorToObjectStore;
pub use queue_to_bus::QueueToBus;
pub use queue_to_workflow::QueueToWorkflow;
pub use store_message::StoreMessage;
pub use submit_message::SubmitMessage;
pub use subscribers::{Subscribe, Unsubscribe};

use crate::batch::BatchDispatcher;
use crate::clients::Clients;
use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::generation::CacheAsideGenerator;
use crate::invocation::{InvocationEnvelope, InvocationResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// One independently addressable pipeline stage.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Processes every record of `envelope`.
    ///
    /// Record-level failures are reported in the response so only those records are
    /// redelivered. An error fails the whole invocation.
    async fn handle(&self, envelope: InvocationEnvelope) -> Result<InvocationResponse>;
}

/// Handlers addressable by name.
pub struct Handlers {
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self {
            handlers: handlers.into_iter().map(|h| (h.name(), h)).collect(),
        }
    }

    /// Every stage wired to the configured collaborators.
    pub fn from_config(config: &Config, clients: &Clients) -> Self {
        let dispatcher = BatchDispatcher::new(config.dispatch);
        let generator = Arc::new(
            CacheAsideGenerator::new(
                clients.cache.clone(),
                clients.subscribers.clone(),
                clients.broadcaster.clone(),
            )
            .with_broadcast_cache_hits(config.generation.broadcast_cache_hits),
        );
        let search_index = config.search.as_ref().map(|s| s.index.clone());

        Self::new(vec![
            Arc::new(SubmitMessage::new(clients.queue.clone(), dispatcher.clone())),
            Arc::new(EventToQueue::new(clients.queue.clone(), dispatcher.clone())),
            Arc::new(QueueToBus::new(
                clients.bus.clone(),
                config.bus.clone(),
                dispatcher,
            )),
            Arc::new(QueueToWorkflow::new(
                clients.workflow.clone(),
                config.workflow.as_ref().map(|w| w.retry).unwrap_or_default(),
            )),
            Arc::new(StoreMessage::new(
                clients.key_value.clone(),
                config.storage.messages_table.clone(),
            )),
            Arc::new(MirrorToObjectStore::new(
                clients.content.clone(),
                config.storage.mirror_bucket.clone(),
            )),
            Arc::new(Generate::new(
                clients.content.clone(),
                clients.generator.clone(),
                generator,
                clients.cache.clone(),
                config.generation.record_prompt_history,
            )),
            Arc::new(IndexDocument::new(
                clients.content.clone(),
                clients.search.clone(),
                search_index,
            )),
            Arc::new(Subscribe::new(clients.subscribers.clone())),
            Arc::new(Unsubscribe::new(clients.subscribers.clone())),
        ])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort();
        names
    }
}

/// Resolves a destination that must be configured for `handler` to run.
fn require<T: ?Sized>(destination: &Option<Arc<T>>, what: &str) -> Result<Arc<T>> {
    destination
        .clone()
        .ok_or_else(|| PipelineError::Configuration(what.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_stage_is_registered() {
        let config: Config = serde_yaml::from_str(
            r#"
listener: {host: "0.0.0.0", port: 3000}
admin_listener: {host: "127.0.0.1", port: 3001}
"#,
        )
        .unwrap();
        let clients = Clients::from_config(&config).unwrap();
        let handlers = Handlers::from_config(&config, &clients);

        assert_eq!(
            handlers.names(),
            vec![
                "event_to_queue",
                "generate",
                "index_document",
                "mirror_to_object_store",
                "queue_to_bus",
                "queue_to_workflow",
                "store_message",
                "submit_message",
                "subscribe",
                "unsubscribe",
            ]
        );
        assert!(handlers.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_destination_fails_invocation() {
        let config: Config = serde_yaml::from_str(
            r#"
listener: {host: "0.0.0.0", port: 3000}
admin_listener: {host: "127.0.0.1", port: 3001}
"#,
        )
        .unwrap();
        let clients = Clients::from_config(&config).unwrap();
        let handlers = Handlers::from_config(&config, &clients);

        let envelope: InvocationEnvelope =
            serde_json::from_str(r#"{"records": [{"id": "m1", "body": "{\"message\": \"hi\"}"}]}"#)
                .unwrap();
        let result = handlers
            .get("submit_message")
            .unwrap()
            .handle(envelope)
            .await;
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
