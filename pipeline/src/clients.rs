use crate::batch::BatchSink;
use crate::collaborators::{
    Broadcaster, Cache, ContentStore, KeyValueStore, SearchIndex, SubscriberRegistry,
    TextGenerator, WorkflowStarter,
};
use crate::config::{Backend, Config, ContentStoreConfig};
use crate::errors::Result;
use crate::memory::{
    FilesystemContentStore, MemoryCache, MemoryContentStore, MemoryKeyValueStore, MemoryQueue,
    MemorySearchIndex, MemorySubscriberRegistry, MemoryWorkflowStarter,
};
use crate::remote::{
    HttpBatchSink, HttpSearchIndex, HttpTextGenerator, HttpWorkflowStarter, WebhookBroadcaster,
    http_client,
};
use std::sync::Arc;
use std::time::Duration;

/// Collaborator clients shared by every handler.
///
/// Destinations left out of the configuration stay `None`; the handlers that need them fail
/// with a configuration error instead of processing anything.
#[derive(Clone)]
pub struct Clients {
    pub queue: Option<Arc<dyn BatchSink>>,
    pub bus: Option<Arc<dyn BatchSink>>,
    pub workflow: Option<Arc<dyn WorkflowStarter>>,
    pub key_value: Arc<dyn KeyValueStore>,
    pub content: Arc<dyn ContentStore>,
    pub search: Option<Arc<dyn SearchIndex>>,
    pub generator: Option<Arc<dyn TextGenerator>>,
    pub cache: Arc<dyn Cache>,
    pub subscribers: Arc<dyn SubscriberRegistry>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl Clients {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http_client(Duration::from_secs(config.request_timeout_secs))?;

        let sink = |name: &'static str, backend: &Backend| -> Arc<dyn BatchSink> {
            match backend {
                Backend::Memory => Arc::new(MemoryQueue::new(name)),
                Backend::Http { url } => {
                    Arc::new(HttpBatchSink::new(name, client.clone(), url.clone()))
                }
            }
        };

        let workflow = config.workflow.as_ref().map(|w| -> Arc<dyn WorkflowStarter> {
            match &w.backend {
                Backend::Memory => Arc::new(MemoryWorkflowStarter::new()),
                Backend::Http { url } => Arc::new(HttpWorkflowStarter::new(
                    client.clone(),
                    url.clone(),
                    w.state_machine.clone(),
                )),
            }
        });

        let content: Arc<dyn ContentStore> = match &config.storage.content_store {
            ContentStoreConfig::Memory => Arc::new(MemoryContentStore::new()),
            ContentStoreConfig::Filesystem { path } => {
                Arc::new(FilesystemContentStore::new(path.as_str()))
            }
        };

        let search = config.search.as_ref().map(|s| -> Arc<dyn SearchIndex> {
            match &s.backend {
                Backend::Memory => Arc::new(MemorySearchIndex::new()),
                Backend::Http { url } => Arc::new(HttpSearchIndex::new(
                    client.clone(),
                    url.clone(),
                    s.auth.clone(),
                )),
            }
        });

        let generator = config
            .generation
            .generator
            .as_ref()
            .map(|g| -> Arc<dyn TextGenerator> {
                Arc::new(HttpTextGenerator::new(
                    client.clone(),
                    g.url.clone(),
                    g.model.clone(),
                ))
            });

        let cache = MemoryCache::new(
            config.generation.cache_capacity,
            config.generation.cache_ttl_secs.map(Duration::from_secs),
        );

        Ok(Clients {
            queue: config.queue.as_ref().map(|b| sink("queue", b)),
            bus: config.bus.as_ref().map(|b| sink("bus", &b.backend)),
            workflow,
            key_value: Arc::new(MemoryKeyValueStore::new()),
            content,
            search,
            generator,
            cache: Arc::new(cache),
            subscribers: Arc::new(MemorySubscriberRegistry::new()),
            broadcaster: Arc::new(WebhookBroadcaster::new(client.clone())),
        })
    }
}
