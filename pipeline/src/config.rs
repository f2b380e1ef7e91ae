use crate::batch::{DispatchConfig, MAX_BATCH_SIZE};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("max_batch_size must be between 1 and {MAX_BATCH_SIZE}, got {0}")]
    InvalidBatchSize(usize),

    #[error("Empty {0} name")]
    EmptyName(&'static str),

    #[error("Cache capacity cannot be 0")]
    InvalidCacheCapacity,

    #[error("Request timeout cannot be 0")]
    InvalidTimeout,
}

/// Pipeline configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for handler invocations
    pub listener: Listener,
    /// Admin listener for health and readiness checks
    pub admin_listener: Listener,
    /// Timeout applied to every outbound HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Queue fed by `submit_message` and `event_to_queue`
    #[serde(default)]
    pub queue: Option<Backend>,
    /// Event bus fed by `queue_to_bus`
    #[serde(default)]
    pub bus: Option<BusConfig>,
    #[serde(default)]
    pub workflow: Option<WorkflowConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub search: Option<SearchConfig>,
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        let batch_size = self.dispatch.max_batch_size;
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(ValidationError::InvalidBatchSize(batch_size));
        }

        if let Some(bus) = &self.bus
            && (bus.source.is_empty() || bus.detail_type.is_empty())
        {
            return Err(ValidationError::EmptyName("bus source"));
        }

        if let Some(workflow) = &self.workflow
            && workflow.state_machine.is_empty()
        {
            return Err(ValidationError::EmptyName("state machine"));
        }

        self.storage.validate()?;
        self.generation.validate()?;

        if let Some(search) = &self.search
            && search.index.is_empty()
        {
            return Err(ValidationError::EmptyName("search index"));
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Where a collaborator lives. `memory` keeps everything in-process.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum Backend {
    Memory,
    Http { url: Url },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BusConfig {
    #[serde(flatten)]
    pub backend: Backend,
    /// Source stamped on every published event
    #[serde(default = "default_bus_source")]
    pub source: String,
    #[serde(default = "default_detail_type")]
    pub detail_type: String,
}

fn default_bus_source() -> String {
    "fanline".into()
}

fn default_detail_type() -> String {
    "PlainText".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    #[serde(flatten)]
    pub backend: Backend,
    pub state_machine: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ContentStoreConfig {
    #[default]
    Memory,
    Filesystem {
        path: String,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_messages_table")]
    pub messages_table: String,
    /// Bucket receiving mirrored change records
    #[serde(default)]
    pub mirror_bucket: Option<String>,
    #[serde(default)]
    pub content_store: ContentStoreConfig,
}

fn default_messages_table() -> String {
    "messages".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            messages_table: default_messages_table(),
            mirror_bucket: None,
            content_store: ContentStoreConfig::default(),
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.messages_table.is_empty() {
            return Err(ValidationError::EmptyName("messages table"));
        }
        if self.mirror_bucket.as_deref() == Some("") {
            return Err(ValidationError::EmptyName("mirror bucket"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GeneratorConfig {
    pub url: Url,
    pub model: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Entries never expire when unset
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Replay cached results to current subscribers
    #[serde(default = "default_true")]
    pub broadcast_cache_hits: bool,
    /// Keep every generated prompt under `prompt:<timestamp>` in the cache
    #[serde(default = "default_true")]
    pub record_prompt_history: bool,
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            generator: None,
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: None,
            broadcast_cache_hits: true,
            record_prompt_history: true,
        }
    }
}

impl GenerationConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.cache_capacity == 0 {
            return Err(ValidationError::InvalidCacheCapacity);
        }
        if let Some(generator) = &self.generator
            && generator.model.is_empty()
        {
            return Err(ValidationError::EmptyName("model"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SearchConfig {
    #[serde(flatten)]
    pub backend: Backend,
    #[serde(default = "default_search_index")]
    pub index: String,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
}

fn default_search_index() -> String {
    "messages".into()
}
