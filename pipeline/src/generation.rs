//! Cache-aside generation with best-effort broadcast.
//!
//! Per request key the flow is `NotCached -> Generating -> Cached`. There is no lock around the
//! `Generating` state: two concurrent misses on the same key both call the generator and the
//! cache keeps whichever write lands last.

use crate::collaborators::{Broadcaster, Cache, Subscriber, SubscriberRegistry};
use crate::errors::{DeliveryError, Result};
use crate::metrics_defs::{
    BROADCAST_FAILURES, GENERATION_CACHE_HIT, GENERATION_CACHE_MISS, SUBSCRIBERS_PRUNED,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::counter;
use std::future::Future;
use std::sync::Arc;

/// Deterministic cache key for a generation request (hash of model + prompt).
pub fn cache_key(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Generated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub content: String,
    pub source: Source,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Notification<'a> {
    request_key: &'a str,
    content: &'a str,
    source: Source,
}

pub struct CacheAsideGenerator {
    cache: Arc<dyn Cache>,
    registry: Arc<dyn SubscriberRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    broadcast_cache_hits: bool,
}

impl CacheAsideGenerator {
    pub fn new(
        cache: Arc<dyn Cache>,
        registry: Arc<dyn SubscriberRegistry>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            cache,
            registry,
            broadcaster,
            broadcast_cache_hits: true,
        }
    }

    /// Whether cached results are replayed to current subscribers.
    pub fn with_broadcast_cache_hits(mut self, enabled: bool) -> Self {
        self.broadcast_cache_hits = enabled;
        self
    }

    /// Returns the cached result for `request_key`, or calls `generate` once and caches its output.
    ///
    /// Errors from `generate` are returned as-is and nothing is cached. Cache and broadcast
    /// failures are logged and never fail the call.
    pub async fn generate<F, Fut>(&self, request_key: &str, generate: F) -> Result<GenerationResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let cached = match self.cache.get(request_key).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(request_key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        };

        if let Some(content) = cached {
            counter!(GENERATION_CACHE_HIT).increment(1);
            tracing::debug!(request_key, "Cache hit");
            let result = GenerationResult {
                content,
                source: Source::Cache,
            };
            if self.broadcast_cache_hits {
                self.broadcast(request_key, &result).await;
            }
            return Ok(result);
        }

        counter!(GENERATION_CACHE_MISS).increment(1);
        tracing::debug!(request_key, "Cache miss, generating");
        let content = generate().await?;

        if let Err(e) = self.cache.set(request_key, &content).await {
            tracing::warn!(request_key, error = %e, "Failed to store generated content");
        }

        let result = GenerationResult {
            content,
            source: Source::Generated,
        };
        self.broadcast(request_key, &result).await;
        Ok(result)
    }

    /// Delivers `result` to every registered subscriber, pruning the ones that are gone.
    pub async fn broadcast(&self, request_key: &str, result: &GenerationResult) {
        let subscribers = match self.registry.list().await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list subscribers, skipping broadcast");
                return;
            }
        };

        let notification = match serde_json::to_value(Notification {
            request_key,
            content: &result.content,
            source: result.source,
        }) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize notification");
                return;
            }
        };

        for subscriber in subscribers {
            match self.broadcaster.deliver(&subscriber, &notification).await {
                Ok(()) => {}
                Err(DeliveryError::Gone) => self.prune(&subscriber).await,
                Err(e) => {
                    counter!(BROADCAST_FAILURES).increment(1);
                    tracing::warn!(
                        subscriber_id = %subscriber.subscriber_id,
                        error = %e,
                        "Delivery failed"
                    );
                }
            }
        }
    }

    async fn prune(&self, subscriber: &Subscriber) {
        tracing::info!(subscriber_id = %subscriber.subscriber_id, "Removing gone subscriber");
        match self.registry.remove(&subscriber.subscriber_id).await {
            Ok(()) => counter!(SUBSCRIBERS_PRUNED).increment(1),
            Err(e) => tracing::warn!(
                subscriber_id = %subscriber.subscriber_id,
                error = %e,
                "Failed to remove subscriber"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::memory::{MemoryCache, MemorySubscriberRegistry};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroadcaster {
        gone: HashSet<String>,
        broken: HashSet<String>,
        delivered: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn deliver(
            &self,
            subscriber: &Subscriber,
            notification: &Value,
        ) -> std::result::Result<(), DeliveryError> {
            if self.gone.contains(&subscriber.subscriber_id) {
                return Err(DeliveryError::Gone);
            }
            if self.broken.contains(&subscriber.subscriber_id) {
                return Err(DeliveryError::Failed("connection reset".into()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((subscriber.subscriber_id.clone(), notification.clone()));
            Ok(())
        }
    }

    /// Registry wrapper counting removals.
    struct CountingRegistry {
        inner: MemorySubscriberRegistry,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SubscriberRegistry for CountingRegistry {
        async fn list(&self) -> Result<Vec<Subscriber>> {
            self.inner.list().await
        }

        async fn register(&self, subscriber: Subscriber) -> Result<()> {
            self.inner.register(subscriber).await
        }

        async fn remove(&self, subscriber_id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(subscriber_id.to_string());
            self.inner.remove(subscriber_id).await
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(PipelineError::CollaboratorUnavailable("cache down".into()))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(PipelineError::CollaboratorUnavailable("cache down".into()))
        }
    }

    async fn registry_with(ids: &[&str]) -> Arc<CountingRegistry> {
        let registry = Arc::new(CountingRegistry {
            inner: MemorySubscriberRegistry::new(),
            removed: Mutex::new(Vec::new()),
        });
        for id in ids {
            registry
                .register(Subscriber {
                    subscriber_id: id.to_string(),
                    endpoint: format!("http://subscribers/{id}"),
                })
                .await
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        assert_eq!(cache_key("m", "prompt"), cache_key("m", "prompt"));
        assert_ne!(cache_key("m", "prompt"), cache_key("other", "prompt"));
        assert_ne!(cache_key("ab", "c"), cache_key("a", "bc"));
        assert_eq!(cache_key("m", "prompt").len(), 64);
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_generator() {
        let generator = CacheAsideGenerator::new(
            Arc::new(MemoryCache::new(100, None)),
            registry_with(&[]).await,
            Arc::new(RecordingBroadcaster::default()),
        );

        let first = generator
            .generate("key", || async { Ok("meaning".to_string()) })
            .await
            .unwrap();
        assert_eq!(first.source, Source::Generated);

        let second = generator
            .generate("key", || async {
                Err(PipelineError::Generation("must not be called".into()))
            })
            .await
            .unwrap();
        assert_eq!(second.content, "meaning");
        assert_eq!(second.source, Source::Cache);
    }

    #[tokio::test]
    async fn test_generation_error_propagates_and_is_not_cached() {
        let cache = Arc::new(MemoryCache::new(100, None));
        let generator = CacheAsideGenerator::new(
            cache.clone(),
            registry_with(&[]).await,
            Arc::new(RecordingBroadcaster::default()),
        );

        let result = generator
            .generate("key", || async {
                Err(PipelineError::Generation("model unavailable".into()))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Generation(_))));
        assert_eq!(cache.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_gone_subscriber_is_pruned_once() {
        let registry = registry_with(&["a", "b", "c"]).await;
        let broadcaster = Arc::new(RecordingBroadcaster {
            gone: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        let generator = CacheAsideGenerator::new(
            Arc::new(MemoryCache::new(100, None)),
            registry.clone(),
            broadcaster.clone(),
        );

        let result = generator
            .generate("key", || async { Ok("meaning".to_string()) })
            .await
            .unwrap();

        assert_eq!(
            result,
            GenerationResult {
                content: "meaning".into(),
                source: Source::Generated
            }
        );
        assert_eq!(*registry.removed.lock().unwrap(), vec!["b".to_string()]);
        assert_eq!(registry.list().await.unwrap().len(), 2);

        let delivered = broadcaster.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(
            delivered[0].1,
            serde_json::json!({"requestKey": "key", "content": "meaning", "source": "generated"})
        );
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_subscriber() {
        let registry = registry_with(&["a", "b"]).await;
        let broadcaster = Arc::new(RecordingBroadcaster {
            broken: HashSet::from(["a".to_string()]),
            ..Default::default()
        });
        let generator = CacheAsideGenerator::new(
            Arc::new(MemoryCache::new(100, None)),
            registry.clone(),
            broadcaster.clone(),
        );

        generator
            .generate("key", || async { Ok("meaning".to_string()) })
            .await
            .unwrap();

        assert!(registry.removed.lock().unwrap().is_empty());
        assert_eq!(broadcaster.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hits_are_broadcast_unless_disabled() {
        let cache = Arc::new(MemoryCache::new(100, None));
        cache.set("key", "cached").await.unwrap();

        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let generator =
            CacheAsideGenerator::new(cache.clone(), registry_with(&["a"]).await, broadcaster.clone());
        generator
            .generate("key", || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(broadcaster.delivered.lock().unwrap().len(), 1);

        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let generator =
            CacheAsideGenerator::new(cache, registry_with(&["a"]).await, broadcaster.clone())
                .with_broadcast_cache_hits(false);
        let result = generator
            .generate("key", || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(result.source, Source::Cache);
        assert!(broadcaster.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_cache_falls_through_to_generator() {
        let generator = CacheAsideGenerator::new(
            Arc::new(BrokenCache),
            registry_with(&[]).await,
            Arc::new(RecordingBroadcaster::default()),
        );

        let result = generator
            .generate("key", || async { Ok("meaning".to_string()) })
            .await
            .unwrap();
        assert_eq!(result.source, Source::Generated);
    }
}
