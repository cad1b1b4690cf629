//! Publish/subscribe bus used by subscriptions and the `@publish` directive.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Callback run for every event published on a topic.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Engine-specific options attached to a topic subscription.
pub type ChannelOptions = serde_json::Map<String, Value>;

/// Identifier of one handler registration on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PubSubError {
    #[error("unknown bus subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("subscribing to \"{topic}\" failed: {reason}")]
    Rejected { topic: String, reason: String },
}

/// A publish/subscribe engine.
#[async_trait]
pub trait PubSubEngine: Send + Sync {
    /// Delivers `payload` to every handler on `topic` and waits for all of
    /// them. Returns the number of handlers run.
    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, PubSubError>;

    /// Registers `handler` on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
        options: &ChannelOptions,
    ) -> Result<SubscriptionId, PubSubError>;

    /// Removes a handler registration.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PubSubError>;
}

#[derive(Default)]
struct Registry {
    topics: FxHashMap<String, Vec<(SubscriptionId, EventHandler)>>,
    owners: FxHashMap<SubscriptionId, String>,
}

/// In-process publish/subscribe hub.
#[derive(Clone, Default)]
pub struct PubSub {
    registry: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics with at least one handler.
    pub async fn topic_count(&self) -> usize {
        self.registry.read().await.topics.len()
    }

    /// Number of live handler registrations.
    pub async fn subscription_count(&self) -> usize {
        self.registry.read().await.owners.len()
    }

    pub async fn has_subscribers(&self, topic: &str) -> bool {
        self.registry
            .read()
            .await
            .topics
            .get(topic)
            .is_some_and(|handlers| !handlers.is_empty())
    }
}

impl fmt::Debug for PubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl PubSubEngine for PubSub {
    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, PubSubError> {
        let handlers: Vec<EventHandler> = {
            let registry = self.registry.read().await;
            match registry.topics.get(topic) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return Ok(0),
            }
        };

        debug!(topic, handlers = handlers.len(), "publishing event");
        let count = handlers.len();
        join_all(handlers.into_iter().map(|handler| handler(payload.clone()))).await;
        Ok(count)
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
        _options: &ChannelOptions,
    ) -> Result<SubscriptionId, PubSubError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.write().await;
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        registry.owners.insert(id, topic.to_string());
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PubSubError> {
        let mut registry = self.registry.write().await;
        let topic = registry
            .owners
            .remove(&id)
            .ok_or(PubSubError::UnknownSubscription(id))?;
        if let Some(handlers) = registry.topics.get_mut(&topic) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.is_empty() {
                registry.topics.remove(&topic);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;

    fn recorder(sink: Arc<Mutex<Vec<Value>>>) -> EventHandler {
        Arc::new(move |payload| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(payload);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_publish_runs_every_handler() {
        let pubsub = PubSub::new();
        let sink = Arc::new(Mutex::new(Vec::new()));

        pubsub
            .subscribe("tick", recorder(Arc::clone(&sink)), &ChannelOptions::new())
            .await
            .unwrap();
        pubsub
            .subscribe("tick", recorder(Arc::clone(&sink)), &ChannelOptions::new())
            .await
            .unwrap();

        let count = pubsub.publish("tick", serde_json::json!(1)).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(sink.lock().unwrap().len(), 2);
        assert_eq!(pubsub.publish("other", Value::Null).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let pubsub = PubSub::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let id = pubsub
            .subscribe("tick", recorder(Arc::clone(&sink)), &ChannelOptions::new())
            .await
            .unwrap();

        assert!(pubsub.has_subscribers("tick").await);
        pubsub.unsubscribe(id).await.unwrap();
        assert!(!pubsub.has_subscribers("tick").await);
        assert_eq!(pubsub.topic_count().await, 0);
        assert_eq!(
            pubsub.unsubscribe(id).await.unwrap_err(),
            PubSubError::UnknownSubscription(id)
        );

        pubsub.publish("tick", serde_json::json!(1)).await.unwrap();
        assert!(sink.lock().unwrap().is_empty());
    }
}
