//! External message bus contract
//!
//! The bridge consumes a bus through [`MessageBus`]; [`MemoryBus`] is the
//! in-process implementation used for single-node deployments and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

use super::pattern;

/// Callback invoked for every message matching a subscription
pub type BusHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Errors raised by a message bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message bus is closed")]
    Closed,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// A pub/sub bus the bridge can listen to
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register `handler` for topics matching `pattern`
    async fn subscribe(
        &self,
        pattern: &str,
        handler: BusHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Publish `payload` under `topic`
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;
}

/// A live subscription on a bus
#[async_trait]
pub trait BusSubscription: Send + Sync {
    async fn unsubscribe(&self) -> Result<(), BusError>;
}

struct Registration {
    pattern: String,
    handler: BusHandler,
}

#[derive(Default)]
struct MemoryBusInner {
    handlers: RwLock<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// In-process bus. Handlers run synchronously inside `publish`.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Stop accepting publishes and drop every subscription
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.handlers.write().clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(
        &self,
        pattern: &str,
        handler: BusHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if pattern.is_empty() {
            return Err(BusError::Subscribe("empty pattern".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().insert(
            id,
            Registration {
                pattern: pattern.to_string(),
                handler,
            },
        );
        tracing::debug!(subscription = id, pattern = %pattern, "Bus subscription added");

        Ok(Box::new(MemorySubscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }))
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if topic.is_empty() {
            return Err(BusError::Publish("empty topic".to_string()));
        }

        // Handlers run outside the lock so they may subscribe or publish
        let handlers: Vec<BusHandler> = self
            .inner
            .handlers
            .read()
            .values()
            .filter(|r| pattern::matches(&r.pattern, topic))
            .map(|r| Arc::clone(&r.handler))
            .collect();

        tracing::trace!(topic = %topic, handlers = handlers.len(), "Bus publish");
        for handler in handlers {
            handler(topic, &payload);
        }
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    bus: Weak<MemoryBusInner>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn unsubscribe(&self) -> Result<(), BusError> {
        if let Some(bus) = self.bus.upgrade() {
            bus.handlers.write().remove(&self.id);
            tracing::debug!(subscription = self.id, "Bus subscription removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (BusHandler, Arc<Mutex<Vec<(String, Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: BusHandler = Arc::new(move |topic: &str, payload: &Value| {
            sink.lock().push((topic.to_string(), payload.clone()));
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_handlers() {
        let bus = MemoryBus::new();
        let (all, all_seen) = recorder();
        let (users, users_seen) = recorder();
        bus.subscribe("*", all).await.unwrap();
        bus.subscribe("user.*", users).await.unwrap();

        bus.publish("user.created", json!({"id": 1})).await.unwrap();
        bus.publish("post.created", json!({"id": 2})).await.unwrap();

        assert_eq!(all_seen.lock().len(), 2);
        assert_eq!(
            *users_seen.lock(),
            vec![("user.created".to_string(), json!({"id": 1}))]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let (handler, seen) = recorder();
        let subscription = bus.subscribe("*", handler).await.unwrap();
        assert_eq!(bus.subscription_count(), 1);

        subscription.unsubscribe().await.unwrap();
        subscription.unsubscribe().await.unwrap();
        assert_eq!(bus.subscription_count(), 0);

        bus.publish("t", json!(1)).await.unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_calls() {
        let bus = MemoryBus::new();
        let (handler, _) = recorder();
        bus.close();

        assert!(matches!(bus.publish("t", json!(1)).await, Err(BusError::Closed)));
        assert!(matches!(bus.subscribe("*", handler).await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_rejects_empty_names() {
        let bus = MemoryBus::new();
        let (handler, _) = recorder();
        assert!(matches!(bus.subscribe("", handler).await, Err(BusError::Subscribe(_))));
        assert!(matches!(bus.publish("", json!(1)).await, Err(BusError::Publish(_))));
    }
}
