//! Message Bus Bridge
//!
//! Relays events from an external message bus to WebSocket clients whose
//! subscriptions match the event's topic as a pattern.
//!
//! # Architecture
//!
//! ```text
//!   bus.publish(topic, payload)
//!     → BridgeAdapter (filter, encode once)
//!     → every registered Connection whose patterns match
//!     → delivery queue → write task → socket
//! ```
//!
//! The hub's index only answers exact topics, so the bridge scans every
//! registered connection per event, reading the hub registry under its
//! read lock. That is O(connections) per event; a reverse pattern index
//! would be the next step if connection counts grow large.

pub mod bus;
pub mod pattern;

pub use bus::{BusError, BusHandler, BusSubscription, MemoryBus, MessageBus};
pub use pattern::{Pattern, WILDCARD};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::websocket::{fan_out, Hub, Message};

/// Predicate deciding whether an external event is relayed
pub type Filter = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Filter accepting only payloads whose `flag` field is `true`
pub fn require_flag(flag: impl Into<String>) -> Filter {
    let flag = flag.into();
    Arc::new(move |_topic: &str, payload: &Value| {
        payload.get(&flag).and_then(Value::as_bool) == Some(true)
    })
}

/// Relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Frames queued onto connections
    pub delivered: u64,
    /// Events rejected by the filter
    pub filtered: u64,
    /// Connections dropped because their queue was full
    pub dropped: u64,
}

struct BridgeInner {
    hub: Hub,
    filter: Option<Filter>,
    /// Read-held for the whole relay of an event, so `close` waits for
    /// relays already in progress
    closed: RwLock<bool>,
    delivered: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
}

impl BridgeInner {
    fn on_message(&self, topic: &str, payload: &Value) {
        let closed = self.closed.read_recursive();
        if *closed {
            tracing::trace!(topic = %topic, "Bridge closed, ignoring event");
            return;
        }

        if let Some(filter) = &self.filter {
            if !filter(topic, payload) {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(topic = %topic, "Event rejected by filter");
                return;
            }
        }

        let message = Message::new(topic, event_type(topic), payload.clone());
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(topic = %topic, error = %e, "Dropping event that failed to encode");
                return;
            }
        };

        let outcome = {
            let registry = self.hub.registry();
            fan_out(registry.connections().filter(|c| c.matches(topic)), &frame)
        };

        self.delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(outcome.saturated.len() as u64, Ordering::Relaxed);

        for conn in outcome.saturated {
            tracing::warn!(connection_id = %conn.id(), topic = %topic, "Delivery queue full, disconnecting slow consumer");
            self.hub.schedule_unregister(conn);
        }

        tracing::debug!(topic = %topic, recipients = outcome.delivered, "Bridged event");
    }
}

/// `user.created` → `created`
fn event_type(topic: &str) -> &str {
    topic.rsplit('.').next().unwrap_or(topic)
}

/// Subscribes once to an external bus and feeds matching events to the hub's
/// connections
pub struct BridgeAdapter {
    inner: Arc<BridgeInner>,
    subscription: Mutex<Option<Box<dyn BusSubscription>>>,
}

impl BridgeAdapter {
    /// Subscribe to every topic on `bus` and start relaying
    pub async fn connect(
        bus: &dyn MessageBus,
        hub: Hub,
        filter: Option<Filter>,
    ) -> Result<Self, BusError> {
        let inner = Arc::new(BridgeInner {
            hub,
            filter,
            closed: RwLock::new(false),
            delivered: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let relay = Arc::clone(&inner);
        let handler: BusHandler =
            Arc::new(move |topic: &str, payload: &Value| relay.on_message(topic, payload));
        let subscription = bus.subscribe(WILDCARD, handler).await?;

        tracing::info!(filtered = inner.filter.is_some(), "Bridge subscribed to message bus");
        Ok(Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Unsubscribe from the bus. Waits for events already being relayed;
    /// events arriving afterwards are ignored.
    pub async fn close(&self) -> Result<(), BusError> {
        {
            let mut closed = self.inner.closed.write();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await?;
        }
        tracing::info!("Bridge closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            filtered: self.inner.filtered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{Connection, Frame, HubConfig};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        hub: Hub,
        bus: MemoryBus,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let cancel = CancellationToken::new();
            let (hub, _task) = Hub::spawn(HubConfig::default(), cancel.clone());
            Self {
                hub,
                bus: MemoryBus::new(),
                cancel,
            }
        }

        async fn connection(&self, patterns: &[&str], capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
            let (conn, rx) = Connection::new(capacity);
            for p in patterns {
                conn.subscribe(*p);
            }
            let expected = self.hub.connection_count() + 1;
            self.hub.register(Arc::clone(&conn)).await.unwrap();
            for _ in 0..200 {
                if self.hub.connection_count() == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            (conn, rx)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[test]
    fn test_event_type() {
        assert_eq!(event_type("user.created"), "created");
        assert_eq!(event_type("a.b.c"), "c");
        assert_eq!(event_type("plain"), "plain");
    }

    #[test]
    fn test_require_flag() {
        let filter = require_flag("important");
        assert!(filter("t", &json!({"important": true})));
        assert!(!filter("t", &json!({"important": false})));
        assert!(!filter("t", &json!({"important": "true"})));
        assert!(!filter("t", &json!({})));
        assert!(!filter("t", &json!(null)));
    }

    #[tokio::test]
    async fn test_trailing_wildcard_subscriber_receives_event() {
        let fx = Fixture::new();
        let bridge = BridgeAdapter::connect(&fx.bus, fx.hub.clone(), None).await.unwrap();
        let (_d, mut rx) = fx.connection(&["user.*"], 8).await;

        fx.bus.publish("user.created", json!({"id": 1})).await.unwrap();

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("created"));
        assert_eq!(
            &*frame,
            r#"{"channel":"user.created","type":"created","data":{"id":1}}"#
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_pattern_forms_select_recipients() {
        let fx = Fixture::new();
        let _bridge = BridgeAdapter::connect(&fx.bus, fx.hub.clone(), None).await.unwrap();
        let (_leading, mut leading_rx) = fx.connection(&["*.created"], 8).await;
        let (_exact, mut exact_rx) = fx.connection(&["post.created"], 8).await;
        let (_all, mut all_rx) = fx.connection(&["*"], 8).await;
        let (_other, mut other_rx) = fx.connection(&["admin.*", "created"], 8).await;

        fx.bus.publish("post.created", json!({"id": 7})).await.unwrap();

        assert!(leading_rx.try_recv().is_ok());
        assert!(exact_rx.try_recv().is_ok());
        assert!(all_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_filter_suppresses_rejected_events() {
        let fx = Fixture::new();
        let bridge = BridgeAdapter::connect(&fx.bus, fx.hub.clone(), Some(require_flag("important")))
            .await
            .unwrap();
        let (_conn, mut rx) = fx.connection(&["alerts"], 8).await;

        fx.bus
            .publish("alerts", json!({"important": true, "n": 1}))
            .await
            .unwrap();
        fx.bus.publish("alerts", json!({"n": 2})).await.unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(
            &*frame,
            r#"{"channel":"alerts","type":"alerts","data":{"important":true,"n":1}}"#
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                delivered: 1,
                filtered: 1,
                dropped: 0
            }
        );
    }

    #[tokio::test]
    async fn test_close_unsubscribes_and_ignores_late_events() {
        let fx = Fixture::new();
        let bridge = BridgeAdapter::connect(&fx.bus, fx.hub.clone(), None).await.unwrap();
        let (_conn, mut rx) = fx.connection(&["*"], 8).await;
        assert_eq!(fx.bus.subscription_count(), 1);

        bridge.close().await.unwrap();
        bridge.close().await.unwrap();
        assert!(bridge.is_closed());
        assert_eq!(fx.bus.subscription_count(), 0);

        // A callback already in flight when close() ran
        bridge.inner.on_message("late", &json!(1));
        fx.bus.publish("late", json!(2)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_waits_for_relay_in_progress() {
        let fx = Fixture::new();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let filter: Filter = Arc::new(move |_topic: &str, _payload: &Value| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
            true
        });
        let bridge = Arc::new(
            BridgeAdapter::connect(&fx.bus, fx.hub.clone(), Some(filter))
                .await
                .unwrap(),
        );
        let (_conn, mut rx) = fx.connection(&["*"], 8).await;

        let bus = fx.bus.clone();
        let publisher = std::thread::spawn(move || {
            futures::executor::block_on(bus.publish("slow", json!(1))).unwrap();
        });
        entered_rx.recv().unwrap();

        let closing = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.close().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());

        release_tx.send(()).unwrap();
        closing.await.unwrap().unwrap();
        publisher.join().unwrap();

        // The in-flight event finished before close returned
        assert!(rx.try_recv().is_ok());
        assert_eq!(bridge.stats().delivered, 1);
        assert!(bridge.is_closed());
    }

    #[tokio::test]
    async fn test_saturated_connection_is_dropped() {
        let fx = Fixture::new();
        let bridge = BridgeAdapter::connect(&fx.bus, fx.hub.clone(), None).await.unwrap();
        let (_slow, _rx) = fx.connection(&["feed.*"], 1).await;

        fx.bus.publish("feed.a", json!(1)).await.unwrap();
        fx.bus.publish("feed.b", json!(2)).await.unwrap();
        fx.bus.publish("feed.c", json!(3)).await.unwrap();

        for _ in 0..200 {
            if fx.hub.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.hub.connection_count(), 0);
        assert_eq!(bridge.stats().delivered, 1);
        assert_eq!(bridge.stats().dropped, 1);
    }
}
