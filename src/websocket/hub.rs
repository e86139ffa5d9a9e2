//! WebSocket Connection Hub
//!
//! Owns the authoritative set of connections and the exact-topic index.
//! Every mutation is applied by a single [`Coordinator`] task draining three
//! bounded queues (register, unregister, dispatch). The registry sits behind
//! a read/write lock only so the bridge and the stats accessors can read it
//! concurrently; nothing but the coordinator ever takes the write side.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{Sink, Stream, StreamExt};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{
    read_pump, write_pump, Connection, ConnectionId, ConnectionState, Delivery, KeepaliveConfig,
};
use super::messages::{Frame, Message};

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's delivery queue
    pub send_queue_capacity: usize,
    /// Capacity of the register queue
    pub register_queue_capacity: usize,
    /// Capacity of the unregister queue
    pub unregister_queue_capacity: usize,
    /// Capacity of the dispatch queue
    pub dispatch_queue_capacity: usize,
    /// Socket deadlines applied to accepted connections
    pub keepalive: KeepaliveConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            register_queue_capacity: 64,
            unregister_queue_capacity: 64,
            dispatch_queue_capacity: 256,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// Errors surfaced to hub callers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub has shut down")]
    Closed,
}

struct Member {
    conn: Arc<Connection>,
    /// Topics this connection is currently indexed under
    indexed: HashSet<String>,
}

/// Connections plus the exact-topic index
#[derive(Default)]
pub(crate) struct Registry {
    members: HashMap<ConnectionId, Member>,
    topics: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    pub(crate) fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.members.values().map(|m| &m.conn)
    }

    fn subscribers<'a>(&'a self, topic: &str) -> impl Iterator<Item = &'a Arc<Connection>> {
        self.topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| self.members.get(id).map(|m| &m.conn))
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    fn insert(&mut self, conn: Arc<Connection>, topics: HashSet<String>) {
        let id = conn.id().to_string();
        for topic in &topics {
            self.index(topic, &id);
        }
        self.members.insert(
            id,
            Member {
                conn,
                indexed: topics,
            },
        );
    }

    /// Bring the index in line with a member's current subscriptions
    fn resync(&mut self, id: &str, topics: HashSet<String>) {
        let Some(member) = self.members.get_mut(id) else {
            return;
        };
        let stale: Vec<String> = member.indexed.difference(&topics).cloned().collect();
        let fresh: Vec<String> = topics.difference(&member.indexed).cloned().collect();
        member.indexed = topics;

        for topic in &stale {
            self.deindex(topic, id);
        }
        for topic in &fresh {
            self.index(topic, id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Member> {
        let member = self.members.remove(id)?;
        for topic in &member.indexed {
            self.deindex(topic, id);
        }
        Some(member)
    }

    fn index(&mut self, topic: &str, id: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());
    }

    fn deindex(&mut self, topic: &str, id: &str) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(id);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

/// Result of pushing one frame to a set of connections
pub(crate) struct FanOut {
    pub delivered: usize,
    pub saturated: Vec<Arc<Connection>>,
}

/// Deliver `frame` to every target without blocking
pub(crate) fn fan_out<'a>(
    targets: impl Iterator<Item = &'a Arc<Connection>>,
    frame: &Frame,
) -> FanOut {
    let mut outcome = FanOut {
        delivered: 0,
        saturated: Vec::new(),
    };
    for conn in targets {
        match conn.try_deliver(Frame::clone(frame)) {
            Delivery::Queued => outcome.delivered += 1,
            Delivery::Full => outcome.saturated.push(Arc::clone(conn)),
            Delivery::Closed => {}
        }
    }
    outcome
}

/// Queue an unregister without ever blocking the caller
fn schedule_unregister(tx: &mpsc::Sender<Arc<Connection>>, conn: Arc<Connection>) {
    match tx.try_send(conn) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(conn)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(conn).await;
            });
        }
    }
}

struct Shared {
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    dispatch_tx: mpsc::Sender<Message>,
    registry: Arc<RwLock<Registry>>,
    config: HubConfig,
}

/// Handle to the hub. Cheap to clone; every clone feeds the same coordinator.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    /// Create a hub and the coordinator that must be run for it to make progress
    pub fn new(config: HubConfig) -> (Self, Coordinator) {
        let (register_tx, register_rx) = mpsc::channel(config.register_queue_capacity.max(1));
        let (unregister_tx, unregister_rx) =
            mpsc::channel(config.unregister_queue_capacity.max(1));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_capacity.max(1));
        let registry = Arc::new(RwLock::new(Registry::default()));

        let coordinator = Coordinator {
            register_rx,
            unregister_rx,
            dispatch_rx,
            unregister_tx: unregister_tx.downgrade(),
            registry: Arc::clone(&registry),
        };

        let hub = Self {
            shared: Arc::new(Shared {
                register_tx,
                unregister_tx,
                dispatch_tx,
                registry,
                config,
            }),
        };

        (hub, coordinator)
    }

    /// Create a hub and spawn its coordinator, which runs until `cancel` fires
    pub fn spawn(config: HubConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (hub, coordinator) = Self::new(config);
        let handle = tokio::spawn(coordinator.run(cancel));
        (hub, handle)
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Add a connection and index it under its current subscriptions.
    ///
    /// Registering a connection that is already a member re-indexes it
    /// against its current subscription set.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.shared
            .register_tx
            .send(conn)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Remove a connection and close its delivery queue. No-op for non-members.
    pub async fn unregister(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.shared
            .unregister_tx
            .send(conn)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Fan a message out to its topic's subscribers, or to everyone for `*`
    pub async fn dispatch(&self, message: Message) -> Result<(), HubError> {
        self.shared
            .dispatch_tx
            .send(message)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Publish a fully-formed message
    pub async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.dispatch(message).await
    }

    /// Publish `data` under `topic`.
    ///
    /// Payloads that cannot be represented as JSON are dropped silently.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        kind: &str,
        data: T,
    ) -> Result<(), HubError> {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(topic = %topic, error = %e, "Dropping unserializable payload");
                return Ok(());
            }
        };
        self.dispatch(Message::new(topic, kind, data)).await
    }

    /// Take ownership of an upgraded socket: register it and start its tasks
    pub async fn accept(&self, socket: WebSocket) -> Result<Arc<Connection>, HubError> {
        let (sink, stream) = socket.split();
        self.accept_split(sink, stream).await
    }

    /// [`accept`](Self::accept) for an already-split transport
    pub async fn accept_split<Si, St, E>(
        &self,
        sink: Si,
        stream: St,
    ) -> Result<Arc<Connection>, HubError>
    where
        Si: Sink<WsMessage> + Unpin + Send + 'static,
        Si::Error: Display + Send,
        St: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let config = self.config();
        let (conn, queue) = Connection::new(config.send_queue_capacity);
        self.register(Arc::clone(&conn)).await?;

        tokio::spawn(write_pump(
            Arc::clone(&conn),
            queue,
            sink,
            config.keepalive.clone(),
        ));
        tokio::spawn(read_pump(
            Arc::clone(&conn),
            stream,
            self.clone(),
            config.keepalive.clone(),
        ));

        tracing::info!(connection_id = %conn.id(), "WebSocket connected");
        Ok(conn)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.shared.registry.read().members.len()
    }

    /// Number of connections indexed under exact `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .registry
            .read()
            .topics
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Topics with at least one subscriber, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.shared.registry.read().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.shared.registry.read()
    }

    pub(crate) fn schedule_unregister(&self, conn: Arc<Connection>) {
        schedule_unregister(&self.shared.unregister_tx, conn);
    }
}

/// The single task allowed to mutate the registry
pub struct Coordinator {
    register_rx: mpsc::Receiver<Arc<Connection>>,
    unregister_rx: mpsc::Receiver<Arc<Connection>>,
    dispatch_rx: mpsc::Receiver<Message>,
    unregister_tx: mpsc::WeakSender<Arc<Connection>>,
    registry: Arc<RwLock<Registry>>,
}

impl Coordinator {
    /// Process requests until `cancel` fires or every hub handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Hub coordinator started");

        loop {
            // The three senders live in the same handle, so one closed
            // queue means every hub handle is gone
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                conn = self.register_rx.recv() => match conn {
                    Some(conn) => self.apply_register(conn),
                    None => break,
                },
                conn = self.unregister_rx.recv() => match conn {
                    Some(conn) => self.apply_unregister(&conn),
                    None => break,
                },
                message = self.dispatch_rx.recv() => match message {
                    Some(message) => self.apply_dispatch(&message),
                    None => break,
                },
            }
        }

        self.shutdown();
    }

    fn apply_register(&mut self, conn: Arc<Connection>) {
        if conn.state() >= ConnectionState::Closing {
            tracing::debug!(connection_id = %conn.id(), "Ignoring registration of closing connection");
            return;
        }

        let topics = conn.exact_topics();
        let mut registry = self.registry.write();
        if registry.contains(conn.id()) {
            registry.resync(conn.id(), topics);
            tracing::trace!(connection_id = %conn.id(), "Re-indexed subscriptions");
        } else {
            conn.mark_open();
            registry.insert(Arc::clone(&conn), topics);
            tracing::debug!(
                connection_id = %conn.id(),
                connections = registry.members.len(),
                "Registered connection"
            );
        }
    }

    fn apply_unregister(&mut self, conn: &Arc<Connection>) {
        let removed = self.registry.write().remove(conn.id());
        if let Some(member) = removed {
            member.conn.close_queue();
            tracing::info!(connection_id = %conn.id(), "WebSocket disconnected");
        }
    }

    fn apply_dispatch(&mut self, message: &Message) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(topic = %message.channel, error = %e, "Dropping message that failed to encode");
                return;
            }
        };

        let outcome = {
            let registry = self.registry.read();
            if message.is_broadcast() {
                fan_out(registry.connections(), &frame)
            } else {
                fan_out(registry.subscribers(&message.channel), &frame)
            }
        };

        if outcome.delivered > 0 {
            tracing::trace!(
                topic = %message.channel,
                recipients = outcome.delivered,
                "Dispatched message"
            );
        }

        for conn in outcome.saturated {
            tracing::warn!(connection_id = %conn.id(), "Delivery queue full, disconnecting slow consumer");
            if let Some(tx) = self.unregister_tx.upgrade() {
                schedule_unregister(&tx, conn);
            }
        }
    }

    fn shutdown(mut self) {
        let registry = std::mem::take(&mut *self.registry.write());
        let mut closed = 0;
        for conn in registry.connections() {
            if conn.close_queue() {
                closed += 1;
            }
        }

        // Registrations that never made it in still own an open queue
        self.register_rx.close();
        while let Ok(conn) = self.register_rx.try_recv() {
            conn.close_queue();
        }
        self.unregister_rx.close();
        self.dispatch_rx.close();

        tracing::info!(closed, "Hub coordinator stopped");
    }
}
