//! WebSocket Connection
//!
//! One accepted session: a bounded delivery queue, the set of topics the
//! client subscribed to, and the two tasks that move frames between the
//! socket and the hub.
//!
//! ```text
//!   socket ──read_pump──▶ subscribe/unsubscribe ──▶ Hub (re-index)
//!   Hub / Bridge ──try_deliver──▶ queue ──write_pump──▶ socket
//! ```

use axum::extract::ws::{CloseFrame, Message as WsMessage};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::hub::Hub;
use super::messages::{ClientMessage, Frame};
use crate::bridge::pattern::{self, Pattern};

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Accepted but not yet registered with the hub
    Connecting,
    /// Registered; subscriptions may change freely
    Open,
    /// Queue closed, saturated, or socket gone; awaiting teardown
    Closing,
    /// Writer finished; terminal
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Outcome of a non-blocking delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame was queued for the writer
    Queued,
    /// Queue is at capacity; the connection is now closing
    Full,
    /// Connection no longer accepts frames
    Closed,
}

/// Keepalive and write deadlines for a connection
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Upper bound on a single socket write
    pub write_timeout: Duration,
    /// How long to wait for a pong before giving up on the peer
    pub pong_timeout: Duration,
    /// Interval between pings; must be shorter than `pong_timeout`
    pub ping_interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
        }
    }
}

/// A live WebSocket session as seen by the hub and the bridge
pub struct Connection {
    id: ConnectionId,
    /// Sending half of the delivery queue. `None` once the hub closed it.
    queue: Mutex<Option<mpsc::Sender<Frame>>>,
    /// Exact topics and patterns this client subscribed to
    topics: RwLock<HashSet<String>>,
    state: AtomicU8,
    /// Fired when either pump stops using the socket
    socket_closed: CancellationToken,
}

impl Connection {
    /// Create a connection with a delivery queue of `capacity` frames.
    ///
    /// Returns the receiving half of the queue for the writer task.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            queue: Mutex::new(Some(tx)),
            topics: RwLock::new(HashSet::new()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            socket_closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Add a topic or pattern. Returns true if it was not already present.
    pub fn subscribe(&self, topic: impl Into<String>) -> bool {
        self.topics.write().insert(topic.into())
    }

    /// Remove a topic or pattern. Returns true if it was present.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.topics.write().remove(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    /// Current subscriptions, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.topics.read().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscriptions that name a single topic. Wildcard patterns are left
    /// to the bridge and never enter the hub's index.
    pub(crate) fn exact_topics(&self) -> HashSet<String> {
        self.topics
            .read()
            .iter()
            .filter(|t| Pattern::parse(t.as_str()).is_exact())
            .cloned()
            .collect()
    }

    /// Whether any subscription, read as a pattern, matches `topic`
    pub fn matches(&self, topic: &str) -> bool {
        self.topics
            .read()
            .iter()
            .any(|p| pattern::matches(p, topic))
    }

    /// Queue a frame without blocking.
    ///
    /// A full queue moves the connection to `Closing`; the caller is
    /// expected to schedule its unregistration.
    pub fn try_deliver(&self, frame: Frame) -> Delivery {
        if self.state() >= ConnectionState::Closing {
            return Delivery::Closed;
        }

        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Delivery::Closed;
        };

        match tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.begin_closing();
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Close the delivery queue. Returns true only for the call that
    /// actually closed it.
    pub fn close_queue(&self) -> bool {
        let closed = self.queue.lock().take().is_some();
        if closed {
            self.begin_closing();
        }
        closed
    }

    pub fn is_socket_closed(&self) -> bool {
        self.socket_closed.is_cancelled()
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn begin_closing(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < ConnectionState::Closing as u8)
                    .then_some(ConnectionState::Closing as u8)
            })
            .is_ok()
    }

    fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    fn close_socket(&self) {
        self.socket_closed.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("topics", &self.topics())
            .finish()
    }
}

/// Close codes that indicate an orderly shutdown by the peer
pub fn is_normal_close(code: u16) -> bool {
    matches!(code, 1000 | 1001)
}

/// Lower bound on the ping period; a zero interval would spin the writer
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// A close frame carrying a code other than 1000/1001
fn is_abnormal_close(frame: Option<&CloseFrame<'static>>) -> bool {
    frame.is_some_and(|f| !is_normal_close(f.code))
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("write failed: {0}")]
    Transport(String),
}

/// Inbound task: applies control frames and watches the read deadline.
///
/// The deadline is pushed out only when a pong arrives. On any read
/// failure the connection is handed back to the hub for unregistration.
pub async fn read_pump<S, E>(
    conn: Arc<Connection>,
    mut stream: S,
    hub: Hub,
    keepalive: KeepaliveConfig,
) where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + keepalive.pong_timeout;

    loop {
        let next = tokio::select! {
            _ = conn.socket_closed.cancelled() => break,
            next = time::timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                tracing::debug!(connection_id = %conn.id, "Read deadline exceeded, no pong");
                break;
            }
            Ok(None) => {
                tracing::debug!(connection_id = %conn.id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(connection_id = %conn.id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => apply_control(&conn, &hub, text.as_bytes()).await,
            WsMessage::Binary(bytes) => apply_control(&conn, &hub, &bytes).await,
            WsMessage::Pong(_) => deadline = Instant::now() + keepalive.pong_timeout,
            WsMessage::Ping(_) => {}
            WsMessage::Close(frame) => {
                log_close(&conn, frame.as_ref());
                break;
            }
        }
    }

    conn.close_socket();
    if hub.unregister(Arc::clone(&conn)).await.is_err() {
        tracing::debug!(connection_id = %conn.id, "Hub already stopped");
    }
}

async fn apply_control(conn: &Arc<Connection>, hub: &Hub, payload: &[u8]) {
    let (changed, channel) = match ClientMessage::parse(payload) {
        Some(ClientMessage::Subscribe { channel }) => {
            tracing::debug!(connection_id = %conn.id, topic = %channel, "Subscribe");
            (conn.subscribe(channel.clone()), channel)
        }
        Some(ClientMessage::Unsubscribe { channel }) => {
            tracing::debug!(connection_id = %conn.id, topic = %channel, "Unsubscribe");
            (conn.unsubscribe(&channel), channel)
        }
        None => {
            tracing::trace!(connection_id = %conn.id, "Ignoring non-control frame");
            return;
        }
    };

    // Re-registering brings the hub's exact-topic index in line
    let indexed = Pattern::parse(&channel).is_exact();
    if changed && indexed && hub.register(Arc::clone(conn)).await.is_err() {
        tracing::debug!(connection_id = %conn.id, "Hub already stopped");
    }
}

fn log_close(conn: &Connection, frame: Option<&CloseFrame<'static>>) {
    match frame {
        Some(frame) if is_abnormal_close(Some(frame)) => {
            tracing::warn!(
                connection_id = %conn.id,
                code = frame.code,
                reason = %frame.reason,
                "WebSocket closed abnormally"
            );
        }
        Some(frame) => {
            tracing::debug!(connection_id = %conn.id, code = frame.code, "Client closed connection");
        }
        None => {
            tracing::debug!(connection_id = %conn.id, "Client closed connection without status");
        }
    }
}

/// Outbound task: drains the delivery queue onto the socket.
///
/// Frames already waiting in the queue are joined with `\n` into a single
/// text message. A ping goes out once `ping_interval` passes without a
/// write. When the hub closes the queue a close frame is sent and the task
/// ends.
pub async fn write_pump<S>(
    conn: Arc<Connection>,
    mut queue: mpsc::Receiver<Frame>,
    mut sink: S,
    keepalive: KeepaliveConfig,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let ping_interval = keepalive.ping_interval.max(MIN_PING_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let _ = send_with_timeout(&mut sink, WsMessage::Close(None), keepalive.write_timeout).await;
                    tracing::debug!(connection_id = %conn.id, "Delivery queue closed, sent close frame");
                    break;
                };

                let batch = coalesce(frame, &mut queue);
                if let Err(e) = send_with_timeout(&mut sink, WsMessage::Text(batch), keepalive.write_timeout).await {
                    tracing::warn!(connection_id = %conn.id, error = %e, "WebSocket write failed");
                    break;
                }
                ticker.reset();
            }
            _ = ticker.tick() => {
                if let Err(e) = send_with_timeout(&mut sink, WsMessage::Ping(Vec::new()), keepalive.write_timeout).await {
                    tracing::debug!(connection_id = %conn.id, error = %e, "Ping failed");
                    break;
                }
            }
            _ = conn.socket_closed.cancelled() => break,
        }
    }

    let _ = time::timeout(keepalive.write_timeout, sink.close()).await;
    conn.mark_closed();
    conn.close_socket();
}

fn coalesce(first: Frame, queue: &mut mpsc::Receiver<Frame>) -> String {
    let mut batch = String::with_capacity(first.len());
    batch.push_str(&first);
    while let Ok(next) = queue.try_recv() {
        batch.push('\n');
        batch.push_str(&next);
    }
    batch
}

async fn send_with_timeout<S>(
    sink: &mut S,
    message: WsMessage,
    limit: Duration,
) -> Result<(), WriteError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    match time::timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Timeout(limit)),
    }
}
