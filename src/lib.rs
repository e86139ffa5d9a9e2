//! # Beacon
//!
//! Real-time WebSocket broadcast hub. Clients connect over WebSocket,
//! subscribe to topics, and receive JSON messages published either
//! directly into the hub or onto an external message bus.
//!
//! ## Features
//!
//! - **Single-writer hub**: one coordinator task owns membership and the
//!   topic index; publishers never lock anything
//! - **Slow-consumer isolation**: bounded per-connection queues, a full
//!   queue disconnects that client instead of stalling others
//! - **Pattern bridge**: external bus events reach clients subscribed with
//!   `*`, `prefix.*` or `*.suffix`
//! - **Keepalive**: ping/pong liveness and bounded writes per socket
//!
//! ## Modules
//!
//! - [`websocket`]: Hub, connections and the wire format
//! - [`bridge`]: Message bus contract, in-memory bus and the bridge adapter
//! - [`config`]: TOML + environment configuration
//! - [`api`]: HTTP server with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use beacon::websocket::{Connection, Hub, HubConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel = CancellationToken::new();
//!     let (hub, coordinator) = Hub::spawn(HubConfig::default(), cancel.clone());
//!
//!     // A connection normally comes from `Hub::accept`
//!     let (conn, mut queue) = Connection::new(16);
//!     conn.subscribe("chat");
//!     hub.register(conn).await?;
//!
//!     hub.publish("chat", "message", serde_json::json!({"text": "hi"})).await?;
//!     if let Some(frame) = queue.recv().await {
//!         println!("{}", frame);
//!     }
//!
//!     // Graceful shutdown
//!     cancel.cancel();
//!     coordinator.await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod websocket;

// Re-export top-level types for convenience
pub use websocket::{
    websocket_handler, ClientMessage, Connection, ConnectionState, Coordinator, Delivery, Frame,
    Hub, HubConfig, HubError, KeepaliveConfig, Message, BROADCAST_TOPIC,
};

pub use bridge::{
    require_flag, BridgeAdapter, BridgeStats, BusError, BusHandler, BusSubscription, Filter,
    MemoryBus, MessageBus, Pattern,
};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{
    BridgeSettings, Config, ConfigError, HubSettings, KeepaliveSettings, LoggingConfig,
    ServerConfig,
};
