//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::bridge::{BridgeAdapter, MessageBus};
use crate::websocket::Hub;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Connection hub; also the direct publish path
    pub hub: Hub,
    /// External message bus the bridge listens on
    pub bus: Arc<dyn MessageBus>,
    /// Bridge relaying bus events to pattern subscribers (optional)
    pub bridge: Option<Arc<BridgeAdapter>>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create an AppState without a bridge
    pub fn new(hub: Hub, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            hub,
            bus,
            bridge: None,
            start_time: Instant::now(),
        }
    }

    /// Attach a running bridge
    pub fn with_bridge(mut self, bridge: Arc<BridgeAdapter>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Whether bus events currently reach WebSocket clients
    pub fn bridge_active(&self) -> bool {
        self.bridge.as_ref().is_some_and(|b| !b.is_closed())
    }
}
