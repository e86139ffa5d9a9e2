//! WebSocket Handler
//!
//! Upgrades HTTP requests and hands the socket to the hub.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use std::sync::Arc;

use crate::api::{ApiError, AppState};

/// WebSocket upgrade handler
///
/// A request that cannot be upgraded is answered synchronously with the
/// rejection's status. Origins are not checked here.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|rejection| ApiError::Upgrade {
        status: rejection.status(),
        message: rejection.body_text(),
    })?;

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = hub.accept(socket).await {
            tracing::warn!(error = %e, "Rejecting WebSocket connection");
        }
    }))
}
