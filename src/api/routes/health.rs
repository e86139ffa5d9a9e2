//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health
///
/// Full health status with hub and bridge details.
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let bridge = match &state.bridge {
        None => "disabled",
        Some(b) if b.is_closed() => "closed",
        Some(_) => "ok",
    };

    let status = if state.bridge.is_some() && !state.bridge_active() {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        connections: state.hub.connection_count(),
        topics: state.hub.topics().len(),
        bridge: bridge.to_string(),
        bridge_stats: state.bridge.as_ref().map(|b| b.stats()),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
