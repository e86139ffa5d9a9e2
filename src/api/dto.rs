//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::BridgeStats;

// ============================================
// PUBLISH DTOs
// ============================================

/// Direct hub publish request
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Exact topic, or `*` for every connection
    pub channel: String,
    /// Message type forwarded to clients
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload, `null` when omitted
    #[serde(default)]
    pub data: Value,
}

/// External bus event request
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    /// Bus topic, matched against client patterns by the bridge
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response for accepted publish/event requests
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: String,
    /// Exact-topic subscribers at the time of acceptance (hub publish only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<usize>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub topics: usize,
    pub bridge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_stats: Option<BridgeStats>,
    pub uptime_seconds: u64,
    pub version: String,
}
