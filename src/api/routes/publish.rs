//! Publish Routes
//!
//! - POST /api/v1/publish - Publish straight into the hub (exact topic or `*`)
//! - POST /api/v1/events - Publish onto the message bus, reaching clients
//!   through the bridge's pattern matching

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::{AcceptedResponse, EventRequest, PublishRequest};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::websocket::{Message, BROADCAST_TOPIC};

/// POST /api/v1/publish
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    validate_topic(&req.channel, "channel")?;

    let subscribers = if req.channel == BROADCAST_TOPIC {
        state.hub.connection_count()
    } else {
        state.hub.subscriber_count(&req.channel)
    };

    tracing::debug!(topic = %req.channel, subscribers, "Publishing to hub");
    state
        .hub
        .dispatch(Message::new(req.channel, req.kind, req.data))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
            subscribers: Some(subscribers),
        }),
    ))
}

/// POST /api/v1/events
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EventRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    validate_topic(&req.topic, "topic")?;

    tracing::debug!(topic = %req.topic, "Publishing to message bus");
    state.bus.publish(&req.topic, req.payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
            subscribers: None,
        }),
    ))
}

fn validate_topic(topic: &str, field: &str) -> ApiResult<()> {
    if topic.trim().is_empty() {
        return Err(ApiError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("chat", "channel").is_ok());
        assert!(validate_topic("*", "channel").is_ok());
        assert!(matches!(
            validate_topic("  ", "channel"),
            Err(ApiError::Validation(_))
        ));
    }
}
