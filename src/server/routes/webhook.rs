use crate::server::router::CareSyncState;
use crate::watch::{Notification, NotificationOutcome};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

pub const X_GOOG_CHANNEL_ID: &str = "x-goog-channel-id";
pub const X_GOOG_RESOURCE_ID: &str = "x-goog-resource-id";
pub const X_GOOG_RESOURCE_STATE: &str = "x-goog-resource-state";
pub const X_GOOG_CHANNEL_TOKEN: &str = "x-goog-channel-token";
pub const X_GOOG_MESSAGE_NUMBER: &str = "x-goog-message-number";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `None` when one of the headers every notification carries is missing.
pub fn parse_notification(headers: &HeaderMap) -> Option<Notification> {
    Some(Notification {
        channel_id: header(headers, X_GOOG_CHANNEL_ID)?.to_string(),
        resource_id: header(headers, X_GOOG_RESOURCE_ID)?.to_string(),
        resource_state: header(headers, X_GOOG_RESOURCE_STATE)?.to_string(),
        channel_token: header(headers, X_GOOG_CHANNEL_TOKEN).map(str::to_string),
        message_number: header(headers, X_GOOG_MESSAGE_NUMBER).and_then(|v| v.parse().ok()),
    })
}

pub async fn calendar_notification(
    State(state): State<CareSyncState>,
    headers: HeaderMap,
) -> Response {
    let Some(notification) = parse_notification(&headers) else {
        debug!("Notification without channel headers");
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state
        .watch
        .handle_notification(&notification, &state.orchestrator)
        .await
    {
        Ok(NotificationOutcome::Rejected) => StatusCode::UNAUTHORIZED.into_response(),
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
