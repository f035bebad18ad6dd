use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WatchParams {
    /// Requested channel lifetime in seconds; the provider may shorten it.
    pub ttl: String,
}

/// Body of `events/watch`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<WatchParams>,
}

/// Channel resource returned by `events/watch`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_uri: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Milliseconds since the epoch, encoded as a string on the wire.
    #[serde(default)]
    pub expiration: Option<String>,
}

impl Channel {
    pub fn expiration_at(&self) -> Option<DateTime<Utc>> {
        self.expiration
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

/// Body of `channels/stop`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopChannelRequest {
    pub id: String,
    pub resource_id: String,
}
