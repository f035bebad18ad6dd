use crate::sync::types::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Provisioning progress of the app-owned calendar. Ordered: a state never moves backwards.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ManagedCalendarState {
    #[default]
    Unprovisioned,
    Provisioning,
    Verified,
}

impl ManagedCalendarState {
    pub fn advance(self, next: ManagedCalendarState) -> ManagedCalendarState {
        self.max(next)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Pending,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

/// One user's calendar connection plus sync cursor and managed-calendar bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Credential {
    pub user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Account address used as the ACL subject on the managed calendar.
    pub account_email: Option<String>,
    /// Calendar the engine currently syncs against.
    pub calendar_id: Option<String>,
    pub sync_token: Option<String>,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub managed_calendar_id: Option<String>,
    pub managed_calendar_summary: Option<String>,
    pub managed_calendar_state: ManagedCalendarState,
    pub managed_calendar_verified_at: Option<DateTime<Utc>>,
    pub managed_calendar_acl_role: Option<String>,
    pub managed_calendar_acl_verified_at: Option<DateTime<Utc>>,
    /// Calendar events lived on before the managed calendar took over.
    pub legacy_calendar_id: Option<String>,
    pub needs_reauth: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mapping between one local item and its remote event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SyncLink {
    pub item_id: String,
    pub item_kind: EntityKind,
    pub user_id: String,
    pub calendar_id: Option<String>,
    pub event_id: Option<String>,
    pub etag: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_direction: Option<SyncDirection>,
    pub local_hash: Option<String>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub last_error: Option<String>,
}

impl SyncLink {
    pub fn new(item_id: impl Into<String>, item_kind: EntityKind, user_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_kind,
            user_id: user_id.into(),
            calendar_id: None,
            event_id: None,
            etag: None,
            last_synced_at: None,
            last_sync_direction: None,
            local_hash: None,
            remote_updated_at: None,
            sync_status: SyncStatus::Idle,
            last_error: None,
        }
    }
}

/// A registered push-notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WatchChannel {
    pub channel_id: String,
    pub user_id: String,
    pub calendar_id: String,
    pub resource_id: String,
    pub resource_uri: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub channel_token: String,
    pub created_at: DateTime<Utc>,
}

impl WatchChannel {
    /// Expired, or expiring within `threshold` of `now`. Channels without a known expiration
    /// never count as expiring.
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.expiration.is_some_and(|at| at <= now + threshold)
    }
}

/// Aggregate over one user's links for the status view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub not_idle: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
