//! Calendar provider surface.
//!
//! Everything that knows the provider's wire shape lives here: the [`CalendarApi`] seam, the
//! reqwest-backed [`GoogleCalendarClient`], HTTP error classification and access-token refresh.

mod client;
mod policy;
mod token;

pub use client::{GoogleCalendarClient, build_http_client};
pub use policy::{UPSTREAM_BODY_PREVIEW_CHARS, classify_response};
pub use token::{REFRESH_SKEW_SECS, TokenSource};

use crate::error::ProviderError;
use async_trait::async_trait;
use caresync_schema::{
    AclRule, Calendar, CalendarEvent, CalendarListEntry, Channel, EventsPage, StopChannelRequest,
    WatchRequest,
};
use chrono::{DateTime, Utc};

/// Parameters of one `events/list` page request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsQuery {
    /// Incremental cursor. Mutually exclusive with `time_min`.
    pub sync_token: Option<String>,
    pub page_token: Option<String>,
    pub time_min: Option<DateTime<Utc>>,
    pub show_deleted: bool,
    pub single_events: bool,
    pub max_results: Option<u32>,
}

impl EventsQuery {
    /// Repeats the flags of [`EventsQuery::full`]; the provider expects them on every request
    /// made with the token it handed out.
    pub fn incremental(sync_token: impl Into<String>) -> Self {
        Self {
            sync_token: Some(sync_token.into()),
            show_deleted: true,
            single_events: true,
            ..Default::default()
        }
    }

    pub fn full(time_min: DateTime<Utc>) -> Self {
        Self {
            time_min: Some(time_min),
            show_deleted: true,
            single_events: true,
            ..Default::default()
        }
    }

    pub fn with_page(&self, page_token: Option<String>) -> Self {
        Self {
            page_token,
            ..self.clone()
        }
    }
}

/// Calendar provider operations used by the sync engine. `token` is a bearer access token.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// Every calendar on the user's list, all pages.
    async fn list_calendars(&self, token: &str) -> Result<Vec<CalendarListEntry>, ProviderError>;

    async fn get_calendar(&self, token: &str, calendar_id: &str)
    -> Result<Calendar, ProviderError>;

    async fn insert_calendar(
        &self,
        token: &str,
        calendar: &Calendar,
    ) -> Result<Calendar, ProviderError>;

    async fn list_acl(&self, token: &str, calendar_id: &str) -> Result<Vec<AclRule>, ProviderError>;

    async fn insert_acl(
        &self,
        token: &str,
        calendar_id: &str,
        rule: &AclRule,
    ) -> Result<AclRule, ProviderError>;

    async fn get_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, ProviderError>;

    async fn insert_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, ProviderError>;

    /// Partial update; with `if_match` the provider answers 412 when the etag is stale.
    async fn patch_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &CalendarEvent,
        if_match: Option<&str>,
    ) -> Result<CalendarEvent, ProviderError>;

    async fn delete_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError>;

    /// Atomically move an event to `destination`, keeping its id.
    async fn move_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        destination: &str,
    ) -> Result<CalendarEvent, ProviderError>;

    /// One page of events. A rejected `sync_token` yields [`ProviderError::CursorInvalidated`].
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &EventsQuery,
    ) -> Result<EventsPage, ProviderError>;

    async fn watch_events(
        &self,
        token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> Result<Channel, ProviderError>;

    async fn stop_channel(
        &self,
        token: &str,
        request: &StopChannelRequest,
    ) -> Result<(), ProviderError>;
}
