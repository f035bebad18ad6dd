use super::policy::classify_response;
use super::{CalendarApi, EventsQuery};
use crate::config::ProviderConfig;
use crate::error::{IsRetryable, ProviderError};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use caresync_schema::{
    AclListPage, AclRule, Calendar, CalendarEvent, CalendarListEntry, CalendarListPage, Channel,
    EventsPage, StopChannelRequest, WatchRequest,
};
use reqwest::header::{CONNECTION, HeaderMap, HeaderValue, IF_MATCH};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const CARESYNC_USER_AGENT: &str = concat!("caresync/", env!("CARGO_PKG_VERSION"));

/// Build the shared reqwest client for provider and token-endpoint calls.
pub fn build_http_client(cfg: &ProviderConfig) -> reqwest::Client {
    let mut headers = HeaderMap::new();

    let mut builder = reqwest::Client::builder()
        .user_agent(CARESYNC_USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(cfg.request_timeout_secs));

    if let Some(proxy_url) = &cfg.proxy {
        let proxy =
            reqwest::Proxy::all(proxy_url.as_str()).expect("invalid proxy url for reqwest client");
        builder = builder.proxy(proxy);
    }

    if !cfg.enable_multiplexing {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        builder = builder
            .http1_only()
            .pool_max_idle_per_host(0)
            .pool_idle_timeout(Duration::from_secs(0));
    } else {
        builder = builder.http2_adaptive_window(true);
    }

    builder
        .default_headers(headers)
        .build()
        .expect("failed to build reqwest client")
}

/// [`CalendarApi`] over the provider's REST surface.
#[derive(Clone)]
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    api_url: Url,
    retry_policy: ExponentialBuilder,
}

impl GoogleCalendarClient {
    pub fn new(cfg: &ProviderConfig, http: reqwest::Client) -> Self {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_max_times(cfg.retry_max_times)
            .with_jitter();
        Self {
            http,
            api_url: cfg.api_url.clone(),
            retry_policy,
        }
    }

    /// `api_url` + percent-encoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send with transient-failure retries; non-success statuses come back classified.
    async fn execute<F>(&self, op: &'static str, build: F) -> Result<reqwest::Response, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        (|| async {
            let resp = build().send().await?;
            if resp.status().is_success() {
                return Ok(resp);
            }
            Err(classify_response(op, resp).await)
        })
        .retry(self.retry_policy)
        .when(|err: &ProviderError| err.is_retryable())
        .notify(|err, dur: Duration| {
            warn!(op, error = %err, "Provider call failed, retry after {:?}", dur);
        })
        .await
    }

    async fn execute_json<T, F>(&self, op: &'static str, build: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let resp = self.execute(op, build).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn list_calendars(&self, token: &str) -> Result<Vec<CalendarListEntry>, ProviderError> {
        let url = self.endpoint(&["users", "me", "calendarList"])?;
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page: CalendarListPage = self
                .execute_json("calendarList.list", || {
                    let mut req = self.http.get(url.clone()).bearer_auth(token);
                    if let Some(pt) = &page_token {
                        req = req.query(&[("pageToken", pt.as_str())]);
                    }
                    req
                })
                .await?;
            entries.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn get_calendar(
        &self,
        token: &str,
        calendar_id: &str,
    ) -> Result<Calendar, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id])?;
        self.execute_json("calendars.get", || {
            self.http.get(url.clone()).bearer_auth(token)
        })
        .await
    }

    async fn insert_calendar(
        &self,
        token: &str,
        calendar: &Calendar,
    ) -> Result<Calendar, ProviderError> {
        let url = self.endpoint(&["calendars"])?;
        self.execute_json("calendars.insert", || {
            self.http.post(url.clone()).bearer_auth(token).json(calendar)
        })
        .await
    }

    async fn list_acl(&self, token: &str, calendar_id: &str) -> Result<Vec<AclRule>, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "acl"])?;
        let mut rules = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page: AclListPage = self
                .execute_json("acl.list", || {
                    let mut req = self.http.get(url.clone()).bearer_auth(token);
                    if let Some(pt) = &page_token {
                        req = req.query(&[("pageToken", pt.as_str())]);
                    }
                    req
                })
                .await?;
            rules.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(rules)
    }

    async fn insert_acl(
        &self,
        token: &str,
        calendar_id: &str,
        rule: &AclRule,
    ) -> Result<AclRule, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "acl"])?;
        self.execute_json("acl.insert", || {
            self.http
                .post(url.clone())
                .bearer_auth(token)
                .query(&[("sendNotifications", "false")])
                .json(rule)
        })
        .await
    }

    async fn get_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id])?;
        self.execute_json("events.get", || {
            self.http.get(url.clone()).bearer_auth(token)
        })
        .await
    }

    async fn insert_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        self.execute_json("events.insert", || {
            self.http.post(url.clone()).bearer_auth(token).json(event)
        })
        .await
    }

    async fn patch_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &CalendarEvent,
        if_match: Option<&str>,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id])?;
        self.execute_json("events.patch", || {
            let mut req = self.http.patch(url.clone()).bearer_auth(token).json(event);
            if let Some(etag) = if_match {
                req = req.header(IF_MATCH, etag);
            }
            req
        })
        .await
    }

    async fn delete_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id])?;
        self.execute("events.delete", || {
            self.http.delete(url.clone()).bearer_auth(token)
        })
        .await?;
        Ok(())
    }

    async fn move_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        destination: &str,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id, "move"])?;
        self.execute_json("events.move", || {
            self.http
                .post(url.clone())
                .bearer_auth(token)
                .query(&[("destination", destination)])
        })
        .await
    }

    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &EventsQuery,
    ) -> Result<EventsPage, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(st) = &query.sync_token {
            params.push(("syncToken", st.clone()));
        }
        if let Some(pt) = &query.page_token {
            params.push(("pageToken", pt.clone()));
        }
        if let Some(min) = query.time_min {
            params.push(("timeMin", min.to_rfc3339()));
        }
        if query.show_deleted {
            params.push(("showDeleted", "true".to_string()));
        }
        if query.single_events {
            params.push(("singleEvents", "true".to_string()));
        }
        if let Some(max) = query.max_results {
            params.push(("maxResults", max.to_string()));
        }

        let result = self
            .execute_json("events.list", || {
                self.http.get(url.clone()).bearer_auth(token).query(&params)
            })
            .await;

        match result {
            // Any 410 on an incremental request means the cursor expired.
            Err(ProviderError::Gone) if query.sync_token.is_some() => {
                debug!(calendar_id, "Incremental list answered 410");
                Err(ProviderError::CursorInvalidated)
            }
            other => other,
        }
    }

    async fn watch_events(
        &self,
        token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> Result<Channel, ProviderError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", "watch"])?;
        self.execute_json("events.watch", || {
            self.http.post(url.clone()).bearer_auth(token).json(request)
        })
        .await
    }

    async fn stop_channel(
        &self,
        token: &str,
        request: &StopChannelRequest,
    ) -> Result<(), ProviderError> {
        let url = self.endpoint(&["channels", "stop"])?;
        self.execute("channels.stop", || {
            self.http.post(url.clone()).bearer_auth(token).json(request)
        })
        .await?;
        Ok(())
    }
}
