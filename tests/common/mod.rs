#![allow(dead_code)]

use async_trait::async_trait;
use caresync::db::{CredentialUpsert, DbActorHandle};
use caresync::error::ProviderError;
use caresync::provider::{CalendarApi, EventsQuery};
use caresync::sync::{Appointment, AppointmentStatus, Bill, BillStatus, EntityStore, SyncEntity};
use caresync_schema::{
    AclRule, Calendar, CalendarEvent, CalendarListEntry, Channel, EventStatus, EventsPage,
    StopChannelRequest, WatchRequest,
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const USER: &str = "user-1";
pub const EMAIL: &str = "pat@example.org";
pub const PAGE_SIZE: usize = 2;

pub fn unique_sqlite_path(prefix: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();

    let mut temp_path = std::env::temp_dir();
    temp_path.push(format!(
        "caresync-{prefix}-{}-{}.sqlite",
        std::process::id(),
        nanos
    ));
    temp_path
}

pub async fn spawn_db(prefix: &str) -> DbActorHandle {
    let path = unique_sqlite_path(prefix);
    let database_url = format!("sqlite:{}", path.to_str().unwrap());
    caresync::db::spawn(&database_url).await
}

/// Credential whose access token stays valid for the whole test.
pub async fn connect_user(db: &DbActorHandle, user_id: &str, email: Option<&str>) {
    db.upsert_credential(CredentialUpsert {
        user_id: user_id.to_string(),
        access_token: Some(format!("at-{user_id}")),
        refresh_token: format!("rt-{user_id}"),
        scope: Some("https://www.googleapis.com/auth/calendar".to_string()),
        expires_at: Some(Utc::now() + Duration::days(30)),
        account_email: email.map(str::to_string),
    })
    .await
    .unwrap();
}

pub fn appointment(id: &str, user_id: &str, title: &str) -> Appointment {
    Appointment {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: title.to_string(),
        starts_at: Utc.with_ymd_and_hms(2031, 3, 1, 9, 0, 0).unwrap(),
        ends_at: Utc.with_ymd_and_hms(2031, 3, 1, 10, 0, 0).unwrap(),
        location: Some("Clinic A".to_string()),
        notes: Some("Bring referral".to_string()),
        status: AppointmentStatus::Scheduled,
        updated_at: Utc::now(),
    }
}

pub fn bill(id: &str, user_id: &str, title: &str, amount_cents: i64) -> Bill {
    Bill {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: title.to_string(),
        amount_cents,
        currency: "EUR".to_string(),
        due_date: NaiveDate::from_ymd_opt(2031, 4, 10).unwrap(),
        status: BillStatus::Pending,
        updated_at: Utc::now(),
    }
}

pub async fn put_appointment(db: &DbActorHandle, a: Appointment) {
    db.upsert_entity(SyncEntity::Appointment(a)).await.unwrap();
}

pub async fn put_bill(db: &DbActorHandle, b: Bill) {
    db.upsert_entity(SyncEntity::Bill(b)).await.unwrap();
}

pub async fn get_appointment(db: &DbActorHandle, id: &str) -> Appointment {
    match db.get_entity(id).await.unwrap() {
        Some(SyncEntity::Appointment(a)) => a,
        other => panic!("expected appointment {id}, got {other:?}"),
    }
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event: CalendarEvent,
    seq: u64,
}

#[derive(Debug, Clone, Default)]
struct FakeCalendarData {
    entry: CalendarListEntry,
    events: BTreeMap<String, StoredEvent>,
    acl: Vec<AclRule>,
}

#[derive(Debug, Default)]
struct FakeState {
    calendars: BTreeMap<String, FakeCalendarData>,
    next_id: u64,
    seq: u64,
    calls: Vec<String>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    failures_after_commit: HashMap<&'static str, VecDeque<ProviderError>>,
    invalidate_sync_tokens: bool,
    channels: Vec<(String, Channel)>,
    stopped: Vec<String>,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn take_failure(&mut self, op: &'static str) -> Option<ProviderError> {
        self.failures.get_mut(op).and_then(VecDeque::pop_front)
    }

    fn take_failure_after_commit(&mut self, op: &'static str) -> Option<ProviderError> {
        self.failures_after_commit
            .get_mut(op)
            .and_then(VecDeque::pop_front)
    }

    fn calendar(&mut self, calendar_id: &str) -> Result<&mut FakeCalendarData, ProviderError> {
        self.calendars
            .get_mut(calendar_id)
            .ok_or(ProviderError::NotFound)
    }
}

/// In-memory calendar provider. Etags change on every write, deletions stay visible to
/// incremental listings as cancelled events, and sync tokens encode a change sequence.
#[derive(Clone, Default)]
pub struct FakeCalendar {
    state: Arc<Mutex<FakeState>>,
}

fn etag(seq: u64) -> String {
    format!("\"etag-{seq}\"")
}

impl FakeCalendar {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.add_calendar("primary", "pat@example.org", "owner");
        fake
    }

    pub fn add_calendar(&self, id: &str, summary: &str, access_role: &str) {
        let mut state = self.state.lock().unwrap();
        state.calendars.insert(
            id.to_string(),
            FakeCalendarData {
                entry: CalendarListEntry {
                    id: id.to_string(),
                    summary: Some(summary.to_string()),
                    access_role: Some(access_role.to_string()),
                    primary: Some(id == "primary"),
                },
                ..Default::default()
            },
        );
    }

    pub fn remove_calendar(&self, id: &str) {
        self.state.lock().unwrap().calendars.remove(id);
    }

    pub fn calendar_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().calendars.keys().cloned().collect()
    }

    /// Fail the next call of `op` (the trait method name) with `err`.
    pub fn fail_next(&self, op: &'static str, err: ProviderError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Apply the next call of `op`, then report `err` as if the response was lost.
    pub fn fail_after_commit(&self, op: &'static str, err: ProviderError) {
        self.state
            .lock()
            .unwrap()
            .failures_after_commit
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn invalidate_sync_tokens(&self, on: bool) {
        self.state.lock().unwrap().invalidate_sync_tokens = on;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == op)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Live (not cancelled) events of one calendar.
    pub fn live_events(&self, calendar_id: &str) -> Vec<CalendarEvent> {
        let state = self.state.lock().unwrap();
        state
            .calendars
            .get(calendar_id)
            .map(|c| {
                c.events
                    .values()
                    .filter(|s| !s.event.is_cancelled())
                    .map(|s| s.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn event(&self, calendar_id: &str, event_id: &str) -> Option<CalendarEvent> {
        let state = self.state.lock().unwrap();
        state
            .calendars
            .get(calendar_id)
            .and_then(|c| c.events.get(event_id))
            .map(|s| s.event.clone())
    }

    /// Simulate an edit made in the calendar UI.
    pub fn edit_event(&self, calendar_id: &str, event_id: &str, edit: impl FnOnce(&mut CalendarEvent)) {
        self.edit_event_at(calendar_id, event_id, Utc::now(), edit);
    }

    /// Like [`FakeCalendar::edit_event`], with the provider's `updated` stamp set to `updated`.
    pub fn edit_event_at(
        &self,
        calendar_id: &str,
        event_id: &str,
        updated: DateTime<Utc>,
        edit: impl FnOnce(&mut CalendarEvent),
    ) {
        let mut state = self.state.lock().unwrap();
        let seq = state.bump();
        let stored = state
            .calendars
            .get_mut(calendar_id)
            .and_then(|c| c.events.get_mut(event_id))
            .expect("event to edit");
        edit(&mut stored.event);
        stored.event.etag = Some(etag(seq));
        stored.event.updated = Some(updated);
        stored.seq = seq;
    }

    /// Simulate a deletion made in the calendar UI.
    pub fn delete_out_of_band(&self, calendar_id: &str, event_id: &str) {
        let mut state = self.state.lock().unwrap();
        let seq = state.bump();
        let stored = state
            .calendars
            .get_mut(calendar_id)
            .and_then(|c| c.events.get_mut(event_id))
            .expect("event to delete");
        stored.event.status = Some(EventStatus::Cancelled);
        stored.event.etag = Some(etag(seq));
        stored.event.updated = Some(Utc::now());
        stored.seq = seq;
    }

    /// Create an event directly, bypassing the call log.
    pub fn seed_event(&self, calendar_id: &str, mut event: CalendarEvent) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next("evt");
        let seq = state.bump();
        event.id = Some(id.clone());
        event.etag = Some(etag(seq));
        event.updated = Some(Utc::now());
        event.status.get_or_insert(EventStatus::Confirmed);
        state
            .calendars
            .get_mut(calendar_id)
            .expect("calendar to seed")
            .events
            .insert(id.clone(), StoredEvent { event, seq });
        id
    }

    pub fn acl(&self, calendar_id: &str) -> Vec<AclRule> {
        let state = self.state.lock().unwrap();
        state
            .calendars
            .get(calendar_id)
            .map(|c| c.acl.clone())
            .unwrap_or_default()
    }

    pub fn grant_acl(&self, calendar_id: &str, email: &str, role: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.next("acl");
        state
            .calendars
            .get_mut(calendar_id)
            .expect("calendar for acl")
            .acl
            .push(AclRule {
                id: Some(id),
                role: role.to_string(),
                scope: caresync_schema::AclScope::user(email),
            });
    }

    /// Simulate the owner removing the share in the calendar UI.
    pub fn revoke_acl(&self, calendar_id: &str) {
        if let Some(c) = self.state.lock().unwrap().calendars.get_mut(calendar_id) {
            c.acl.clear();
        }
    }

    pub fn channels(&self) -> Vec<(String, Channel)> {
        self.state.lock().unwrap().channels.clone()
    }

    pub fn stopped_channels(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// Record the call and return an injected failure, if any.
    fn enter(&self, op: &'static str) -> Result<std::sync::MutexGuard<'_, FakeState>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op.to_string());
        match state.take_failure(op) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

fn merge(target: &mut CalendarEvent, patch: &CalendarEvent) {
    if patch.summary.is_some() {
        target.summary = patch.summary.clone();
    }
    if patch.description.is_some() {
        target.description = patch.description.clone().filter(|s| !s.is_empty());
    }
    if patch.location.is_some() {
        target.location = patch.location.clone().filter(|s| !s.is_empty());
    }
    if patch.start.is_some() {
        target.start = patch.start.clone();
    }
    if patch.end.is_some() {
        target.end = patch.end.clone();
    }
    if patch.status.is_some() {
        target.status = patch.status;
    }
    if patch.extended_properties.is_some() {
        target.extended_properties = patch.extended_properties.clone();
    }
}

#[async_trait]
impl CalendarApi for FakeCalendar {
    async fn list_calendars(&self, _token: &str) -> Result<Vec<CalendarListEntry>, ProviderError> {
        let state = self.enter("list_calendars")?;
        Ok(state.calendars.values().map(|c| c.entry.clone()).collect())
    }

    async fn get_calendar(
        &self,
        _token: &str,
        calendar_id: &str,
    ) -> Result<Calendar, ProviderError> {
        let mut state = self.enter("get_calendar")?;
        let data = state.calendar(calendar_id)?;
        Ok(Calendar {
            id: Some(data.entry.id.clone()),
            summary: data.entry.summary.clone().unwrap_or_default(),
            description: None,
            time_zone: Some("UTC".to_string()),
        })
    }

    async fn insert_calendar(
        &self,
        _token: &str,
        calendar: &Calendar,
    ) -> Result<Calendar, ProviderError> {
        let mut state = self.enter("insert_calendar")?;
        let id = state.next("cal");
        state.calendars.insert(
            id.clone(),
            FakeCalendarData {
                entry: CalendarListEntry {
                    id: id.clone(),
                    summary: Some(calendar.summary.clone()),
                    access_role: Some("owner".to_string()),
                    primary: Some(false),
                },
                ..Default::default()
            },
        );
        Ok(Calendar {
            id: Some(id),
            ..calendar.clone()
        })
    }

    async fn list_acl(&self, _token: &str, calendar_id: &str) -> Result<Vec<AclRule>, ProviderError> {
        let mut state = self.enter("list_acl")?;
        Ok(state.calendar(calendar_id)?.acl.clone())
    }

    async fn insert_acl(
        &self,
        _token: &str,
        calendar_id: &str,
        rule: &AclRule,
    ) -> Result<AclRule, ProviderError> {
        let mut state = self.enter("insert_acl")?;
        let id = state.next("acl");
        let rule = AclRule {
            id: Some(id),
            ..rule.clone()
        };
        state.calendar(calendar_id)?.acl.push(rule.clone());
        Ok(rule)
    }

    async fn get_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, ProviderError> {
        let mut state = self.enter("get_event")?;
        let stored = state
            .calendar(calendar_id)?
            .events
            .get(event_id)
            .ok_or(ProviderError::NotFound)?;
        if stored.event.is_cancelled() {
            return Err(ProviderError::Gone);
        }
        Ok(stored.event.clone())
    }

    async fn insert_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        let mut state = self.enter("insert_event")?;
        let id = match event.id.clone() {
            Some(id) if state.calendar(calendar_id)?.events.contains_key(&id) => {
                return Err(ProviderError::AlreadyExists);
            }
            Some(id) => id,
            None => {
                state.calendar(calendar_id)?;
                state.next("evt")
            }
        };
        let seq = state.bump();
        let mut created = CalendarEvent::default();
        merge(&mut created, event);
        created.id = Some(id.clone());
        created.etag = Some(etag(seq));
        created.updated = Some(Utc::now());
        created.status.get_or_insert(EventStatus::Confirmed);
        state.calendar(calendar_id)?.events.insert(
            id,
            StoredEvent {
                event: created.clone(),
                seq,
            },
        );
        match state.take_failure_after_commit("insert_event") {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    async fn patch_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &CalendarEvent,
        if_match: Option<&str>,
    ) -> Result<CalendarEvent, ProviderError> {
        let mut state = self.enter("patch_event")?;
        let seq = state.bump();
        let stored = state
            .calendar(calendar_id)?
            .events
            .get_mut(event_id)
            .ok_or(ProviderError::NotFound)?;
        if stored.event.is_cancelled() {
            return Err(ProviderError::Gone);
        }
        if let Some(expected) = if_match
            && stored.event.etag.as_deref() != Some(expected)
        {
            return Err(ProviderError::PreconditionFailed);
        }
        merge(&mut stored.event, event);
        stored.event.etag = Some(etag(seq));
        stored.event.updated = Some(Utc::now());
        stored.seq = seq;
        Ok(stored.event.clone())
    }

    async fn delete_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("delete_event")?;
        let seq = state.bump();
        let stored = state
            .calendar(calendar_id)?
            .events
            .get_mut(event_id)
            .ok_or(ProviderError::NotFound)?;
        if stored.event.is_cancelled() {
            return Err(ProviderError::Gone);
        }
        stored.event.status = Some(EventStatus::Cancelled);
        stored.event.etag = Some(etag(seq));
        stored.event.updated = Some(Utc::now());
        stored.seq = seq;
        Ok(())
    }

    async fn move_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
        destination: &str,
    ) -> Result<CalendarEvent, ProviderError> {
        let mut state = self.enter("move_event")?;
        state.calendar(destination)?;
        let seq = state.bump();
        let source = state.calendar(calendar_id)?;
        let mut moved = source
            .events
            .get(event_id)
            .filter(|s| !s.event.is_cancelled())
            .ok_or(ProviderError::NotFound)?
            .event
            .clone();
        // The source keeps a cancelled tombstone.
        if let Some(stored) = source.events.get_mut(event_id) {
            stored.event.status = Some(EventStatus::Cancelled);
            stored.seq = seq;
        }
        moved.etag = Some(etag(seq));
        moved.updated = Some(Utc::now());
        state.calendar(destination)?.events.insert(
            event_id.to_string(),
            StoredEvent {
                event: moved.clone(),
                seq,
            },
        );
        Ok(moved)
    }

    async fn list_events(
        &self,
        _token: &str,
        calendar_id: &str,
        query: &EventsQuery,
    ) -> Result<EventsPage, ProviderError> {
        let mut state = self.enter("list_events")?;
        let since = match query.sync_token.as_deref() {
            Some(token) => {
                if state.invalidate_sync_tokens {
                    return Err(ProviderError::CursorInvalidated);
                }
                Some(
                    token
                        .strip_prefix("sync-")
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or(ProviderError::CursorInvalidated)?,
                )
            }
            None => None,
        };
        let current = state.seq;
        let data = state.calendar(calendar_id)?;
        let matching: Vec<CalendarEvent> = data
            .events
            .values()
            .filter(|s| match since {
                Some(since) => s.seq > since,
                None => query.show_deleted || !s.event.is_cancelled(),
            })
            .map(|s| s.event.clone())
            .collect();

        let offset = query
            .page_token
            .as_deref()
            .and_then(|p| p.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + PAGE_SIZE).min(matching.len());
        let items = matching[offset.min(end)..end].to_vec();
        let more = end < matching.len();
        Ok(EventsPage {
            items,
            next_page_token: more.then(|| end.to_string()),
            next_sync_token: (!more).then(|| format!("sync-{current}")),
        })
    }

    async fn watch_events(
        &self,
        _token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> Result<Channel, ProviderError> {
        let mut state = self.enter("watch_events")?;
        state.calendar(calendar_id)?;
        let resource_id = state.next("res");
        let ttl_secs = request
            .params
            .as_ref()
            .and_then(|p| p.ttl.parse::<i64>().ok())
            .unwrap_or(3_600);
        let expiration = (Utc::now() + Duration::seconds(ttl_secs)).timestamp_millis();
        let channel = Channel {
            id: request.id.clone(),
            resource_id,
            resource_uri: Some(format!("https://fake.test/calendars/{calendar_id}/events")),
            token: request.token.clone(),
            expiration: Some(expiration.to_string()),
        };
        state
            .channels
            .push((calendar_id.to_string(), channel.clone()));
        Ok(channel)
    }

    async fn stop_channel(
        &self,
        _token: &str,
        request: &StopChannelRequest,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("stop_channel")?;
        state.stopped.push(request.id.clone());
        state.channels.retain(|(_, c)| c.id != request.id);
        Ok(())
    }
}

/// Bearer token used by fixtures whose credential never needs a refresh.
pub fn token_for(user_id: &str) -> String {
    format!("at-{user_id}")
}

pub fn far_future() -> DateTime<Utc> {
    Utc::now() + Duration::days(365)
}
