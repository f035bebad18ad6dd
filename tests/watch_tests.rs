mod common;

use caresync::config::{ManagedCalendarConfig, ProviderConfig, SyncConfig, WatchConfig};
use caresync::db::{CredentialPatch, DbActorHandle};
use caresync::error::{ProviderError, SyncError};
use caresync::orchestrator::{SyncTrigger, poll_once};
use caresync::provider::{CalendarApi, TokenSource};
use caresync::sync::SyncService;
use caresync::watch::{Notification, NotificationOutcome, WatchManager};
use common::*;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

const DEBOUNCE: Duration = Duration::from_millis(750);

#[derive(Default)]
struct RecordingTrigger {
    scheduled: Mutex<Vec<(String, Option<Duration>)>>,
}

impl RecordingTrigger {
    fn users(&self) -> Vec<String> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(u, _)| u.clone())
            .collect()
    }
}

impl SyncTrigger for RecordingTrigger {
    fn schedule_sync(&self, user_id: &str, debounce: Option<Duration>) -> Result<(), SyncError> {
        self.scheduled
            .lock()
            .unwrap()
            .push((user_id.to_string(), debounce));
        Ok(())
    }
}

fn watch_config() -> WatchConfig {
    WatchConfig {
        webhook_url: Some(Url::parse("https://caresync.example.org/calendar/notifications").unwrap()),
        ..Default::default()
    }
}

fn tokens(db: &DbActorHandle) -> TokenSource {
    TokenSource::new(db.clone(), &ProviderConfig::default(), reqwest::Client::new()).unwrap()
}

async fn setup(prefix: &str, cfg: WatchConfig) -> (DbActorHandle, FakeCalendar, WatchManager) {
    let db = spawn_db(prefix).await;
    connect_user(&db, USER, Some(EMAIL)).await;
    let fake = FakeCalendar::new();
    let watch = WatchManager::new(Arc::new(fake.clone()), db.clone(), tokens(&db), cfg, DEBOUNCE);
    (db, fake, watch)
}

fn notification_for(channel: &caresync::db::WatchChannel, state: &str) -> Notification {
    Notification {
        channel_id: channel.channel_id.clone(),
        resource_id: channel.resource_id.clone(),
        resource_state: state.to_string(),
        channel_token: Some(channel.channel_token.clone()),
        message_number: Some(2),
    }
}

#[tokio::test]
async fn ensure_watch_is_idempotent() {
    let (db, fake, watch) = setup("watch-idempotent", watch_config()).await;
    let token = token_for(USER);

    let first = watch.ensure_watch(USER, &token, "primary", USER).await.unwrap();
    let second = watch.ensure_watch(USER, &token, "primary", USER).await.unwrap();

    assert_eq!(first.channel_id, second.channel_id);
    assert_eq!(fake.count_calls("watch_events"), 1);
    assert!(first.channel_token.starts_with(&format!("{USER}:")));
    assert!(first.expiration.is_some());
    assert_eq!(db.list_channels_for_user(USER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn channel_inside_the_renewal_window_is_replaced() {
    let cfg = WatchConfig {
        channel_ttl_secs: 60,
        renew_threshold_secs: 3_600,
        ..watch_config()
    };
    let (db, fake, watch) = setup("watch-renew-window", cfg).await;
    let token = token_for(USER);

    let first = watch.ensure_watch(USER, &token, "primary", USER).await.unwrap();
    let second = watch.ensure_watch(USER, &token, "primary", USER).await.unwrap();

    assert_ne!(first.channel_id, second.channel_id);
    assert_eq!(fake.stopped_channels(), vec![first.channel_id.clone()]);
    let stored = db.list_channels_for_user(USER).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].channel_id, second.channel_id);
}

#[tokio::test]
async fn switching_calendars_retires_the_old_channel_even_if_stop_fails() {
    let (db, fake, watch) = setup("watch-switch", watch_config()).await;
    fake.add_calendar("cal-managed", "CareSync", "owner");
    let token = token_for(USER);

    let old = watch.ensure_watch(USER, &token, "primary", USER).await.unwrap();
    fake.fail_next(
        "stop_channel",
        ProviderError::Server {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            message: "backend".to_string(),
        },
    );
    let new = watch
        .ensure_watch(USER, &token, "cal-managed", USER)
        .await
        .unwrap();

    assert_eq!(new.calendar_id, "cal-managed");
    let stored = db.list_channels_for_user(USER).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].channel_id, new.channel_id);
    assert!(db.get_channel(&old.channel_id).await.unwrap().is_none());
}

#[tokio::test]
async fn watch_requires_a_webhook_address() {
    let (_db, fake, watch) = setup("watch-no-address", WatchConfig::default()).await;
    let err = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unexpected(_)));
    assert_eq!(fake.count_calls("watch_events"), 0);
}

#[tokio::test]
async fn verified_notification_schedules_a_debounced_sync() {
    let (_db, _fake, watch) = setup("watch-notify", watch_config()).await;
    let channel = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();
    let trigger = RecordingTrigger::default();

    let outcome = watch
        .handle_notification(&notification_for(&channel, "exists"), &trigger)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        NotificationOutcome::Scheduled {
            user_id: USER.to_string()
        }
    );
    assert_eq!(
        *trigger.scheduled.lock().unwrap(),
        vec![(USER.to_string(), Some(DEBOUNCE))]
    );
}

#[tokio::test]
async fn handshake_and_forged_notifications_do_not_schedule() {
    let (_db, _fake, watch) = setup("watch-verify", watch_config()).await;
    let channel = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();
    let trigger = RecordingTrigger::default();

    let handshake = watch
        .handle_notification(&notification_for(&channel, "sync"), &trigger)
        .await
        .unwrap();
    assert_eq!(handshake, NotificationOutcome::Handshake);

    let mut wrong_token = notification_for(&channel, "exists");
    wrong_token.channel_token = Some(format!("{USER}:forged"));
    assert_eq!(
        watch.handle_notification(&wrong_token, &trigger).await.unwrap(),
        NotificationOutcome::Rejected
    );

    let mut no_token = notification_for(&channel, "exists");
    no_token.channel_token = None;
    assert_eq!(
        watch.handle_notification(&no_token, &trigger).await.unwrap(),
        NotificationOutcome::Rejected
    );

    let mut wrong_resource = notification_for(&channel, "exists");
    wrong_resource.resource_id = "res-other".to_string();
    assert_eq!(
        watch.handle_notification(&wrong_resource, &trigger).await.unwrap(),
        NotificationOutcome::Rejected
    );

    let mut unknown = notification_for(&channel, "exists");
    unknown.channel_id = "no-such-channel".to_string();
    assert_eq!(
        watch.handle_notification(&unknown, &trigger).await.unwrap(),
        NotificationOutcome::UnknownChannel
    );

    assert!(trigger.users().is_empty());
}

#[tokio::test]
async fn notifications_resolve_channels_persisted_by_another_instance() {
    let (db, fake, watch) = setup("watch-cold-cache", watch_config()).await;
    let channel = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();

    let restarted = WatchManager::new(Arc::new(fake), db.clone(), tokens(&db), watch_config(), DEBOUNCE);
    let trigger = RecordingTrigger::default();
    let outcome = restarted
        .handle_notification(&notification_for(&channel, "exists"), &trigger)
        .await
        .unwrap();
    assert!(matches!(outcome, NotificationOutcome::Scheduled { .. }));
}

#[tokio::test]
async fn retire_calendars_stops_only_matching_channels() {
    let (db, fake, watch) = setup("watch-retire", watch_config()).await;
    let channel = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();

    let untouched = watch
        .retire_calendars(USER, &token_for(USER), &["cal-other".to_string()])
        .await
        .unwrap();
    assert_eq!(untouched, 0);

    let retired = watch
        .retire_calendars(USER, &token_for(USER), &["primary".to_string()])
        .await
        .unwrap();
    assert_eq!(retired, 1);
    assert!(db.list_channels_for_user(USER).await.unwrap().is_empty());
    assert_eq!(fake.stopped_channels(), vec![channel.channel_id]);
}

#[tokio::test]
async fn renewal_recreates_only_expiring_channels() {
    let cfg = WatchConfig {
        channel_ttl_secs: 60,
        renew_threshold_secs: 3_600,
        renew_tps: 50,
        ..watch_config()
    };
    let (db, _fake, watch) = setup("watch-renew", cfg).await;
    db.patch_credential(
        USER,
        CredentialPatch {
            calendar_id: Some(Some("primary".to_string())),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let old = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();

    let report = watch.renew_expiring().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.renewed, 1);
    assert_eq!(report.failed, 0);

    let stored = db.list_channels_for_user(USER).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_ne!(stored[0].channel_id, old.channel_id);
    assert_eq!(stored[0].calendar_id, "primary");
}

#[tokio::test]
async fn concurrent_watch_requests_share_one_channel() {
    let (db, fake, watch) = setup("watch-concurrent", watch_config()).await;
    let token = token_for(USER);

    let (a, b, c) = tokio::join!(
        watch.ensure_watch(USER, &token, "primary", USER),
        watch.ensure_watch(USER, &token, "primary", USER),
        watch.ensure_watch(USER, &token, "primary", USER),
    );
    let ids = [a.unwrap(), b.unwrap(), c.unwrap()].map(|c| c.channel_id);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(fake.count_calls("watch_events"), 1);
    assert_eq!(db.list_channels_for_user(USER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn renewal_racing_a_sync_run_leaves_one_active_channel() {
    let cfg = WatchConfig {
        channel_ttl_secs: 60,
        renew_threshold_secs: 3_600,
        ..watch_config()
    };
    let (db, fake, watch) = setup("watch-renew-race", cfg).await;
    db.patch_credential(
        USER,
        CredentialPatch {
            calendar_id: Some(Some("primary".to_string())),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let token = token_for(USER);
    watch.ensure_watch(USER, &token, "primary", USER).await.unwrap();

    let (ensured, report) = tokio::join!(
        watch.ensure_watch(USER, &token, "primary", USER),
        watch.renew_expiring(),
    );
    ensured.unwrap();
    assert_eq!(report.unwrap().failed, 0);

    let stored = db.list_channels_for_user(USER).await.unwrap();
    assert_eq!(stored.len(), 1);
    let active = fake.channels();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].1.id, stored[0].channel_id);
}

#[tokio::test]
async fn renewal_skips_channels_far_from_expiry() {
    let (_db, fake, watch) = setup("watch-renew-none", watch_config()).await;
    watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();
    fake.clear_calls();

    let report = watch.renew_expiring().await.unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(fake.count_calls("watch_events"), 0);
}

#[tokio::test]
async fn sync_run_keeps_a_channel_on_the_managed_calendar() {
    let (db, fake, watch) = setup("watch-sync-run", watch_config()).await;
    let legacy = watch
        .ensure_watch(USER, &token_for(USER), "primary", USER)
        .await
        .unwrap();

    let api: Arc<dyn CalendarApi> = Arc::new(fake.clone());
    let service = SyncService::new(
        api,
        db.clone(),
        Arc::new(db.clone()),
        tokens(&db),
        &SyncConfig::default(),
        &ManagedCalendarConfig::default(),
    )
    .with_watch(watch.clone());

    service.sync_user(USER).await.unwrap();
    let managed = db
        .get_credential(USER)
        .await
        .unwrap()
        .unwrap()
        .managed_calendar_id
        .unwrap();
    let stored = db.list_channels_for_user(USER).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].calendar_id, managed);
    assert!(fake.stopped_channels().contains(&legacy.channel_id));

    fake.clear_calls();
    service.sync_user(USER).await.unwrap();
    assert_eq!(fake.count_calls("watch_events"), 0);
}

#[tokio::test]
async fn poll_tick_schedules_every_connected_user() {
    let db = spawn_db("poll-once").await;
    connect_user(&db, "u1", None).await;
    connect_user(&db, "u2", None).await;
    connect_user(&db, "u3", None).await;
    db.patch_credential(
        "u3",
        CredentialPatch {
            needs_reauth: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let trigger = RecordingTrigger::default();
    let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(100).unwrap()));
    let scheduled = poll_once(&db, &trigger, &limiter, DEBOUNCE).await;

    assert_eq!(scheduled, 2);
    assert_eq!(trigger.users(), vec!["u1".to_string(), "u2".to_string()]);
    assert!(
        trigger
            .scheduled
            .lock()
            .unwrap()
            .iter()
            .all(|(_, d)| *d == Some(DEBOUNCE))
    );
}
