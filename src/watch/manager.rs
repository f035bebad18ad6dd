use crate::config::WatchConfig;
use crate::db::{DbActorHandle, WatchChannel};
use crate::error::SyncError;
use crate::orchestrator::SyncTrigger;
use crate::provider::{CalendarApi, TokenSource};
use ahash::{AHashMap, AHashSet};
use base64::Engine;
use caresync_schema::{StopChannelRequest, WatchParams, WatchRequest};
use chrono::{Duration, Utc};
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use moka::sync::Cache;
use rand::RngCore;
use std::{
    num::NonZeroU32,
    sync::{Arc, Mutex, PoisonError},
};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

const CHANNEL_CACHE_CAPACITY: u64 = 10_000;
const CHANNEL_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Resource state the provider sends once, right after a channel is created.
pub const HANDSHAKE_STATE: &str = "sync";

/// Headers of one inbound push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel_id: String,
    pub resource_id: String,
    pub resource_state: String,
    pub channel_token: Option<String>,
    pub message_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Scheduled { user_id: String },
    Handshake,
    UnknownChannel,
    /// Token or resource id did not match the stored channel.
    Rejected,
}

/// Counts of one renewal sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub due: usize,
    pub renewed: usize,
    pub failed: usize,
}

fn channel_token(subject_id: &str) -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    format!(
        "{subject_id}:{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Push-notification channels per user, plus verification of inbound notifications.
#[derive(Clone)]
pub struct WatchManager {
    api: Arc<dyn CalendarApi>,
    db: DbActorHandle,
    tokens: TokenSource,
    cfg: WatchConfig,
    debounce: std::time::Duration,
    channels: Cache<String, WatchChannel>,
    limiter: Arc<DefaultDirectRateLimiter>,
    /// Held across list, stop and create so sync runs and the renewer never race on one user.
    user_locks: Arc<Mutex<AHashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl WatchManager {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        db: DbActorHandle,
        tokens: TokenSource,
        cfg: WatchConfig,
        debounce: std::time::Duration,
    ) -> Self {
        let tps = NonZeroU32::new(cfg.renew_tps).unwrap_or(NonZeroU32::MIN);
        let channels = Cache::builder()
            .time_to_live(CHANNEL_CACHE_TTL)
            .max_capacity(CHANNEL_CACHE_CAPACITY)
            .build();
        Self {
            api,
            db,
            tokens,
            cfg,
            debounce,
            channels,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(tps))),
            user_locks: Arc::default(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Entries nobody holds or waits on can go.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(user_id.to_string()).or_default().clone()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.cfg
    }

    fn renew_threshold(&self) -> Duration {
        Duration::seconds(self.cfg.renew_threshold_secs)
    }

    /// Make sure the user has a live channel on `calendar_id`. An existing channel outside the
    /// renewal window is returned as is.
    pub async fn ensure_watch(
        &self,
        user_id: &str,
        token: &str,
        calendar_id: &str,
        subject_id: &str,
    ) -> Result<WatchChannel, SyncError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let existing = self.db.list_channels_for_user(user_id).await?;
        if let Some(channel) = self.live_channel(&existing, calendar_id) {
            return Ok(channel);
        }
        self.recreate(user_id, token, calendar_id, subject_id, existing)
            .await
    }

    fn live_channel(&self, existing: &[WatchChannel], calendar_id: &str) -> Option<WatchChannel> {
        let now = Utc::now();
        existing
            .iter()
            .find(|c| c.calendar_id == calendar_id && !c.expires_within(now, self.renew_threshold()))
            .cloned()
    }

    async fn recreate(
        &self,
        user_id: &str,
        token: &str,
        calendar_id: &str,
        subject_id: &str,
        previous: Vec<WatchChannel>,
    ) -> Result<WatchChannel, SyncError> {
        let address = self
            .cfg
            .webhook_url
            .as_ref()
            .ok_or_else(|| SyncError::Unexpected("watch requires a webhook_url".to_string()))?;

        for channel in &previous {
            self.retire(token, channel).await?;
        }

        let request = WatchRequest {
            id: uuid::Uuid::new_v4().to_string(),
            kind: "web_hook".to_string(),
            address: address.to_string(),
            token: Some(channel_token(subject_id)),
            params: Some(WatchParams {
                ttl: self.cfg.channel_ttl_secs.to_string(),
            }),
        };
        let created = self.api.watch_events(token, calendar_id, &request).await?;

        let channel = WatchChannel {
            channel_id: created.id.clone(),
            user_id: user_id.to_string(),
            calendar_id: calendar_id.to_string(),
            resource_id: created.resource_id.clone(),
            resource_uri: created.resource_uri.clone(),
            expiration: created.expiration_at(),
            channel_token: request.token.unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.db.insert_channel(channel.clone()).await?;
        self.channels
            .insert(channel.channel_id.clone(), channel.clone());
        info!(
            user_id,
            calendar_id,
            channel_id = %channel.channel_id,
            expiration = ?channel.expiration,
            "Watch channel registered"
        );
        Ok(channel)
    }

    /// Stop (best-effort) and forget one channel.
    async fn retire(&self, token: &str, channel: &WatchChannel) -> Result<(), SyncError> {
        let request = StopChannelRequest {
            id: channel.channel_id.clone(),
            resource_id: channel.resource_id.clone(),
        };
        if let Err(e) = self.api.stop_channel(token, &request).await {
            warn!(
                channel_id = %channel.channel_id,
                calendar_id = %channel.calendar_id,
                error = %e,
                "Failed to stop watch channel"
            );
        }
        self.db.delete_channel(&channel.channel_id).await?;
        self.channels.invalidate(&channel.channel_id);
        Ok(())
    }

    /// Stop the user's channels on calendars the user no longer syncs against.
    pub async fn retire_calendars<'a, I>(
        &self,
        user_id: &str,
        token: &str,
        calendar_ids: I,
    ) -> Result<usize, SyncError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let calendar_ids: Vec<&String> = calendar_ids.into_iter().collect();
        let mut retired = 0;
        for channel in self.db.list_channels_for_user(user_id).await? {
            if calendar_ids.contains(&&channel.calendar_id) {
                self.retire(token, &channel).await?;
                retired += 1;
            }
        }
        if retired > 0 {
            info!(user_id, retired, "Retired watch channels of migrated calendars");
        }
        Ok(retired)
    }

    async fn lookup(&self, channel_id: &str) -> Result<Option<WatchChannel>, SyncError> {
        if let Some(channel) = self.channels.get(channel_id) {
            return Ok(Some(channel));
        }
        let channel = self.db.get_channel(channel_id).await?;
        if let Some(channel) = &channel {
            self.channels
                .insert(channel.channel_id.clone(), channel.clone());
        }
        Ok(channel)
    }

    /// Verify an inbound notification and schedule a sync for the channel's owner.
    pub async fn handle_notification(
        &self,
        notification: &Notification,
        trigger: &dyn SyncTrigger,
    ) -> Result<NotificationOutcome, SyncError> {
        let Some(channel) = self.lookup(&notification.channel_id).await? else {
            debug!(channel_id = %notification.channel_id, "Notification for unknown channel");
            return Ok(NotificationOutcome::UnknownChannel);
        };

        let token_ok = notification
            .channel_token
            .as_deref()
            .is_some_and(|t| ct_str_eq(t, &channel.channel_token));
        if !token_ok || !ct_str_eq(&notification.resource_id, &channel.resource_id) {
            warn!(channel_id = %channel.channel_id, "Notification failed verification");
            return Ok(NotificationOutcome::Rejected);
        }

        if notification.resource_state == HANDSHAKE_STATE {
            debug!(channel_id = %channel.channel_id, "Watch handshake received");
            return Ok(NotificationOutcome::Handshake);
        }

        trigger.schedule_sync(&channel.user_id, Some(self.debounce))?;
        debug!(
            user_id = %channel.user_id,
            channel_id = %channel.channel_id,
            state = %notification.resource_state,
            message_number = ?notification.message_number,
            "Notification scheduled sync"
        );
        Ok(NotificationOutcome::Scheduled {
            user_id: channel.user_id,
        })
    }

    /// Recreate every channel expiring within the renewal threshold, paced by the renew limiter.
    pub async fn renew_expiring(&self) -> Result<RenewalReport, SyncError> {
        let mut due = self
            .db
            .list_expiring_channels(Utc::now() + self.renew_threshold())
            .await?;
        // Renewal replaces every channel of the user, so once per user is enough.
        let mut seen = AHashSet::new();
        due.retain(|c| seen.insert(c.user_id.clone()));
        let mut report = RenewalReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let concurrency = usize::try_from(self.cfg.renew_tps.max(1)).unwrap_or(1);
        let mut results = futures::stream::iter(due)
            .map(|channel| async move {
                self.limiter.until_ready().await;
                let result = self.renew_channel(&channel).await;
                (channel, result)
            })
            .buffer_unordered(concurrency);

        while let Some((channel, result)) = results.next().await {
            match result {
                Ok(_) => report.renewed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        user_id = %channel.user_id,
                        channel_id = %channel.channel_id,
                        error = %e,
                        "Watch channel renewal failed"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn renew_channel(&self, channel: &WatchChannel) -> Result<WatchChannel, SyncError> {
        let (cred, token) = self.tokens.access_token(&channel.user_id).await?;
        // The user may have moved on to another calendar since the channel was created.
        let calendar_id = cred
            .calendar_id
            .clone()
            .unwrap_or_else(|| channel.calendar_id.clone());
        let lock = self.user_lock(&channel.user_id);
        let _guard = lock.lock().await;
        let previous = self.db.list_channels_for_user(&channel.user_id).await?;
        if let Some(live) = self.live_channel(&previous, &calendar_id) {
            debug!(user_id = %channel.user_id, channel_id = %live.channel_id, "Channel already renewed");
            return Ok(live);
        }
        self.recreate(&channel.user_id, &token, &calendar_id, &cred.user_id, previous)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_token_is_prefixed_and_random() {
        let a = channel_token("u1");
        let b = channel_token("u1");
        assert!(a.starts_with("u1:"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "u1:".len() + 32);
    }

    #[test]
    fn constant_time_compare_rejects_prefixes() {
        assert!(ct_str_eq("abc", "abc"));
        assert!(!ct_str_eq("abc", "abcd"));
        assert!(!ct_str_eq("", "a"));
    }
}
