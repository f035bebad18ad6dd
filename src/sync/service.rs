use super::managed::ManagedCalendarManager;
use super::pull::PullEngine;
use super::push::PushEngine;
use super::types::{EntityStore, PullOptions, SyncStatusSummary, SyncSummary};
use crate::config::{ManagedCalendarConfig, SyncConfig};
use crate::db::{CredentialPatch, DbActorHandle};
use crate::error::SyncError;
use crate::orchestrator::SyncRunner;
use crate::provider::{CalendarApi, TokenSource};
use crate::watch::WatchManager;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// One user's sync run: managed calendar upkeep, push, then pull, then watch upkeep.
#[derive(Clone)]
pub struct SyncService {
    api: Arc<dyn CalendarApi>,
    db: DbActorHandle,
    tokens: TokenSource,
    managed: ManagedCalendarManager,
    push: PushEngine,
    pull: PullEngine,
    watch: Option<WatchManager>,
}

impl SyncService {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        db: DbActorHandle,
        store: Arc<dyn EntityStore>,
        tokens: TokenSource,
        sync_cfg: &SyncConfig,
        managed_cfg: &ManagedCalendarConfig,
    ) -> Self {
        Self {
            managed: ManagedCalendarManager::new(
                api.clone(),
                db.clone(),
                store.clone(),
                managed_cfg.clone(),
            ),
            push: PushEngine::new(
                api.clone(),
                db.clone(),
                store.clone(),
                sync_cfg.cancellation_policy,
            ),
            pull: PullEngine::new(api.clone(), db.clone(), store, sync_cfg.clone()),
            api,
            db,
            tokens,
            watch: None,
        }
    }

    /// Keep a push channel on the active calendar after every run.
    pub fn with_watch(mut self, watch: WatchManager) -> Self {
        self.watch = Some(watch);
        self
    }

    pub async fn sync_user(&self, user_id: &str) -> Result<SyncSummary, SyncError> {
        let started_at = Utc::now();
        let (_, token) = self.tokens.access_token(user_id).await?;

        let cred = self
            .managed
            .ensure_managed_calendar_for_user(user_id, &token)
            .await?;
        let cred = self
            .managed
            .ensure_managed_calendar_acl_for_user(cred, &token)
            .await?;

        let migration = self
            .managed
            .migrate_events_to_managed_calendar(&cred, &token)
            .await?;
        if let Some(watch) = &self.watch
            && !migration.previous_calendar_ids.is_empty()
            && let Err(e) = watch
                .retire_calendars(user_id, &token, &migration.previous_calendar_ids)
                .await
        {
            warn!(user_id, error = %e, "Retiring watch channels after migration failed");
        }

        let calendar_id = cred
            .calendar_id
            .clone()
            .ok_or_else(|| SyncError::Unexpected(format!("user {user_id} has no active calendar")))?;

        let push = self.push.push_user(&cred, &token).await?;
        let pull = self
            .pull
            .pull(&token, &cred, &calendar_id, PullOptions::default())
            .await?;

        if let Some(watch) = &self.watch
            && watch.config().is_deliverable()
            && let Err(e) = watch
                .ensure_watch(user_id, &token, &calendar_id, user_id)
                .await
        {
            warn!(user_id, calendar_id = %calendar_id, error = %e, "Ensuring watch channel failed");
        }

        Ok(SyncSummary {
            user_id: user_id.to_string(),
            calendar_id: Some(calendar_id),
            push,
            pull,
            migrated: migration.migrated,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        })
    }

    /// The host deleted an item: remove its remote event (best-effort) and the link.
    pub async fn handle_item_deleted(&self, user_id: &str, item_id: &str) -> Result<(), SyncError> {
        let Some(link) = self.db.get_link(item_id).await? else {
            return Ok(());
        };
        if link.user_id != user_id {
            warn!(user_id, item_id, owner = %link.user_id, "Deletion for item of another user ignored");
            return Ok(());
        }

        if let (Some(event_id), Some(calendar_id)) = (&link.event_id, &link.calendar_id) {
            match self.tokens.access_token(user_id).await {
                Ok((_, token)) => match self.api.delete_event(&token, calendar_id, event_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_missing() => {}
                    Err(e) => {
                        warn!(item_id, event_id = %event_id, error = %e, "Failed to delete remote event")
                    }
                },
                Err(e) => warn!(item_id, error = %e, "No access token; leaving remote event in place"),
            }
        }

        self.db.delete_link(item_id).await?;
        info!(user_id, item_id, "Unlinked deleted item");
        Ok(())
    }

    pub async fn status(&self, user_id: &str) -> Result<SyncStatusSummary, SyncError> {
        let Some(cred) = self.db.get_credential(user_id).await? else {
            return Ok(SyncStatusSummary::default());
        };
        let stats = self.db.link_stats(user_id).await?;
        Ok(SyncStatusSummary {
            connected: true,
            calendar_id: cred.calendar_id,
            last_synced_at: stats.last_synced_at.max(cred.last_pulled_at),
            sync_pending_count: stats.not_idle,
            last_error: stats.last_error,
            needs_reauth: cred.needs_reauth,
        })
    }

    /// Clear the re-authorization flag after the auth flow stored fresh tokens.
    pub async fn resume(&self, user_id: &str) -> Result<(), SyncError> {
        self.db
            .patch_credential(
                user_id,
                CredentialPatch {
                    needs_reauth: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncRunner for SyncService {
    async fn run(&self, user_id: &str) -> Result<SyncSummary, SyncError> {
        self.sync_user(user_id).await
    }

    async fn mark_needs_reauth(&self, user_id: &str) -> Result<(), SyncError> {
        self.db
            .patch_credential(
                user_id,
                CredentialPatch {
                    needs_reauth: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        warn!(user_id, "Credential flagged for re-authorization");
        Ok(())
    }
}
