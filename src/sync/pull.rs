use super::hash::calculate_hash;
use super::transform::{apply_remote_update, back_reference};
use super::types::{EntityStore, PullOptions, PullSummary};
use super::apply_cancellation;
use crate::config::SyncConfig;
use crate::db::{Credential, CredentialPatch, DbActorHandle, SyncDirection, SyncLink, SyncStatus};
use crate::error::SyncError;
use crate::provider::{CalendarApi, EventsQuery};
use caresync_schema::CalendarEvent;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullOutcome {
    Applied,
    Cancelled,
    Linked,
    RepushMarked,
    Skipped,
}

/// Everything one pull fetched, before any of it is applied.
struct FetchedBatch {
    events: Vec<CalendarEvent>,
    next_sync_token: Option<String>,
}

/// Applies remote changes of the active calendar to local items.
#[derive(Clone)]
pub struct PullEngine {
    api: Arc<dyn CalendarApi>,
    db: DbActorHandle,
    store: Arc<dyn EntityStore>,
    cfg: SyncConfig,
}

impl PullEngine {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        db: DbActorHandle,
        store: Arc<dyn EntityStore>,
        cfg: SyncConfig,
    ) -> Self {
        Self {
            api,
            db,
            store,
            cfg,
        }
    }

    /// Fetch every page, apply every event, then persist the new cursor in one patch.
    pub async fn pull(
        &self,
        token: &str,
        cred: &Credential,
        calendar_id: &str,
        options: PullOptions,
    ) -> Result<PullSummary, SyncError> {
        let user_id = cred.user_id.as_str();
        let mut summary = PullSummary::default();

        let batch = match cred.sync_token.as_deref().filter(|_| !options.force_full) {
            Some(sync_token) => {
                match self
                    .fetch_all(token, calendar_id, EventsQuery::incremental(sync_token))
                    .await
                {
                    Err(SyncError::CursorInvalidated) => {
                        info!(user_id, calendar_id, "Sync token invalidated; running full resync");
                        self.db
                            .patch_credential(
                                user_id,
                                CredentialPatch {
                                    sync_token: Some(None),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        summary.recovered = true;
                        summary.full_resync = true;
                        self.fetch_all(token, calendar_id, self.full_query()).await?
                    }
                    other => other?,
                }
            }
            None => {
                summary.full_resync = true;
                self.fetch_all(token, calendar_id, self.full_query()).await?
            }
        };

        for event in &batch.events {
            summary.fetched += 1;
            match self.apply_event(user_id, calendar_id, event).await {
                Ok(PullOutcome::Applied) => summary.applied += 1,
                Ok(PullOutcome::Cancelled) => summary.cancelled += 1,
                Ok(PullOutcome::Linked) => summary.linked += 1,
                Ok(PullOutcome::RepushMarked) => summary.repush_marked += 1,
                Ok(PullOutcome::Skipped) => summary.skipped += 1,
                Err(e) if e.is_run_level() => return Err(e),
                Err(e) => {
                    warn!(user_id, event_id = ?event.id, error = %e, "Pull failed for event");
                    let item_id = match self.record_failure(user_id, event, &e).await? {
                        Some(item_id) => item_id,
                        None => match &e {
                            SyncError::Validation { item_id, .. } => item_id.clone(),
                            _ => event.id.clone().unwrap_or_default(),
                        },
                    };
                    summary.errors.record(item_id, e.to_string());
                }
            }
        }

        self.db
            .patch_credential(
                user_id,
                CredentialPatch {
                    sync_token: Some(batch.next_sync_token),
                    last_pulled_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            user_id,
            fetched = summary.fetched,
            applied = summary.applied,
            cancelled = summary.cancelled,
            linked = summary.linked,
            repush = summary.repush_marked,
            full = summary.full_resync,
            "Pull finished"
        );
        Ok(summary)
    }

    fn full_query(&self) -> EventsQuery {
        EventsQuery::full(Utc::now() - Duration::days(self.cfg.pull_lookback_days))
    }

    async fn fetch_all(
        &self,
        token: &str,
        calendar_id: &str,
        query: EventsQuery,
    ) -> Result<FetchedBatch, SyncError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .api
                .list_events(token, calendar_id, &query.with_page(page_token.take()))
                .await?;
            events.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    return Ok(FetchedBatch {
                        events,
                        next_sync_token: page.next_sync_token,
                    });
                }
            }
        }
    }

    async fn apply_event(
        &self,
        user_id: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<PullOutcome, SyncError> {
        let Some(event_id) = event.id.as_deref() else {
            return Ok(PullOutcome::Skipped);
        };

        let Some(mut link) = self.db.find_link_by_event(user_id, event_id).await? else {
            return self.link_by_back_reference(user_id, calendar_id, event_id, event).await;
        };

        if event.is_cancelled() {
            self.db.delete_link(&link.item_id).await?;
            apply_cancellation(self.store.as_ref(), self.cfg.cancellation_policy, &link.item_id)
                .await?;
            info!(item_id = %link.item_id, event_id, "Remote event cancelled; item unlinked");
            return Ok(PullOutcome::Cancelled);
        }

        if event.etag.is_some() && event.etag == link.etag {
            return Ok(PullOutcome::Skipped);
        }

        let Some(entity) = self.store.get_entity(&link.item_id).await? else {
            debug!(item_id = %link.item_id, "Linked item no longer exists; skipping");
            return Ok(PullOutcome::Skipped);
        };

        let remote_newer = match (event.updated, link.last_synced_at) {
            (Some(remote), Some(synced)) => remote > synced,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if remote_newer {
            let updated = apply_remote_update(&entity, event)?;
            self.store.update_entity(updated.clone()).await?;
            link.calendar_id = Some(calendar_id.to_string());
            link.etag = event.etag.clone();
            link.remote_updated_at = event.updated;
            link.last_synced_at = Some(Utc::now());
            link.last_sync_direction = Some(SyncDirection::Pull);
            link.local_hash = Some(calculate_hash(&updated));
            link.sync_status = SyncStatus::Idle;
            link.last_error = None;
            self.db.save_link(link).await?;
            Ok(PullOutcome::Applied)
        } else {
            link.etag = event.etag.clone();
            link.remote_updated_at = event.updated;
            link.sync_status = SyncStatus::Pending;
            self.db.save_link(link).await?;
            Ok(PullOutcome::RepushMarked)
        }
    }

    /// The cursor moves past `event` regardless, so the local item stays authoritative: the link
    /// adopts the remote etag and carries the error until the next push overwrites the event.
    async fn record_failure(
        &self,
        user_id: &str,
        event: &CalendarEvent,
        err: &SyncError,
    ) -> Result<Option<String>, SyncError> {
        let Some(event_id) = event.id.as_deref() else {
            return Ok(None);
        };
        let Some(mut link) = self.db.find_link_by_event(user_id, event_id).await? else {
            return Ok(None);
        };
        link.etag = event.etag.clone();
        link.remote_updated_at = event.updated;
        link.sync_status = SyncStatus::Error;
        link.last_error = Some(err.to_string());
        let item_id = link.item_id.clone();
        self.db.save_link(link).await?;
        Ok(Some(item_id))
    }

    /// Unlinked event carrying our back-reference: adopt it, local state wins.
    async fn link_by_back_reference(
        &self,
        user_id: &str,
        calendar_id: &str,
        event_id: &str,
        event: &CalendarEvent,
    ) -> Result<PullOutcome, SyncError> {
        if event.is_cancelled() {
            return Ok(PullOutcome::Skipped);
        }
        let Some((kind, item_id)) = back_reference(event) else {
            return Ok(PullOutcome::Skipped);
        };

        let owned = self
            .store
            .get_entity(&item_id)
            .await?
            .is_some_and(|e| e.user_id() == user_id && e.kind() == kind);
        if !owned {
            debug!(item_id = %item_id, event_id, "Back-reference to unknown item; ignoring");
            return Ok(PullOutcome::Skipped);
        }
        if self.db.get_link(&item_id).await?.is_some_and(|l| l.event_id.is_some()) {
            debug!(item_id = %item_id, event_id, "Item already linked to another event");
            return Ok(PullOutcome::Skipped);
        }

        let mut link = SyncLink::new(item_id.clone(), kind, user_id);
        link.calendar_id = Some(calendar_id.to_string());
        link.event_id = Some(event_id.to_string());
        link.etag = event.etag.clone();
        link.remote_updated_at = event.updated;
        link.sync_status = SyncStatus::Pending;
        self.db.save_link(link).await?;
        info!(item_id = %item_id, event_id, "Linked remote event by back-reference");
        Ok(PullOutcome::Linked)
    }
}
