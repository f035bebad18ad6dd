use super::hash::{calculate_hash, event_id_for};
use super::transform::build_event_payload;
use super::types::{EntityStore, PushSummary, SyncEntity};
use super::apply_cancellation;
use crate::config::CancellationPolicy;
use crate::db::{Credential, DbActorHandle, SyncDirection, SyncLink, SyncStatus};
use crate::error::{ProviderError, SyncError};
use crate::provider::CalendarApi;
use caresync_schema::CalendarEvent;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    Created,
    Updated,
    Removed,
    Skipped,
}

/// Pushes local items to the active calendar.
#[derive(Clone)]
pub struct PushEngine {
    api: Arc<dyn CalendarApi>,
    db: DbActorHandle,
    store: Arc<dyn EntityStore>,
    policy: CancellationPolicy,
}

impl PushEngine {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        db: DbActorHandle,
        store: Arc<dyn EntityStore>,
        policy: CancellationPolicy,
    ) -> Self {
        Self {
            api,
            db,
            store,
            policy,
        }
    }

    /// Push every item of the credential's user. Per-item failures are recorded on the link and
    /// in the summary; run-level failures abort the batch.
    pub async fn push_user(
        &self,
        cred: &Credential,
        token: &str,
    ) -> Result<PushSummary, SyncError> {
        let user_id = cred.user_id.as_str();
        let calendar_id = cred.calendar_id.as_deref().ok_or_else(|| {
            SyncError::Unexpected(format!("user {user_id} has no active calendar"))
        })?;

        let entities = self.store.list_entities_for_user(user_id).await?;
        let mut summary = PushSummary::default();

        for entity in entities {
            summary.considered += 1;
            match self.push_one(token, calendar_id, &entity).await {
                Ok(PushOutcome::Created) => {
                    summary.pushed += 1;
                    summary.created += 1;
                }
                Ok(PushOutcome::Updated) => {
                    summary.pushed += 1;
                    summary.updated += 1;
                }
                Ok(PushOutcome::Removed) => summary.removed += 1,
                Ok(PushOutcome::Skipped) => summary.skipped += 1,
                Err(e) if e.is_run_level() => return Err(e),
                Err(e) => {
                    warn!(user_id, item_id = %entity.id(), error = %e, "Push failed for item");
                    self.record_failure(&entity, &e).await?;
                    summary.errors.record(entity.id(), e.to_string());
                }
            }
        }

        info!(
            user_id,
            considered = summary.considered,
            created = summary.created,
            updated = summary.updated,
            removed = summary.removed,
            failed = summary.errors.total,
            "Push finished"
        );
        Ok(summary)
    }

    async fn push_one(
        &self,
        token: &str,
        calendar_id: &str,
        entity: &SyncEntity,
    ) -> Result<PushOutcome, SyncError> {
        let link = self.db.get_link(entity.id()).await?;

        if entity.is_cancelled() {
            let Some(link) = link else {
                return Ok(PushOutcome::Skipped);
            };
            if let Some(event_id) = link.event_id.as_deref() {
                let target = link.calendar_id.as_deref().unwrap_or(calendar_id);
                match self.api.delete_event(token, target, event_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_missing() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.db.delete_link(entity.id()).await?;
            debug!(item_id = %entity.id(), "Removed event of cancelled item");
            return Ok(PushOutcome::Removed);
        }

        let hash = calculate_hash(entity);
        if let Some(l) = &link
            && l.local_hash.as_deref() == Some(hash.as_str())
            && l.sync_status == SyncStatus::Idle
            && l.event_id.is_some()
            && l.calendar_id.as_deref() == Some(calendar_id)
        {
            return Ok(PushOutcome::Skipped);
        }

        let payload = build_event_payload(entity)?;

        let mut link =
            link.unwrap_or_else(|| SyncLink::new(entity.id(), entity.kind(), entity.user_id()));
        link.sync_status = SyncStatus::Pending;
        self.db.save_link(link.clone()).await?;

        let (remote, outcome) = match link.event_id.clone() {
            None => {
                let created = self
                    .insert_keyed(token, calendar_id, entity, &payload)
                    .await?;
                link.calendar_id = Some(calendar_id.to_string());
                (created, PushOutcome::Created)
            }
            Some(event_id) => {
                let target = link
                    .calendar_id
                    .clone()
                    .unwrap_or_else(|| calendar_id.to_string());
                match self
                    .patch_with_refetch(token, &target, &event_id, &payload, link.etag.as_deref())
                    .await
                {
                    Ok(updated) => {
                        link.calendar_id = Some(target);
                        (updated, PushOutcome::Updated)
                    }
                    Err(e) if e.is_missing() => {
                        info!(
                            item_id = %entity.id(),
                            event_id = %event_id,
                            "Remote event gone; unlinking item"
                        );
                        self.db.delete_link(entity.id()).await?;
                        apply_cancellation(self.store.as_ref(), self.policy, entity.id()).await?;
                        return Ok(PushOutcome::Removed);
                    }
                    Err(ProviderError::PreconditionFailed) => {
                        return Err(SyncError::Conflict {
                            item_id: entity.id().to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        link.event_id = remote.id.or(link.event_id);
        link.etag = remote.etag;
        link.remote_updated_at = remote.updated;
        link.last_synced_at = Some(Utc::now());
        link.last_sync_direction = Some(SyncDirection::Push);
        link.local_hash = Some(hash);
        link.sync_status = SyncStatus::Idle;
        link.last_error = None;
        self.db.save_link(link).await?;
        Ok(outcome)
    }

    /// Insert under the item's stable event id. A conflict means an earlier attempt committed
    /// before its response was lost: a live event is adopted and patched, a deleted one leaves the
    /// id burnt and the provider assigns a new one.
    async fn insert_keyed(
        &self,
        token: &str,
        calendar_id: &str,
        entity: &SyncEntity,
        payload: &CalendarEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        let event_id = event_id_for(entity);
        let keyed = CalendarEvent {
            id: Some(event_id.clone()),
            ..payload.clone()
        };
        match self.api.insert_event(token, calendar_id, &keyed).await {
            Err(ProviderError::AlreadyExists) => {}
            other => return other,
        }

        match self.api.get_event(token, calendar_id, &event_id).await {
            Ok(existing) if !existing.is_cancelled() => {
                info!(item_id = %entity.id(), event_id = %event_id, "Adopting event from an earlier insert");
                self.api
                    .patch_event(token, calendar_id, &event_id, payload, existing.etag.as_deref())
                    .await
            }
            Ok(_) => self.api.insert_event(token, calendar_id, payload).await,
            Err(e) if e.is_missing() => self.api.insert_event(token, calendar_id, payload).await,
            Err(e) => Err(e),
        }
    }

    /// Conditional patch; on a stale etag the current event is fetched and the patch retried once.
    async fn patch_with_refetch(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        payload: &CalendarEvent,
        etag: Option<&str>,
    ) -> Result<CalendarEvent, ProviderError> {
        match self
            .api
            .patch_event(token, calendar_id, event_id, payload, etag)
            .await
        {
            Err(ProviderError::PreconditionFailed) => {
                debug!(event_id, "Etag stale; refetching before retry");
                let current = self.api.get_event(token, calendar_id, event_id).await?;
                self.api
                    .patch_event(token, calendar_id, event_id, payload, current.etag.as_deref())
                    .await
            }
            other => other,
        }
    }

    async fn record_failure(&self, entity: &SyncEntity, err: &SyncError) -> Result<(), SyncError> {
        let mut link = self
            .db
            .get_link(entity.id())
            .await?
            .unwrap_or_else(|| SyncLink::new(entity.id(), entity.kind(), entity.user_id()));
        link.sync_status = SyncStatus::Error;
        link.last_error = Some(err.to_string());
        self.db.save_link(link).await
    }
}
