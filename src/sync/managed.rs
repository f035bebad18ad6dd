use super::hash::calculate_hash;
use super::transform::build_event_payload;
use super::types::{EntityStore, ErrorReport};
use crate::config::ManagedCalendarConfig;
use crate::db::{
    Credential, CredentialPatch, DbActorHandle, ManagedCalendarState, SyncDirection, SyncLink,
    SyncStatus,
};
use crate::error::{IsRetryable, ProviderError, SyncError};
use crate::provider::CalendarApi;
use caresync_schema::{AclRule, AclScope, Calendar, role_rank};
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of moving a user's events onto the managed calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Calendars events were moved away from; their watch channels can be retired.
    pub previous_calendar_ids: BTreeSet<String>,
    pub errors: ErrorReport,
}

/// Provisioning and upkeep of the app-owned calendar.
#[derive(Clone)]
pub struct ManagedCalendarManager {
    api: Arc<dyn CalendarApi>,
    db: DbActorHandle,
    store: Arc<dyn EntityStore>,
    cfg: ManagedCalendarConfig,
}

/// Auth and transient provider failures abort the step; anything else is the caller's to handle.
fn escalate(e: &ProviderError) -> bool {
    e.is_auth() || e.is_retryable()
}

impl ManagedCalendarManager {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        db: DbActorHandle,
        store: Arc<dyn EntityStore>,
        cfg: ManagedCalendarConfig,
    ) -> Self {
        Self {
            api,
            db,
            store,
            cfg,
        }
    }

    /// Get-or-create the managed calendar and make it the active one. Idempotent.
    pub async fn ensure_managed_calendar_for_user(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<Credential, SyncError> {
        let cred = self
            .db
            .get_credential(user_id)
            .await?
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;

        if let Some(recorded) = cred.managed_calendar_id.clone() {
            match self.api.get_calendar(token, &recorded).await {
                Ok(_) => return self.activate(cred, recorded).await,
                Err(e) if e.is_missing() => {
                    warn!(
                        user_id,
                        calendar_id = %recorded,
                        "Managed calendar disappeared remotely; provisioning a new one"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let cred = self
            .db
            .patch_credential(
                user_id,
                CredentialPatch {
                    managed_calendar_state: Some(ManagedCalendarState::Provisioning),
                    ..Default::default()
                },
            )
            .await?;

        // A previous create may have succeeded remotely without being persisted.
        let existing = self
            .api
            .list_calendars(token)
            .await?
            .into_iter()
            .find(|c| {
                c.is_owned()
                    && c.summary.as_deref() == Some(self.cfg.summary.as_str())
                    && cred.managed_calendar_id.as_deref() != Some(c.id.as_str())
            });

        let calendar_id = match existing {
            Some(entry) => {
                info!(user_id, calendar_id = %entry.id, "Recovered existing managed calendar");
                entry.id
            }
            None => {
                let created = self
                    .api
                    .insert_calendar(
                        token,
                        &Calendar {
                            id: None,
                            summary: self.cfg.summary.clone(),
                            description: Some(self.cfg.description.clone())
                                .filter(|d| !d.is_empty()),
                            time_zone: Some(self.cfg.time_zone.clone()),
                        },
                    )
                    .await?;
                let id = created.id.ok_or_else(|| {
                    SyncError::Unexpected("calendar insert returned no id".to_string())
                })?;
                info!(user_id, calendar_id = %id, "Created managed calendar");
                id
            }
        };

        self.activate(cred, calendar_id).await
    }

    async fn activate(
        &self,
        cred: Credential,
        managed_id: String,
    ) -> Result<Credential, SyncError> {
        let mut patch = CredentialPatch {
            managed_calendar_summary: Some(Some(self.cfg.summary.clone())),
            managed_calendar_state: Some(ManagedCalendarState::Verified),
            managed_calendar_verified_at: Some(Utc::now()),
            ..Default::default()
        };

        if cred.managed_calendar_id.as_deref() != Some(managed_id.as_str()) {
            patch.managed_calendar_id = Some(Some(managed_id.clone()));
            patch.managed_calendar_acl_role = Some(None);
            patch.managed_calendar_acl_verified_at = Some(None);
        }

        if cred.calendar_id.as_deref() != Some(managed_id.as_str()) {
            // Keep the oldest non-managed calendar as the legacy marker.
            if cred.legacy_calendar_id.is_none()
                && let Some(previous) = cred
                    .calendar_id
                    .clone()
                    .filter(|prev| cred.managed_calendar_id.as_deref() != Some(prev.as_str()))
            {
                info!(
                    user_id = %cred.user_id,
                    legacy_calendar_id = %previous,
                    "Active calendar replaced by managed calendar"
                );
                patch.legacy_calendar_id = Some(Some(previous));
            }
            patch.calendar_id = Some(Some(managed_id));
            patch.sync_token = Some(None);
        }

        self.db.patch_credential(&cred.user_id, patch).await
    }

    /// Move every linked event that still lives elsewhere onto the managed calendar.
    pub async fn migrate_events_to_managed_calendar(
        &self,
        cred: &Credential,
        token: &str,
    ) -> Result<MigrationReport, SyncError> {
        let managed = cred.managed_calendar_id.clone().ok_or_else(|| {
            SyncError::Unexpected(format!(
                "user {} has no managed calendar to migrate to",
                cred.user_id
            ))
        })?;

        let mut report = MigrationReport::default();
        let links = self.db.list_links_for_user(&cred.user_id).await?;

        for link in links {
            if link.event_id.is_none() || link.calendar_id.as_deref() == Some(managed.as_str()) {
                continue;
            }
            let Some(source) = link
                .calendar_id
                .clone()
                .or_else(|| cred.legacy_calendar_id.clone())
            else {
                report.record_error(&link.item_id, "linked event has no known source calendar");
                continue;
            };
            report.previous_calendar_ids.insert(source.clone());

            let item_id = link.item_id.clone();
            match self.migrate_link(token, link, &source, &managed).await {
                Ok(()) => report.migrated += 1,
                Err(e) if e.is_run_level() => return Err(e),
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "Event migration failed");
                    report.record_error(&item_id, e.to_string());
                }
            }
        }

        if report.errors.is_empty() && cred.legacy_calendar_id.is_some() {
            self.db
                .patch_credential(
                    &cred.user_id,
                    CredentialPatch {
                        legacy_calendar_id: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        }

        if report.migrated > 0 {
            info!(
                user_id = %cred.user_id,
                migrated = report.migrated,
                failed = report.errors.total,
                "Migrated events to managed calendar"
            );
        }
        Ok(report)
    }

    async fn migrate_link(
        &self,
        token: &str,
        mut link: SyncLink,
        source: &str,
        managed: &str,
    ) -> Result<(), SyncError> {
        let Some(event_id) = link.event_id.clone() else {
            return Ok(());
        };

        match self.api.move_event(token, source, &event_id, managed).await {
            Ok(moved) => {
                link.calendar_id = Some(managed.to_string());
                link.etag = moved.etag;
                link.remote_updated_at = moved.updated;
                self.db.save_link(link).await
            }
            Err(e) if e.is_missing() => {
                // Nothing left to move; the next push recreates the event on the managed calendar.
                debug!(item_id = %link.item_id, "Source event gone; relinking for re-push");
                link.calendar_id = Some(managed.to_string());
                link.event_id = None;
                link.etag = None;
                link.sync_status = SyncStatus::Pending;
                self.db.save_link(link).await
            }
            Err(e) if escalate(&e) => Err(e.into()),
            Err(e) => {
                warn!(
                    item_id = %link.item_id,
                    error = %e,
                    "Move rejected; recreating event on managed calendar"
                );
                self.recreate(token, link, source, &event_id, managed).await
            }
        }
    }

    async fn recreate(
        &self,
        token: &str,
        mut link: SyncLink,
        source: &str,
        event_id: &str,
        managed: &str,
    ) -> Result<(), SyncError> {
        let entity = self.store.get_entity(&link.item_id).await?.ok_or_else(|| {
            SyncError::Unexpected(format!("item {} no longer exists", link.item_id))
        })?;

        if entity.is_cancelled() {
            self.remove_source(token, source, event_id).await;
            return self.db.delete_link(&link.item_id).await;
        }

        let payload = build_event_payload(&entity)?;
        let created = self.api.insert_event(token, managed, &payload).await?;
        self.remove_source(token, source, event_id).await;

        link.calendar_id = Some(managed.to_string());
        link.event_id = created.id;
        link.etag = created.etag;
        link.remote_updated_at = created.updated;
        link.local_hash = Some(calculate_hash(&entity));
        link.last_synced_at = Some(Utc::now());
        link.last_sync_direction = Some(SyncDirection::Push);
        link.sync_status = SyncStatus::Idle;
        link.last_error = None;
        self.db.save_link(link).await
    }

    async fn remove_source(&self, token: &str, source: &str, event_id: &str) {
        match self.api.delete_event(token, source, event_id).await {
            Ok(()) => {}
            Err(e) if e.is_missing() => {}
            Err(e) => {
                warn!(calendar_id = source, event_id, error = %e, "Failed to remove source event");
            }
        }
    }

    /// Grant the configured role on the managed calendar to the account address, re-checking
    /// once the last verification is older than the configured interval.
    pub async fn ensure_managed_calendar_acl_for_user(
        &self,
        cred: Credential,
        token: &str,
    ) -> Result<Credential, SyncError> {
        let Some(calendar_id) = cred.managed_calendar_id.clone() else {
            return Ok(cred);
        };
        let Some(email) = cred.account_email.clone().filter(|e| !e.trim().is_empty()) else {
            debug!(user_id = %cred.user_id, "No account email; skipping managed calendar ACL");
            return Ok(cred);
        };

        let role = self.cfg.acl_role.as_str();
        let now = Utc::now();
        let fresh = cred.managed_calendar_acl_role.as_deref() == Some(role)
            && cred
                .managed_calendar_acl_verified_at
                .is_some_and(|at| now - at < Duration::seconds(self.cfg.acl_verify_interval_secs));
        if fresh {
            return Ok(cred);
        }

        let rules = match self.api.list_acl(token, &calendar_id).await {
            Ok(rules) => rules,
            Err(e) if escalate(&e) => return Err(e.into()),
            Err(e) => {
                warn!(user_id = %cred.user_id, calendar_id = %calendar_id, error = %e, "Listing ACL failed");
                return Ok(cred);
            }
        };

        let granted = rules.iter().any(|rule| {
            rule.scope.kind == "user"
                && rule
                    .scope
                    .value
                    .as_deref()
                    .is_some_and(|v| v.eq_ignore_ascii_case(&email))
                && role_rank(&rule.role) >= role_rank(role)
        });

        if !granted {
            let rule = AclRule {
                id: None,
                role: role.to_string(),
                scope: AclScope::user(email),
            };
            match self.api.insert_acl(token, &calendar_id, &rule).await {
                Ok(_) => {
                    info!(user_id = %cred.user_id, calendar_id = %calendar_id, role, "Granted managed calendar access");
                }
                Err(e) if escalate(&e) => return Err(e.into()),
                Err(e) => {
                    warn!(user_id = %cred.user_id, calendar_id = %calendar_id, error = %e, "Granting ACL failed");
                    return Ok(cred);
                }
            }
        }

        self.db
            .patch_credential(
                &cred.user_id,
                CredentialPatch {
                    managed_calendar_acl_role: Some(Some(role.to_string())),
                    managed_calendar_acl_verified_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await
    }
}

impl MigrationReport {
    fn record_error(&mut self, item_id: &str, message: impl Into<String>) {
        self.errors.record(item_id, message);
    }
}
