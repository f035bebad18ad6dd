use crate::db::models::{Credential, ManagedCalendarState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tokens handed over by the authorization flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialUpsert {
    pub user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub account_email: Option<String>,
}

/// Partial credential update. For nullable columns the outer `Option` selects the column and the
/// inner one is the new value, so `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<Option<String>>,
    pub account_email: Option<Option<String>>,
    pub calendar_id: Option<Option<String>>,
    pub sync_token: Option<Option<String>>,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub managed_calendar_id: Option<Option<String>>,
    pub managed_calendar_summary: Option<Option<String>>,
    /// Merged with [`ManagedCalendarState::advance`].
    pub managed_calendar_state: Option<ManagedCalendarState>,
    pub managed_calendar_verified_at: Option<DateTime<Utc>>,
    pub managed_calendar_acl_role: Option<Option<String>>,
    pub managed_calendar_acl_verified_at: Option<Option<DateTime<Utc>>>,
    pub legacy_calendar_id: Option<Option<String>>,
    pub needs_reauth: Option<bool>,
}

impl CredentialPatch {
    pub fn apply_to(self, cred: &mut Credential, now: DateTime<Utc>) {
        let CredentialPatch {
            access_token,
            refresh_token,
            expires_at,
            scope,
            account_email,
            calendar_id,
            sync_token,
            last_pulled_at,
            managed_calendar_id,
            managed_calendar_summary,
            managed_calendar_state,
            managed_calendar_verified_at,
            managed_calendar_acl_role,
            managed_calendar_acl_verified_at,
            legacy_calendar_id,
            needs_reauth,
        } = self;

        if let Some(v) = access_token {
            cred.access_token = Some(v);
        }
        if let Some(v) = refresh_token {
            cred.refresh_token = v;
        }
        if let Some(v) = expires_at {
            cred.expires_at = Some(v);
        }
        if let Some(v) = scope {
            cred.scope = v;
        }
        if let Some(v) = account_email {
            cred.account_email = v;
        }
        if let Some(v) = calendar_id {
            cred.calendar_id = v;
        }
        if let Some(v) = sync_token {
            cred.sync_token = v;
        }
        if let Some(v) = last_pulled_at {
            cred.last_pulled_at = Some(v);
        }
        if let Some(v) = managed_calendar_id {
            cred.managed_calendar_id = v;
        }
        if let Some(v) = managed_calendar_summary {
            cred.managed_calendar_summary = v;
        }
        if let Some(v) = managed_calendar_state {
            cred.managed_calendar_state = cred.managed_calendar_state.advance(v);
        }
        if let Some(v) = managed_calendar_verified_at {
            cred.managed_calendar_verified_at = Some(v);
        }
        if let Some(v) = managed_calendar_acl_role {
            cred.managed_calendar_acl_role = v;
        }
        if let Some(v) = managed_calendar_acl_verified_at {
            cred.managed_calendar_acl_verified_at = v;
        }
        if let Some(v) = legacy_calendar_id {
            cred.legacy_calendar_id = v;
        }
        if let Some(v) = needs_reauth {
            cred.needs_reauth = v;
        }
        cred.updated_at = now;
    }
}
