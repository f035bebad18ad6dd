use crate::config::ProviderConfig;
use crate::db::{Credential, CredentialPatch, DbActorHandle};
use crate::error::{OauthError, SyncError};
use crate::oauth_utils::{RefreshClient, RefreshTokenResponse, build_refresh_client};
use chrono::{Duration, Utc};
use oauth2::{RefreshToken, TokenResponse};
use tracing::{debug, info, warn};

/// Access tokens are refreshed this many seconds before they expire.
pub const REFRESH_SKEW_SECS: i64 = 300;

/// Hands out a usable access token per user, refreshing through the token endpoint when needed.
#[derive(Clone)]
pub struct TokenSource {
    db: DbActorHandle,
    oauth: RefreshClient,
    http: reqwest::Client,
}

impl TokenSource {
    pub fn new(
        db: DbActorHandle,
        cfg: &ProviderConfig,
        http: reqwest::Client,
    ) -> Result<Self, OauthError> {
        let secret = (!cfg.oauth_client_secret.is_empty()).then_some(cfg.oauth_client_secret.as_str());
        let oauth =
            build_refresh_client(&cfg.oauth_client_id, secret, cfg.oauth_token_url.as_str())?;
        Ok(Self { db, oauth, http })
    }

    /// Current credential plus a bearer token valid for at least [`REFRESH_SKEW_SECS`].
    pub async fn access_token(&self, user_id: &str) -> Result<(Credential, String), SyncError> {
        let cred = self
            .db
            .get_credential(user_id)
            .await?
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;

        if cred.needs_reauth {
            return Err(SyncError::Auth(format!(
                "credential of user {user_id} needs re-authorization"
            )));
        }

        let fresh_enough = cred
            .expires_at
            .is_some_and(|at| at > Utc::now() + Duration::seconds(REFRESH_SKEW_SECS));
        if let (Some(token), true) = (cred.access_token.clone(), fresh_enough) {
            return Ok((cred, token));
        }

        self.refresh(cred).await
    }

    async fn refresh(&self, cred: Credential) -> Result<(Credential, String), SyncError> {
        if cred.refresh_token.is_empty() {
            return Err(OauthError::MissingRefreshToken.into());
        }

        debug!(user_id = %cred.user_id, "Refreshing access token");
        let token: RefreshTokenResponse = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(cred.refresh_token.clone()))
            .request_async(&self.http)
            .await
            .map_err(|e| {
                let err = OauthError::from(e);
                warn!(user_id = %cred.user_id, error = %err, "Access token refresh failed");
                err
            })?;

        let access_token = token.access_token().secret().to_string();
        let expires_in = token
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::hours(1));
        let scope = token.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        });

        let patch = CredentialPatch {
            access_token: Some(access_token.clone()),
            refresh_token: token.refresh_token().map(|rt| rt.secret().to_string()),
            expires_at: Some(Utc::now() + expires_in),
            scope: scope.map(Some),
            ..Default::default()
        };
        let cred = self.db.patch_credential(&cred.user_id, patch).await?;
        info!(user_id = %cred.user_id, expires_at = ?cred.expires_at, "Access token refreshed");
        Ok((cred, access_token))
    }
}
