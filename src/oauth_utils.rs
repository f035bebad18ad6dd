use crate::error::OauthError;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    Client as OAuth2Client, ClientId, ClientSecret, EndpointNotSet, EndpointSet, ExtraTokenFields,
    StandardRevocableToken, StandardTokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Whatever the token endpoint sends beyond the standard refresh response. Google adds
/// `id_token` when the original grant carried `openid`; nothing here is persisted.
#[derive(Clone, Deserialize, Serialize)]
pub(crate) struct RefreshExtras {
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl ExtraTokenFields for RefreshExtras {}

// Values can hold tokens, so only the names are printed.
impl std::fmt::Debug for RefreshExtras {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();
        f.debug_struct("RefreshExtras")
            .field("names", &names)
            .finish()
    }
}

pub(crate) type RefreshTokenResponse = StandardTokenResponse<RefreshExtras, BasicTokenType>;

/// oauth2 client that only knows the token endpoint. Consent happens outside this service, so
/// the `refresh_token` grant is the only flow it runs.
pub(crate) type RefreshClient = OAuth2Client<
    BasicErrorResponse,
    RefreshTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

pub(crate) fn build_refresh_client(
    client_id: &str,
    client_secret: Option<&str>,
    token_url: &str,
) -> Result<RefreshClient, OauthError> {
    let client = OAuth2Client::<
        BasicErrorResponse,
        RefreshTokenResponse,
        BasicTokenIntrospectionResponse,
        StandardRevocableToken,
        BasicRevocationErrorResponse,
    >::new(ClientId::new(client_id.to_string()))
    .set_token_uri(TokenUrl::new(token_url.to_string())?);
    Ok(match client_secret {
        Some(secret) => client.set_client_secret(ClientSecret::new(secret.to_string())),
        None => client,
    })
}
