mod common;

use axum::{
    Form, Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use caresync::config::ProviderConfig;
use caresync::db::{CredentialPatch, CredentialUpsert, DbActorHandle};
use caresync::error::SyncError;
use caresync::provider::{REFRESH_SKEW_SECS, TokenSource};
use chrono::{Duration, Utc};
use common::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone, Default)]
struct TokenEndpoint {
    grants: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl TokenEndpoint {
    fn calls(&self) -> usize {
        self.grants.lock().unwrap().len()
    }
}

async fn token(
    State(ep): State<TokenEndpoint>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    ep.grants.lock().unwrap().push(form.clone());
    match form.get("refresh_token").map(String::as_str) {
        Some("rt-revoked") => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "Token has been expired or revoked." })),
        )
            .into_response(),
        Some("rt-outage") => (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response(),
        _ => Json(json!({
            "access_token": "at-refreshed",
            "token_type": "Bearer",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/calendar",
        }))
        .into_response(),
    }
}

async fn spawn_token_endpoint() -> (Url, TokenEndpoint) {
    let ep = TokenEndpoint::default();
    let app = Router::new()
        .route("/token", post(token))
        .with_state(ep.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    let url = Url::parse(&format!("http://{}/token", addr)).expect("valid token url");
    (url, ep)
}

async fn setup(prefix: &str) -> (DbActorHandle, TokenSource, TokenEndpoint) {
    let db = spawn_db(prefix).await;
    let (token_url, ep) = spawn_token_endpoint().await;
    let cfg = ProviderConfig {
        oauth_token_url: token_url,
        oauth_client_id: "caresync-test".to_string(),
        ..Default::default()
    };
    let tokens = TokenSource::new(db.clone(), &cfg, reqwest::Client::new()).unwrap();
    (db, tokens, ep)
}

async fn store_expired(db: &DbActorHandle, user_id: &str, refresh_token: &str) {
    db.upsert_credential(CredentialUpsert {
        user_id: user_id.to_string(),
        access_token: Some("at-stale".to_string()),
        refresh_token: refresh_token.to_string(),
        scope: None,
        expires_at: Some(Utc::now() - Duration::minutes(5)),
        account_email: None,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn fresh_token_is_returned_without_refreshing() {
    let (db, tokens, ep) = setup("token-fresh").await;
    connect_user(&db, USER, None).await;

    let (cred, token) = tokens.access_token(USER).await.unwrap();
    assert_eq!(token, format!("at-{USER}"));
    assert_eq!(cred.user_id, USER);
    assert_eq!(ep.calls(), 0);
}

#[tokio::test]
async fn expired_token_is_refreshed_and_persisted() {
    let (db, tokens, ep) = setup("token-refresh").await;
    store_expired(&db, USER, "rt-good").await;

    let (cred, token) = tokens.access_token(USER).await.unwrap();
    assert_eq!(token, "at-refreshed");
    assert!(cred.expires_at.unwrap() > Utc::now() + Duration::minutes(50));
    assert_eq!(
        cred.scope.as_deref(),
        Some("https://www.googleapis.com/auth/calendar")
    );
    assert_eq!(cred.refresh_token, "rt-good", "kept when the endpoint sends none");

    let grants = ep.grants.lock().unwrap().clone();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].get("grant_type").map(String::as_str), Some("refresh_token"));
    assert_eq!(grants[0].get("refresh_token").map(String::as_str), Some("rt-good"));

    let stored = db.get_credential(USER).await.unwrap().unwrap();
    assert_eq!(stored.access_token.as_deref(), Some("at-refreshed"));
    tokens.access_token(USER).await.unwrap();
    assert_eq!(ep.calls(), 1, "the refreshed token is reused");
}

#[tokio::test]
async fn token_inside_the_skew_window_is_refreshed() {
    let (db, tokens, ep) = setup("token-skew").await;
    connect_user(&db, USER, None).await;
    db.patch_credential(
        USER,
        CredentialPatch {
            expires_at: Some(Utc::now() + Duration::seconds(REFRESH_SKEW_SECS / 2)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (_, token) = tokens.access_token(USER).await.unwrap();
    assert_eq!(token, "at-refreshed");
    assert_eq!(ep.calls(), 1);
}

#[tokio::test]
async fn revoked_grant_is_an_auth_failure() {
    let (db, tokens, _ep) = setup("token-revoked").await;
    store_expired(&db, USER, "rt-revoked").await;

    let err = tokens.access_token(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)), "got {err:?}");
}

#[tokio::test]
async fn token_endpoint_outage_is_transient() {
    let (db, tokens, _ep) = setup("token-outage").await;
    store_expired(&db, USER, "rt-outage").await;

    let err = tokens.access_token(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)), "got {err:?}");
}

#[tokio::test]
async fn credential_flagged_for_reauth_never_calls_the_endpoint() {
    let (db, tokens, ep) = setup("token-needs-reauth").await;
    store_expired(&db, USER, "rt-good").await;
    db.patch_credential(
        USER,
        CredentialPatch {
            needs_reauth: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let err = tokens.access_token(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
    assert_eq!(ep.calls(), 0);
}

#[tokio::test]
async fn unknown_user_is_not_connected() {
    let (_db, tokens, _ep) = setup("token-unknown").await;
    let err = tokens.access_token("nobody").await.unwrap_err();
    assert!(matches!(err, SyncError::NotConnected(_)));
}
