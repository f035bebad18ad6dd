use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error as ThisError;

use super::IsRetryable;
use super::provider::ProviderError;

/// Error taxonomy of the sync engine.
///
/// Clone so a single run outcome can be delivered to every waiter of that run.
#[derive(Debug, Clone, ThisError)]
pub enum SyncError {
    /// Token rejected or refresh denied; the user has to re-authorize.
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// Timeouts, 5xx, 429 and transport failures that survived the HTTP-level retries.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Sync token invalidated")]
    CursorInvalidated,

    #[error("Remote event for item {item_id} changed concurrently")]
    Conflict { item_id: String },

    #[error("Invalid item {item_id}: {message}")]
    Validation { item_id: String, message: String },

    #[error("User {0} has no calendar connection")]
    NotConnected(String),

    #[error("Sync for user {0} is suspended until re-authorization")]
    Suspended(String),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// How the orchestrator reacts to a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Auth,
    Fatal,
}

impl SyncError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Auth(_) => FailureKind::Auth,
            e if e.is_retryable() => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    /// Failures that abort the whole batch instead of being recorded against one item.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_)
                | SyncError::Transient(_)
                | SyncError::Database(_)
                | SyncError::RactorError(_)
                | SyncError::NotConnected(_)
        )
    }
}

impl From<ProviderError> for SyncError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unauthorized { .. } => SyncError::Auth(e.to_string()),
            ProviderError::CursorInvalidated => SyncError::CursorInvalidated,
            e if e.is_retryable() => SyncError::Transient(e.to_string()),
            e => SyncError::Provider(e),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}

impl IsRetryable for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match &self {
            SyncError::NotConnected(_) => (
                StatusCode::NOT_FOUND,
                "NOT_CONNECTED",
                "User has no calendar connection.".to_string(),
            ),
            SyncError::Auth(_) | SyncError::Suspended(_) => (
                StatusCode::CONFLICT,
                "NEEDS_REAUTH",
                "Calendar access must be re-authorized.".to_string(),
            ),
            SyncError::Conflict { .. } => (StatusCode::CONFLICT, "CONFLICT", self.to_string()),
            SyncError::Validation { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_ITEM",
                self.to_string(),
            ),
            SyncError::Transient(_) | SyncError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
                "Calendar provider error.".to_string(),
            ),
            SyncError::CursorInvalidated
            | SyncError::Database(_)
            | SyncError::RactorError(_)
            | SyncError::Unexpected(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal server error occurred.".to_string(),
            ),
        };
        let body = ApiErrorBody {
            inner: ApiErrorObject {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Standardized API error response payload.
#[derive(Serialize)]
pub struct ApiErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    #[serde(rename = "error")]
    pub inner: ApiErrorObject,
}
