use super::IsRetryable;
use caresync_schema::ProviderErrorBody;
use reqwest::StatusCode;
use thiserror::Error as ThisError;

/// Outcome of a failed calendar provider call, classified from the HTTP status and the
/// structured error body.
#[derive(Debug, Clone, ThisError)]
pub enum ProviderError {
    #[error("provider rejected the access token: {message}")]
    Unauthorized { message: String },

    #[error("provider rate limit exceeded: {message}")]
    RateLimited { message: String },

    #[error("provider denied access: {message}")]
    Forbidden { message: String },

    #[error("provider resource not found")]
    NotFound,

    #[error("provider resource gone")]
    Gone,

    /// The incremental sync token is no longer accepted; a full resync is required.
    #[error("sync token invalidated by provider")]
    CursorInvalidated,

    #[error("etag precondition failed")]
    PreconditionFailed,

    /// A client-assigned id is already taken.
    #[error("provider resource already exists")]
    AlreadyExists,

    #[error("provider rejected request with status {status}: {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("provider server error {status}: {message}")]
    Server { status: StatusCode, message: String },

    #[error("provider request timed out")]
    Timeout,

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),
}

const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

impl ProviderError {
    /// Classify a non-success response. `body` is the raw response body.
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let parsed = serde_json::from_slice::<ProviderErrorBody>(body).ok();
        let message = parsed
            .as_ref()
            .map(|b| b.error.message.clone())
            .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(300).collect());
        let has_reason = |reason: &str| parsed.as_ref().is_some_and(|b| b.has_reason(reason));

        match status {
            StatusCode::UNAUTHORIZED => ProviderError::Unauthorized { message },
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { message },
            StatusCode::FORBIDDEN if RATE_LIMIT_REASONS.iter().any(|r| has_reason(*r)) => {
                ProviderError::RateLimited { message }
            }
            StatusCode::FORBIDDEN => ProviderError::Forbidden { message },
            StatusCode::NOT_FOUND => ProviderError::NotFound,
            StatusCode::GONE if has_reason("fullSyncRequired") => ProviderError::CursorInvalidated,
            StatusCode::GONE => ProviderError::Gone,
            StatusCode::PRECONDITION_FAILED => ProviderError::PreconditionFailed,
            StatusCode::CONFLICT => ProviderError::AlreadyExists,
            s if s.is_server_error() => ProviderError::Server { status: s, message },
            s => ProviderError::Rejected { status: s, message },
        }
    }

    /// The remote object no longer exists.
    pub fn is_missing(&self) -> bool {
        matches!(self, ProviderError::NotFound | ProviderError::Gone)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Unauthorized { .. })
    }

    /// A 4xx other than auth, rate limiting or a missing/changed resource.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProviderError::Rejected { .. } | ProviderError::Forbidden { .. }
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

impl IsRetryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Server { .. }
                | ProviderError::Timeout
                | ProviderError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: u16, reason: &str) -> Vec<u8> {
        format!(
            r#"{{"error":{{"code":{code},"message":"m","errors":[{{"reason":"{reason}","domain":"global"}}]}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn forbidden_rate_limit_reason_is_retryable() {
        let err = ProviderError::from_status(StatusCode::FORBIDDEN, &body(403, "rateLimitExceeded"));
        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert!(err.is_retryable());

        let err = ProviderError::from_status(StatusCode::FORBIDDEN, &body(403, "forbidden"));
        assert!(matches!(err, ProviderError::Forbidden { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn gone_with_full_sync_reason_invalidates_cursor() {
        let err = ProviderError::from_status(StatusCode::GONE, &body(410, "fullSyncRequired"));
        assert!(matches!(err, ProviderError::CursorInvalidated));
        let err = ProviderError::from_status(StatusCode::GONE, &body(410, "deleted"));
        assert!(err.is_missing());
    }

    #[test]
    fn status_classes() {
        assert!(ProviderError::from_status(StatusCode::UNAUTHORIZED, b"").is_auth());
        assert!(ProviderError::from_status(StatusCode::BAD_GATEWAY, b"oops").is_retryable());
        assert!(ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, b"").is_retryable());
        assert!(matches!(
            ProviderError::from_status(StatusCode::PRECONDITION_FAILED, b""),
            ProviderError::PreconditionFailed
        ));
        let err = ProviderError::from_status(StatusCode::CONFLICT, &body(409, "duplicate"));
        assert!(matches!(err, ProviderError::AlreadyExists));
        assert!(!err.is_retryable());
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, b"not json");
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
    }
}
