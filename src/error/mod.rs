mod oauth;
mod provider;
mod sync;

pub use oauth::OauthError;
pub use provider::ProviderError;
pub use sync::{ApiErrorBody, ApiErrorObject, FailureKind, SyncError};

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
