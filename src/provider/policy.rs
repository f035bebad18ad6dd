use crate::error::ProviderError;
use crate::utils::logging::{body_preview, with_pretty_json_debug};
use caresync_schema::ProviderErrorBody;
use tracing::debug;

pub const UPSTREAM_BODY_PREVIEW_CHARS: usize = 300;

/// Consume a non-success response and classify it.
pub async fn classify_response(op: &'static str, resp: reqwest::Response) -> ProviderError {
    let status = resp.status();
    let bytes = resp.bytes().await.unwrap_or_default();
    let error = ProviderError::from_status(status, &bytes);

    if let Ok(body) = serde_json::from_slice::<ProviderErrorBody>(&bytes) {
        with_pretty_json_debug(&body, |pretty| {
            debug!(
                op,
                %status,
                ?error,
                body = %pretty,
                "Provider structured error"
            );
        });
    } else {
        debug!(
            op,
            %status,
            ?error,
            body = %body_preview(&bytes, UPSTREAM_BODY_PREVIEW_CHARS),
            "Provider unstructured error"
        );
    }

    error
}
