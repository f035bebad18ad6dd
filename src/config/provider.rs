use serde::{Deserialize, Serialize};
use url::Url;

/// Calendar provider configuration managed by Figment.
///
/// The OAuth client credentials are only used to refresh access tokens; the first credential is
/// issued elsewhere and stored through the credential API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Base URL of the calendar REST API. Must end with `/` so relative joins keep the version
    /// segment.
    /// TOML: `provider.api_url`. Default: `https://www.googleapis.com/calendar/v3/`.
    #[serde(default = "default_api_url")]
    pub api_url: Url,

    /// TOML: `provider.oauth_token_url`. Default: `https://oauth2.googleapis.com/token`.
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: Url,

    /// TOML: `provider.oauth_client_id`.
    #[serde(default)]
    pub oauth_client_id: String,

    /// TOML: `provider.oauth_client_secret`.
    #[serde(default)]
    pub oauth_client_secret: String,

    /// Optional upstream HTTP proxy. If set, used for reqwest clients.
    /// TOML: `provider.proxy`. Example: `http://127.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<Url>,

    /// Allow HTTP/2 multiplexing for reqwest clients; disabled forces HTTP/1.
    /// TOML: `provider.enable_multiplexing`. Default: `false`.
    #[serde(default)]
    pub enable_multiplexing: bool,

    /// Max retry attempts for a single provider call (transient failures only).
    /// TOML: `provider.retry_max_times`. Default: `3`.
    #[serde(default = "default_retry_max_times")]
    pub retry_max_times: usize,

    /// TOML: `provider.connect_timeout_secs`. Default: `10`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// TOML: `provider.request_timeout_secs`. Default: `30`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            oauth_token_url: default_oauth_token_url(),
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            proxy: None,
            enable_multiplexing: false,
            retry_max_times: default_retry_max_times(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_api_url() -> Url {
    Url::parse("https://www.googleapis.com/calendar/v3/")
        .expect("default provider api_url must be a valid URL")
}

fn default_oauth_token_url() -> Url {
    Url::parse("https://oauth2.googleapis.com/token")
        .expect("default oauth_token_url must be a valid URL")
}

fn default_retry_max_times() -> usize {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}
