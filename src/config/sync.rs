use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// When the poll timer runs.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Poll only while webhooks cannot be delivered.
    #[default]
    Auto,
    Always,
    Off,
}

/// What happens to a local item whose remote event was deleted.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CancellationPolicy {
    /// Mark the item cancelled.
    #[default]
    Cancel,
    /// Keep the item untouched; only the link goes away.
    Detach,
}

/// Orchestrator and pull configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Quiet period before a scheduled sync runs; every new trigger restarts it.
    /// TOML: `sync.debounce_ms`. Default: `2000`.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// TOML: `sync.retry_base_ms`. Default: `1000`.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// TOML: `sync.retry_max_ms`. Default: `60000`.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Transient failures tolerated before a user drops back to idle.
    /// TOML: `sync.retry_max_attempts`. Default: `5`.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// TOML: `sync.poll_mode`. Default: `auto`.
    #[serde(default)]
    pub poll_mode: PollMode,

    /// TOML: `sync.poll_interval_ms`. Default: `300000`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Poll fan-out rate (users scheduled per second).
    /// TOML: `sync.poll_dispatch_tps`. Default: `10`.
    #[serde(default = "default_poll_dispatch_tps")]
    pub poll_dispatch_tps: u32,

    /// Window of a full (cursor-less) pull.
    /// TOML: `sync.pull_lookback_days`. Default: `30`.
    #[serde(default = "default_pull_lookback_days")]
    pub pull_lookback_days: i64,

    /// TOML: `sync.cancellation_policy`. Default: `cancel`.
    #[serde(default)]
    pub cancellation_policy: CancellationPolicy,
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            poll_mode: PollMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_dispatch_tps: default_poll_dispatch_tps(),
            pull_lookback_days: default_pull_lookback_days(),
            cancellation_policy: CancellationPolicy::default(),
        }
    }
}

/// App-owned calendar configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ManagedCalendarConfig {
    /// Title of the calendar. Also used to recover a calendar whose id was never persisted.
    /// TOML: `managed_calendar.summary`. Default: `CareSync`.
    #[serde(default = "default_summary")]
    pub summary: String,

    /// TOML: `managed_calendar.description`.
    #[serde(default = "default_description")]
    pub description: String,

    /// TOML: `managed_calendar.time_zone`. Default: `UTC`.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Role granted to the account owner on the managed calendar.
    /// TOML: `managed_calendar.acl_role`. Default: `writer`.
    #[serde(default = "default_acl_role")]
    pub acl_role: String,

    /// TOML: `managed_calendar.acl_verify_interval_secs`. Default: `3600`.
    #[serde(default = "default_acl_verify_interval_secs")]
    pub acl_verify_interval_secs: i64,
}

impl Default for ManagedCalendarConfig {
    fn default() -> Self {
        Self {
            summary: default_summary(),
            description: default_description(),
            time_zone: default_time_zone(),
            acl_role: default_acl_role(),
            acl_verify_interval_secs: default_acl_verify_interval_secs(),
        }
    }
}

/// Push-notification channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// TOML: `watch.enabled`. Default: `true`.
    #[serde(default = "default_watch_enabled")]
    pub enabled: bool,

    /// Public HTTPS address of `POST /calendar/notifications`. Without it no channel is opened.
    /// TOML: `watch.webhook_url`.
    #[serde(default)]
    pub webhook_url: Option<Url>,

    /// Requested channel lifetime.
    /// TOML: `watch.channel_ttl_secs`. Default: `604800`.
    #[serde(default = "default_channel_ttl_secs")]
    pub channel_ttl_secs: i64,

    /// Channels expiring within this window are renewed.
    /// TOML: `watch.renew_threshold_secs`. Default: `86400`.
    #[serde(default = "default_renew_threshold_secs")]
    pub renew_threshold_secs: i64,

    /// TOML: `watch.renew_interval_secs`. Default: `3600`.
    #[serde(default = "default_renew_interval_secs")]
    pub renew_interval_secs: u64,

    /// Channel renewals per second.
    /// TOML: `watch.renew_tps`. Default: `5`.
    #[serde(default = "default_renew_tps")]
    pub renew_tps: u32,
}

impl WatchConfig {
    /// Channels can only be registered when enabled and a public address is known.
    pub fn is_deliverable(&self) -> bool {
        self.enabled && self.webhook_url.is_some()
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_watch_enabled(),
            webhook_url: None,
            channel_ttl_secs: default_channel_ttl_secs(),
            renew_threshold_secs: default_renew_threshold_secs(),
            renew_interval_secs: default_renew_interval_secs(),
            renew_tps: default_renew_tps(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    2_000
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    300_000
}

fn default_poll_dispatch_tps() -> u32 {
    10
}

fn default_pull_lookback_days() -> i64 {
    30
}

fn default_summary() -> String {
    "CareSync".to_string()
}

fn default_description() -> String {
    "Appointments and bills managed by CareSync".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_acl_role() -> String {
    "writer".to_string()
}

fn default_acl_verify_interval_secs() -> i64 {
    3_600
}

fn default_watch_enabled() -> bool {
    true
}

fn default_channel_ttl_secs() -> i64 {
    604_800
}

fn default_renew_threshold_secs() -> i64 {
    86_400
}

fn default_renew_interval_secs() -> u64 {
    3_600
}

fn default_renew_tps() -> u32 {
    5
}
