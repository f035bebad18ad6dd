mod basic;
mod provider;
mod sync;

pub use basic::BasicConfig;
pub use provider::ProviderConfig;
pub use sync::{CancellationPolicy, ManagedCalendarConfig, PollMode, SyncConfig, WatchConfig};

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Calendar provider endpoints and HTTP client settings (see `provider` table).
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Orchestrator timing and pull policy (see `sync` table).
    #[serde(default)]
    pub sync: SyncConfig,

    /// App-owned calendar settings (see `managed_calendar` table).
    #[serde(default)]
    pub managed_calendar: ManagedCalendarConfig,

    /// Push-notification channels (see `watch` table).
    #[serde(default)]
    pub watch: WatchConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration from the TOML file (with defaults) and validates required fields.
    pub fn from_toml() -> Self {
        if !PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            panic!("config file not found: {}", DEFAULT_CONFIG_FILE);
        }
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!(
                "failed to extract configuration from {}: {err}",
                DEFAULT_CONFIG_FILE
            )
        });
        if cfg.basic.caresync_key.trim().is_empty() {
            panic!("basic.caresync_key must be set and non-empty");
        }
        if cfg.sync.retry_base_ms > cfg.sync.retry_max_ms {
            panic!("sync.retry_base_ms must not exceed sync.retry_max_ms");
        }
        cfg
    }

    /// Whether the poll timer should run, given the webhook settings.
    pub fn polling_enabled(&self) -> bool {
        match self.sync.poll_mode {
            PollMode::Always => true,
            PollMode::Off => false,
            PollMode::Auto => !self.watch.is_deliverable(),
        }
    }
}

/// Global, lazily-initialized and validated configuration. Panics on first access when
/// `config.toml` is missing or invalid.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_toml);

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn auto_polling_follows_webhook_availability() {
        let mut cfg = Config::default();
        cfg.watch.enabled = true;
        cfg.watch.webhook_url = None;
        assert!(cfg.polling_enabled());

        cfg.watch.webhook_url = Some(Url::parse("https://hooks.example/calendar").unwrap());
        assert!(!cfg.polling_enabled());

        cfg.sync.poll_mode = PollMode::Always;
        assert!(cfg.polling_enabled());

        cfg.sync.poll_mode = PollMode::Off;
        cfg.watch.enabled = false;
        assert!(!cfg.polling_enabled());
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let cfg: Config = Config::figment()
            .merge(Toml::string(
                r#"
                [sync]
                debounce_ms = 50
                cancellation_policy = "detach"

                [managed_calendar]
                summary = "Household"
                "#,
            ))
            .extract()
            .expect("config must extract");
        assert_eq!(cfg.sync.debounce_ms, 50);
        assert_eq!(cfg.sync.cancellation_policy, CancellationPolicy::Detach);
        assert_eq!(cfg.sync.retry_max_ms, 60_000);
        assert_eq!(cfg.managed_calendar.summary, "Household");
        assert_eq!(cfg.managed_calendar.acl_role, "writer");
    }
}
