use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use innsync_core::config::{
    bounded, optional_trimmed, required_trimmed, value_or_default, ConfigError, SyncSettings,
};
use innsync_core::ConnectionConfig;

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub connection: ConnectionConfig,
    pub webhook_secret: String,
    /// Bearer token required on operator routes when set
    pub operator_token: Option<String>,
    pub trigger_rate_limit_window: Duration,
    pub trigger_rate_limit_per_window: u32,
    pub sync: SyncSettings,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("connection", &self.connection)
            .field("webhook_secret", &"[REDACTED]")
            .field(
                "operator_token",
                &self.operator_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("trigger_rate_limit_window", &self.trigger_rate_limit_window)
            .field(
                "trigger_rate_limit_per_window",
                &self.trigger_rate_limit_per_window,
            )
            .field("sync", &self.sync)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "INNSYNC_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path = PathBuf::from(value_or_default(
            &lookup,
            "INNSYNC_DATABASE_PATH",
            "innsync.db",
        ));

        let webhook_secret = required_trimmed(&lookup, "CHANNEL_WEBHOOK_SECRET")?;
        if webhook_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "CHANNEL_WEBHOOK_SECRET must be at least 16 characters".to_string(),
            ));
        }

        let operator_token = optional_trimmed(&lookup, "INNSYNC_OPERATOR_TOKEN");
        let window_secs: u64 = bounded(&lookup, "TRIGGER_RATE_LIMIT_WINDOW_SECS", 60, 10..=3_600)?;
        let trigger_rate_limit_per_window =
            bounded(&lookup, "TRIGGER_RATE_LIMIT_PER_WINDOW", 6, 1..=1_000)?;

        Ok(Self {
            bind_addr,
            database_path,
            connection: ConnectionConfig::from_lookup(&lookup)?,
            webhook_secret,
            operator_token,
            trigger_rate_limit_window: Duration::from_secs(window_secs),
            trigger_rate_limit_per_window,
            sync: SyncSettings::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("CHANNEL_API_URL", "https://channel.example.com/"),
            ("CHANNEL_API_KEY", "sensitive-api-key"),
            ("CHANNEL_API_SECRET", "sensitive-api-secret"),
            ("CHANNEL_WEBHOOK_SECRET", "sensitive-webhook-secret"),
            ("PMS_API_URL", "https://pms.example.com"),
            ("PMS_API_TOKEN", "sensitive-pms-token"),
            ("INNSYNC_PROPERTIES", "p1:H-1,p2"),
        ])
    }

    fn load(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_webhook_secret() {
        let mut map = minimal();
        map.remove("CHANNEL_WEBHOOK_SECRET");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("CHANNEL_WEBHOOK_SECRET"));

        map.insert("CHANNEL_WEBHOOK_SECRET", "short");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("at least 16"));
    }

    #[test]
    fn config_requires_channel_credentials() {
        let mut map = minimal();
        map.remove("CHANNEL_API_KEY");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("CHANNEL_API_KEY"));
    }

    #[test]
    fn defaults_apply() {
        let config = load(&minimal()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, PathBuf::from("innsync.db"));
        assert_eq!(config.operator_token, None);
        assert_eq!(config.trigger_rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.trigger_rate_limit_per_window, 6);
        assert_eq!(config.sync.sync_interval, Duration::from_secs(15 * 60));
    }

    #[test]
    fn trigger_limit_is_bounded() {
        let mut map = minimal();
        map.insert("TRIGGER_RATE_LIMIT_PER_WINDOW", "0");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("TRIGGER_RATE_LIMIT_PER_WINDOW"));
    }

    #[test]
    fn sync_settings_errors_surface() {
        let mut map = minimal();
        map.insert("INNSYNC_SYNC_INTERVAL_MINUTES", "2");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("INNSYNC_SYNC_INTERVAL_MINUTES"));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let mut map = minimal();
        map.insert("INNSYNC_OPERATOR_TOKEN", "sensitive-operator-token");
        let config = load(&map).unwrap();

        let debug_output = format!("{config:?}");
        for secret in [
            "sensitive-api-key",
            "sensitive-api-secret",
            "sensitive-webhook-secret",
            "sensitive-pms-token",
            "sensitive-operator-token",
        ] {
            assert!(!debug_output.contains(secret), "{secret} leaked");
        }
        assert!(debug_output.contains("[REDACTED]"));
    }
}
