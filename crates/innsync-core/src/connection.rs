//! Partner endpoints and credentials, and the wiring that turns them into a
//! [`SyncEnv`]. Shared by the API server and the operator CLI.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::Arc;

use crate::channel::{
    ChannelClient, ClientCredentialsTokens, HttpTransport, StaticToken, TokenProvider,
};
use crate::config::{
    optional_trimmed, required_trimmed, value_or_default, ConfigError, PropertyDirectory,
    SyncSettings,
};
use crate::context::ChannelProvider;
use crate::pms::HttpPmsGateway;
use crate::services::SyncStore;
use crate::sync::SyncEnv;
use crate::util::is_http_url;
use crate::Result;

#[derive(Clone)]
pub struct ConnectionConfig {
    pub channel_api_url: String,
    pub channel_api_key: String,
    /// With a secret the key is exchanged for bearer tokens; without one the
    /// key itself is the bearer token.
    pub channel_api_secret: Option<String>,
    pub channel_token_url: String,
    pub channel_provider: ChannelProvider,
    pub pms_api_url: String,
    pub pms_api_token: String,
    pub properties: PropertyDirectory,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConnectionConfig")
            .field("channel_api_url", &self.channel_api_url)
            .field("channel_api_key", &"[REDACTED]")
            .field(
                "channel_api_secret",
                &self.channel_api_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("channel_token_url", &self.channel_token_url)
            .field("channel_provider", &self.channel_provider)
            .field("pms_api_url", &self.pms_api_url)
            .field("pms_api_token", &"[REDACTED]")
            .field("properties", &self.properties)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let channel_api_url = http_url(&lookup, "CHANNEL_API_URL")?;
        let channel_api_key = required_trimmed(&lookup, "CHANNEL_API_KEY")?;
        let channel_api_secret = optional_trimmed(&lookup, "CHANNEL_API_SECRET");
        let default_token_url = format!("{channel_api_url}/oauth/token");
        let channel_token_url = value_or_default(&lookup, "CHANNEL_TOKEN_URL", &default_token_url);
        if !is_http_url(&channel_token_url) {
            return Err(ConfigError::Invalid(
                "CHANNEL_TOKEN_URL must start with http:// or https://".to_string(),
            ));
        }
        let channel_provider = value_or_default(&lookup, "CHANNEL_PROVIDER", "generic")
            .parse::<ChannelProvider>()
            .map_err(|error| ConfigError::Invalid(format!("CHANNEL_PROVIDER: {error}")))?;

        let pms_api_url = http_url(&lookup, "PMS_API_URL")?;
        let pms_api_token = required_trimmed(&lookup, "PMS_API_TOKEN")?;

        let properties =
            PropertyDirectory::parse(&required_trimmed(&lookup, "INNSYNC_PROPERTIES")?)?;
        if properties.is_empty() {
            return Err(ConfigError::Invalid(
                "INNSYNC_PROPERTIES must list at least one property".to_string(),
            ));
        }

        Ok(Self {
            channel_api_url,
            channel_api_key,
            channel_api_secret,
            channel_token_url,
            channel_provider,
            pms_api_url,
            pms_api_token,
            properties,
        })
    }

    /// Build the HTTP collaborators around an opened store.
    pub fn connect(&self, store: SyncStore, settings: SyncSettings) -> Result<SyncEnv> {
        let tokens: Arc<dyn TokenProvider> = match &self.channel_api_secret {
            Some(secret) => Arc::new(ClientCredentialsTokens::new(
                self.channel_token_url.clone(),
                self.channel_api_key.clone(),
                secret.clone(),
            )?),
            None => Arc::new(StaticToken::new(self.channel_api_key.clone())),
        };
        let channel = ChannelClient::new(
            Arc::new(HttpTransport::new(self.channel_api_url.clone())?),
            tokens,
            self.channel_provider.router(),
            &settings,
        );
        let pms = HttpPmsGateway::new(
            self.pms_api_url.clone(),
            self.pms_api_token.clone(),
            settings.request_timeout,
        )?;
        tracing::debug!(
            provider = %self.channel_provider,
            properties = self.properties.len(),
            "Partner connections configured"
        );

        Ok(SyncEnv::new(
            store,
            Arc::new(pms),
            Arc::new(channel),
            self.channel_provider.mapper(),
            settings,
            self.properties.clone(),
        ))
    }
}

fn http_url(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> std::result::Result<String, ConfigError> {
    let value = required_trimmed(lookup, name)?
        .trim_end_matches('/')
        .to_string();
    if !is_http_url(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must start with http:// or https://"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("CHANNEL_API_URL", "https://channel.example.com/"),
            ("CHANNEL_API_KEY", "sensitive-api-key"),
            ("CHANNEL_API_SECRET", "sensitive-api-secret"),
            ("PMS_API_URL", "https://pms.example.com"),
            ("PMS_API_TOKEN", "sensitive-pms-token"),
            ("INNSYNC_PROPERTIES", "p1:H-1,p2"),
        ])
    }

    fn load(map: &HashMap<&str, &str>) -> std::result::Result<ConnectionConfig, ConfigError> {
        ConnectionConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn missing_credentials_name_the_variable() {
        let mut map = minimal();
        map.remove("CHANNEL_API_KEY");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("CHANNEL_API_KEY"));
    }

    #[test]
    fn derived_values() {
        let config = load(&minimal()).unwrap();
        assert_eq!(config.channel_api_url, "https://channel.example.com");
        assert_eq!(
            config.channel_token_url,
            "https://channel.example.com/oauth/token"
        );
        assert_eq!(config.channel_provider, ChannelProvider::Generic);
        assert_eq!(config.properties.external_id("p1"), Some("H-1"));
        assert_eq!(config.properties.external_id("p2"), Some("p2"));
    }

    #[test]
    fn bad_urls_and_providers_are_rejected() {
        let mut map = minimal();
        map.insert("PMS_API_URL", "pms.example.com");
        assert!(load(&map).unwrap_err().to_string().contains("PMS_API_URL"));

        let mut map = minimal();
        map.insert("CHANNEL_PROVIDER", "carrier-pigeon");
        assert!(load(&map)
            .unwrap_err()
            .to_string()
            .contains("CHANNEL_PROVIDER"));

        let mut map = minimal();
        map.insert("INNSYNC_PROPERTIES", " , ");
        assert!(load(&map)
            .unwrap_err()
            .to_string()
            .contains("INNSYNC_PROPERTIES"));
    }

    #[test]
    fn debug_output_is_redacted() {
        let debug_output = format!("{:?}", load(&minimal()).unwrap());
        for secret in ["sensitive-api-key", "sensitive-api-secret", "sensitive-pms-token"] {
            assert!(!debug_output.contains(secret), "{secret} leaked");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_wires_the_configured_properties() {
        let config = load(&minimal()).unwrap();
        let store = SyncStore::open_in_memory().await.unwrap();
        let env = config.connect(store, SyncSettings::default()).unwrap();
        assert_eq!(env.external_property_id("p1").unwrap(), "H-1");
        assert!(env.external_property_id("p3").is_err());
    }
}
