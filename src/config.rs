//! Configuration surface (§6 "Configuration (enumerated options)").
//!
//! Loading configuration end-to-end (layered files, secrets managers, hot reload) is out of
//! scope per §1 — this module only defines the struct a loader would populate, plus the
//! fail-fast constructor §6 requires for the two required Twitch credentials and the
//! persistence-sink credentials.

use serde::Deserialize;

fn default_obs_host() -> String {
    "localhost".to_owned()
}

fn default_obs_port() -> u16 {
    4455
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_token_store_path() -> String {
    "oauth_tokens.json".to_owned()
}

/// Runtime configuration for the integration core.
///
/// Deserializable from environment variables via [`envy`], matching the field names in §6
/// lower-cased. See [`Config::from_env`].
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Twitch application client id. Required; startup fails without it.
    pub twitch_client_id: String,
    /// Twitch application client secret. Required; startup fails without it.
    pub twitch_client_secret: String,
    /// Password configured on the OBS WebSocket server, if any.
    #[serde(default)]
    pub obs_websocket_password: String,
    /// Hostname of the OBS WebSocket server.
    #[serde(default = "default_obs_host")]
    pub obs_websocket_host: String,
    /// Port of the OBS WebSocket server.
    #[serde(default = "default_obs_port")]
    pub obs_websocket_port: u16,
    /// Timeout for outbound HTTPS requests, in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Base reconnect interval used by application-level reconnection policy, in milliseconds.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Connection string for the persistence sink (activity log, queues, etc). Required.
    pub database_url: String,
    /// Secret key base used by the persistence/session-signing sink. Required.
    pub secret_key_base: String,
    /// Path to the local key/value file backing the OAuth token store (§6 "Persisted state layout").
    #[serde(default = "default_token_store_path")]
    pub token_store_path: String,
}

/// Error returned when required configuration is missing.
#[derive(Debug, thiserror::Error)]
#[error("missing required configuration: {0}")]
pub struct MissingConfig(pub &'static str);

impl Config {
    /// Load configuration from process environment variables, failing fast if any of the
    /// required fields (`twitch_client_id`, `twitch_client_secret`, `database_url`,
    /// `secret_key_base`) are absent or blank.
    pub fn from_env() -> Result<Self, crate::Error> {
        let config: Self = envy::from_env().map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate().map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), MissingConfig> {
        if self.twitch_client_id.trim().is_empty() {
            return Err(MissingConfig("twitch_client_id"));
        }
        if self.twitch_client_secret.trim().is_empty() {
            return Err(MissingConfig("twitch_client_secret"));
        }
        if self.database_url.trim().is_empty() {
            return Err(MissingConfig("database_url"));
        }
        if self.secret_key_base.trim().is_empty() {
            return Err(MissingConfig("secret_key_base"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            twitch_client_id: "id".to_owned(),
            twitch_client_secret: "secret".to_owned(),
            obs_websocket_password: String::new(),
            obs_websocket_host: default_obs_host(),
            obs_websocket_port: default_obs_port(),
            http_timeout_ms: default_http_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            database_url: "sqlite://local.db".to_owned(),
            secret_key_base: "base".to_owned(),
            token_store_path: default_token_store_path(),
        }
    }

    #[test]
    fn validate_accepts_full_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_client_id() {
        let mut config = base_config();
        config.twitch_client_id = "  ".to_owned();
        assert!(matches!(config.validate(), Err(MissingConfig("twitch_client_id"))));
    }

    #[test]
    fn validate_rejects_missing_database_url() {
        let mut config = base_config();
        config.database_url.clear();
        assert!(matches!(config.validate(), Err(MissingConfig("database_url"))));
    }
}
