//! Server endpoint configuration.

use std::env;

use crate::api::LOCAL_API_BASE_URL;
use crate::realtime::LOCAL_REALTIME_ENDPOINT;

pub const SERVER_BASE_URL_ENV: &str = "MINICHAT_SERVER_BASE_URL";
pub const AUTH_BASE_URL_ENV: &str = "MINICHAT_AUTH_BASE_URL";
pub const WEBSOCKET_URL_ENV: &str = "MINICHAT_WEBSOCKET_URL";

/// Addresses of the message server surfaces.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientConfig {
    /// Base URL for business requests.
    pub api_base_url: String,
    /// Base URL for login, registration and verification codes.
    pub auth_base_url: String,
    /// Realtime websocket endpoint.
    pub realtime_endpoint: String,
}

impl ClientConfig {
    /// Single-host local deployment.
    pub fn local() -> Self {
        Self {
            api_base_url: LOCAL_API_BASE_URL.to_string(),
            auth_base_url: LOCAL_API_BASE_URL.to_string(),
            realtime_endpoint: LOCAL_REALTIME_ENDPOINT.to_string(),
        }
    }

    /// Reads overrides from the environment, falling back to [`ClientConfig::local`].
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::local();
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = read(SERVER_BASE_URL_ENV) {
            config.api_base_url = value;
        }
        if let Some(value) = read(AUTH_BASE_URL_ENV) {
            config.auth_base_url = value;
        }
        if let Some(value) = read(WEBSOCKET_URL_ENV) {
            config.realtime_endpoint = value;
        }
        config
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{ClientConfig, AUTH_BASE_URL_ENV, SERVER_BASE_URL_ENV, WEBSOCKET_URL_ENV};

    fn config_with(vars: &[(&str, &str)]) -> ClientConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn local_config_targets_one_host() {
        let config = ClientConfig::local();
        assert_eq!(config.api_base_url, "http://localhost:20180");
        assert_eq!(config.auth_base_url, config.api_base_url);
        assert_eq!(config.realtime_endpoint, "ws://localhost:20180/ws/ws");
    }

    #[test]
    fn env_overrides_replace_individual_fields() {
        let config = config_with(&[
            (SERVER_BASE_URL_ENV, "http://chat.example:20081/"),
            (WEBSOCKET_URL_ENV, " ws://chat.example:9004/ws/ws "),
        ]);

        assert_eq!(config.api_base_url, "http://chat.example:20081");
        assert_eq!(config.auth_base_url, "http://localhost:20180");
        assert_eq!(config.realtime_endpoint, "ws://chat.example:9004/ws/ws");
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let config = config_with(&[(AUTH_BASE_URL_ENV, "   ")]);
        assert_eq!(config, ClientConfig::local());
    }
}
