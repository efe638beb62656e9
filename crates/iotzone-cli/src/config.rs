//! CLI configuration.

use anyhow::{bail, Result};
use iotzone_bus::BusConfig;
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Broker connection settings
    pub bus: BusConfig,

    /// PEM file holding the private key
    pub key_file: PathBuf,

    /// Domain identities are issued for
    pub domain: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            key_file: PathBuf::from("./iotzone.pem"),
            domain: "default".to_string(),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `IOTZONE_MQTT_BROKER`: MQTT broker URL
    /// - `IOTZONE_CLIENT_ID`: MQTT client identifier
    /// - `IOTZONE_MQTT_USERNAME`: broker username
    /// - `IOTZONE_MQTT_PASSWORD`: broker password
    /// - `IOTZONE_KEY_FILE`: private key PEM file
    /// - `IOTZONE_DOMAIN`: domain identifier
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = var("IOTZONE_MQTT_BROKER") {
            config.bus.broker_url = url;
        }

        if let Some(client_id) = var("IOTZONE_CLIENT_ID") {
            if client_id.is_empty() {
                bail!("Invalid IOTZONE_CLIENT_ID: must not be empty");
            }
            config.bus.client_id = client_id;
        }

        match (var("IOTZONE_MQTT_USERNAME"), var("IOTZONE_MQTT_PASSWORD")) {
            (Some(username), Some(password)) => {
                config.bus = config.bus.with_credentials(username, password);
            }
            (None, None) => {}
            _ => bail!("IOTZONE_MQTT_USERNAME and IOTZONE_MQTT_PASSWORD must be set together"),
        }

        if let Some(path) = var("IOTZONE_KEY_FILE") {
            config.key_file = PathBuf::from(path);
        }

        if let Some(domain) = var("IOTZONE_DOMAIN") {
            if domain.is_empty() || domain.contains('/') || domain.starts_with('$') {
                bail!("Invalid IOTZONE_DOMAIN: {domain:?}");
            }
            config.domain = domain;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CliConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        CliConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bus.broker_url, "tcp://localhost:1883");
        assert_eq!(config.domain, "default");
        assert_eq!(config.key_file, PathBuf::from("./iotzone.pem"));
        assert!(config.bus.username.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let config = load(&[
            ("IOTZONE_MQTT_BROKER", "mqtt://broker:1884"),
            ("IOTZONE_CLIENT_ID", "operator"),
            ("IOTZONE_MQTT_USERNAME", "user"),
            ("IOTZONE_MQTT_PASSWORD", "secret"),
            ("IOTZONE_KEY_FILE", "/etc/iotzone/key.pem"),
            ("IOTZONE_DOMAIN", "zone1"),
        ])
        .unwrap();

        assert_eq!(config.bus.broker_url, "mqtt://broker:1884");
        assert_eq!(config.bus.client_id, "operator");
        assert_eq!(config.bus.password.as_deref(), Some("secret"));
        assert_eq!(config.key_file, PathBuf::from("/etc/iotzone/key.pem"));
        assert_eq!(config.domain, "zone1");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load(&[("IOTZONE_DOMAIN", "a/b")]).is_err());
        assert!(load(&[("IOTZONE_CLIENT_ID", "")]).is_err());
        assert!(load(&[("IOTZONE_MQTT_USERNAME", "user")]).is_err());
    }
}
