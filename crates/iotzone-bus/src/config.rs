//! Bus connection configuration.

use crate::bus::BusError;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Configuration for connecting to an MQTT broker.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub broker_url: String,
    /// Client ID for MQTT connection
    pub client_id: String,
    /// Broker username
    pub username: Option<String>,
    /// Broker password
    pub password: Option<String>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Timeout of a single connection attempt
    pub connect_timeout: Duration,
    /// Capacity of the client request channel
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: format!("iotzone-{}", Uuid::new_v4()),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 100,
        }
    }
}

impl BusConfig {
    /// Configuration for the given broker with default settings.
    #[must_use]
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Self::default()
        }
    }

    /// Set broker credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Parse MQTT URL into host and port.
pub(crate) fn parse_mqtt_url(input: &str) -> Result<(String, u16), BusError> {
    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| BusError::InvalidUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(BusError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| BusError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BusError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| BusError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(BusError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}
