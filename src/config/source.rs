//! MQTT Source Configuration
//!
//! Connection settings for the broker the bridge subscribes to.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Default MQTT port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Source broker connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Broker address: `tcp://host:port`, `mqtt://host:port` or `host[:port]`;
    /// IPv6 hosts go in brackets (`tcp://[::1]:1883`)
    pub address: String,

    /// Client ID presented to the broker
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Start with a clean session
    pub clean_session: bool,

    /// Keep-alive interval (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Time allowed for CONNACK and SUBACK handshakes
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Delay between reconnect attempts after the session is lost
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Time allowed for in-flight work to drain on disconnect
    #[serde(with = "humantime_serde")]
    pub disconnect_timeout: Duration,

    /// Capacity of the client request channel
    pub channel_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address: "tcp://mqtt:1883".to_string(),
            client_id: "mqtttokafka".to_string(),
            username: None,
            password: None,
            clean_session: false,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            disconnect_timeout: Duration::from_millis(240),
            channel_capacity: 64,
        }
    }
}

impl SourceConfig {
    /// Parse the address into host and port
    pub fn parse_address(&self) -> Result<(String, u16), ConfigError> {
        let address = self.address.trim();
        let rest = match address.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => rest,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "unsupported MQTT address scheme '{}' (use tcp:// or mqtt://)",
                        other
                    )))
                }
            },
            None => address,
        };
        let rest = rest.trim_end_matches('/');

        if rest.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.address must not be empty".to_string(),
            ));
        }

        // IPv6 literals must be bracketed: `[::1]:1883` or `[::1]`
        let (host, port_str) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                ConfigError::Validation(format!("unterminated '[' in MQTT address '{}'", rest))
            })?;
            let port_str = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    ConfigError::Validation(format!("unexpected '{}' after ']'", tail))
                })?),
            };
            (host, port_str)
        } else if rest.matches(':').count() > 1 {
            return Err(ConfigError::Validation(format!(
                "IPv6 address '{}' must be written as [addr]:port",
                rest
            )));
        } else {
            match rest.split_once(':') {
                Some((host, port_str)) => (host, Some(port_str)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.address has no host".to_string(),
            ));
        }

        let port = match port_str {
            Some(port_str) => port_str.parse::<u16>().map_err(|_| {
                ConfigError::Validation(format!("invalid MQTT port '{}'", port_str))
            })?,
            None => DEFAULT_MQTT_PORT,
        };
        Ok((host.to_string(), port))
    }

    /// Credentials, when a username is configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| (u, self.password.as_deref().unwrap_or("")))
    }
}
