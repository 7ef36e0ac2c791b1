//! Configuration Module
//!
//! Provides TOML-based configuration for mqkafka with support for:
//! - Source MQTT broker connection
//! - Destination Kafka cluster and topic
//! - Envelope encoding options
//! - Metrics endpoint
//! - Environment variable overrides (MQKAFKA__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::envelope::{PayloadEncoding, PresencePayloadStyle};

pub use metrics::MetricsConfig;
pub use sink::SinkConfig;
pub use source::{SourceConfig, DEFAULT_MQTT_PORT};

mod metrics;
mod sink;
mod source;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Source MQTT broker
    pub mqtt: SourceConfig,
    /// Destination Kafka cluster
    pub kafka: SinkConfig,
    /// Envelope options
    pub bridge: BridgeOptions,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// How envelopes are rendered before they are produced
#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct BridgeOptions {
    /// Encoding of the `payload` field
    pub payload_encoding: PayloadEncoding,
    /// Rendering of synthesized presence payloads
    pub presence_payload: PresencePayloadStyle,
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQKAFKA__` prefix with double underscores for nesting:
    ///    - `MQKAFKA__MQTT__ADDRESS=tcp://broker:1883` overrides `mqtt.address`
    ///    - `MQKAFKA__KAFKA__TOPIC=events` overrides `kafka.topic`
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, for callers that
    /// still apply overrides (CLI flags) before validating once.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQKAFKA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }

        self.mqtt.parse_address()?;

        if self.mqtt.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }

        if !self.mqtt.keep_alive.is_zero() && self.mqtt.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "mqtt.keep_alive must be 0 or at least 1s".to_string(),
            ));
        }

        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "mqtt.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.kafka.brokers.trim().is_empty() {
            return Err(ConfigError::Validation(
                "kafka.brokers must not be empty".to_string(),
            ));
        }

        // Kafka accepts up to 249 characters from [a-zA-Z0-9._-]
        let topic_re = Regex::new(r"^[a-zA-Z0-9._\-]{1,249}$").unwrap();
        if !topic_re.is_match(&self.kafka.topic) {
            return Err(ConfigError::Validation(format!(
                "kafka.topic '{}' is not a valid topic name",
                self.kafka.topic
            )));
        }

        Ok(())
    }
}
