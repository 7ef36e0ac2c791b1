//! Bridge Errors
//!
//! Every failure the bridge can report carries a [`Severity`]. Fatal errors
//! happen while establishing the source or destination session and end the
//! process; transient errors concern a single message and are only logged.

use std::fmt;

use crate::config::ConfigError;

/// How the process should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Unrecoverable at startup, the process terminates
    Fatal,
    /// Affects a single message, reported and otherwise ignored
    Transient,
}

/// Error type for bridge operations
#[derive(Debug)]
pub enum BridgeError {
    /// Invalid configuration
    Config(ConfigError),
    /// Source broker connection could not be established or was rejected
    SourceConnect(String),
    /// Source broker rejected a subscription
    Subscribe { filter: String, reason: String },
    /// Kafka producer could not be created
    ProducerCreate(String),
    /// Operation called in the wrong lifecycle state
    InvalidState(&'static str),
    /// Message could not be handed to the outbound producer
    Enqueue(String),
    /// Outbound delivery failed
    Delivery(String),
}

impl BridgeError {
    /// Classify this error
    pub fn severity(&self) -> Severity {
        match self {
            BridgeError::Config(_)
            | BridgeError::SourceConnect(_)
            | BridgeError::Subscribe { .. }
            | BridgeError::ProducerCreate(_)
            | BridgeError::InvalidState(_) => Severity::Fatal,
            BridgeError::Enqueue(_) | BridgeError::Delivery(_) => Severity::Transient,
        }
    }

    /// Check if this error should terminate the process
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "Configuration error: {}", e),
            BridgeError::SourceConnect(msg) => write!(f, "MQTT connect failed: {}", msg),
            BridgeError::Subscribe { filter, reason } => {
                write!(f, "MQTT subscribe to '{}' failed: {}", filter, reason)
            }
            BridgeError::ProducerCreate(msg) => write!(f, "Kafka producer creation failed: {}", msg),
            BridgeError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            BridgeError::Enqueue(msg) => write!(f, "Publish enqueue failed: {}", msg),
            BridgeError::Delivery(msg) => write!(f, "Delivery failed: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}
