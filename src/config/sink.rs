//! Kafka Sink Configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Destination cluster settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Bootstrap servers (comma-separated `host:port` list)
    pub brokers: String,

    /// Topic every envelope is produced to
    pub topic: String,

    /// Client ID reported to the cluster
    pub client_id: Option<String>,

    /// Local delivery timeout per message (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,

    /// Time allowed to flush queued messages on shutdown
    #[serde(with = "humantime_serde")]
    pub flush_timeout: Duration,

    /// Additional librdkafka properties, applied last
    pub properties: BTreeMap<String, String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            brokers: "kafka:9092".to_string(),
            topic: "mqkafka".to_string(),
            client_id: None,
            message_timeout: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(5),
            properties: BTreeMap::new(),
        }
    }
}

impl SinkConfig {
    /// Flattened producer properties in the order they are applied
    pub fn producer_properties(&self) -> Vec<(String, String)> {
        let mut props = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            (
                "message.timeout.ms".to_string(),
                self.message_timeout.as_millis().to_string(),
            ),
        ];
        if let Some(client_id) = &self.client_id {
            props.push(("client.id".to_string(), client_id.clone()));
        }
        props.extend(
            self.properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        props
    }
}
