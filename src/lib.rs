//! mqkafka - MQTT to Kafka bridge for device telemetry and presence
//!
//! Subscribes to device topics and broker presence (`$SYS`) topics on an
//! MQTT broker, normalizes every message into a common JSON envelope and
//! produces it to a Kafka topic keyed by device identifier.

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod topic;

pub use bridge::{forwarding_handler, Bridge};
pub use config::Config;
pub use envelope::{Envelope, EventKind, PayloadEncoding, PresencePayloadStyle};
pub use error::{BridgeError, Severity};
pub use metrics::{Metrics, MetricsServer};
pub use sink::{DeliveryFuture, DeliveryProducer, DeliveryReport, KafkaProducer, OutboundPublisher};
pub use source::{SourceStatus, SubscriptionManager};
pub use topic::{classify, PatternFamily};
