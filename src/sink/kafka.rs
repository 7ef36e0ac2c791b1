//! Kafka producer backed by librdkafka

use std::time::Duration;

use futures_util::FutureExt;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::warn;

use super::{DeliveryFuture, DeliveryProducer, DeliveryReport};
use crate::config::SinkConfig;
use crate::error::BridgeError;

/// [`DeliveryProducer`] that writes to a Kafka cluster
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// Create the underlying client; fails when the configuration is rejected
    pub fn new(config: &SinkConfig) -> Result<Self, BridgeError> {
        let mut cfg = ClientConfig::new();
        for (key, value) in config.producer_properties() {
            cfg.set(key, value);
        }

        let producer: FutureProducer = cfg
            .create()
            .map_err(|e: KafkaError| BridgeError::ProducerCreate(e.to_string()))?;

        Ok(Self { producer })
    }
}

impl DeliveryProducer for KafkaProducer {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<DeliveryFuture, BridgeError> {
        // Partition left unset: librdkafka's default partitioner hashes the key
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _record)| BridgeError::Enqueue(e.to_string()))?;

        let key = key.to_string();
        let topic = topic.to_string();
        Ok(delivery
            .map(move |outcome| match outcome {
                Ok(Ok((partition, offset))) => {
                    DeliveryReport::delivered(&key, &topic, partition, offset)
                }
                Ok(Err((e, message))) => {
                    DeliveryReport::failed(&key, message.topic(), Some(message.partition()), e)
                }
                Err(canceled) => DeliveryReport::failed(&key, &topic, None, canceled),
            })
            .boxed())
    }

    fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(timeout) {
            warn!("Kafka flush failed: {}", e);
        }
    }
}
