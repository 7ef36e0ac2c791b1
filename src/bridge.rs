//! Bridge Orchestrator
//!
//! Wires the subscription manager to the outbound publisher. Startup order
//! matters: the publisher must exist before the source session is opened so
//! no envelope is produced without a destination.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{BridgeOptions, Config};
use crate::envelope::{Envelope, PayloadEncoding};
use crate::error::BridgeError;
use crate::metrics::Metrics;
use crate::sink::OutboundPublisher;
use crate::source::{EnvelopeHandler, SourceStatus, SubscriptionManager};

/// A running bridge
pub struct Bridge {
    source: SubscriptionManager,
    publisher: Arc<OutboundPublisher>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Bridge {
    /// Start the bridge with a Kafka publisher
    pub async fn start(config: Config, metrics: Arc<Metrics>) -> Result<Self, BridgeError> {
        let publisher = OutboundPublisher::kafka(&config.kafka, metrics.clone())?;
        Self::with_publisher(config, publisher, metrics).await
    }

    /// Start the bridge with an already constructed publisher
    pub async fn with_publisher(
        config: Config,
        publisher: OutboundPublisher,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BridgeError> {
        let publisher = Arc::new(publisher);

        let mut source = SubscriptionManager::new(
            config.mqtt.clone(),
            config.bridge.presence_payload,
            metrics.clone(),
        )?;
        if let Err(e) = Self::open_source(&mut source).await {
            publisher.shutdown(config.kafka.flush_timeout).await;
            return Err(e);
        }

        let handler = forwarding_handler(publisher.clone(), config.bridge, metrics.clone());
        source.set_handler(handler);
        info!(
            "Bridge running: {} -> kafka topic '{}'",
            config.mqtt.address,
            publisher.topic()
        );

        Ok(Self {
            source,
            publisher,
            metrics,
            config,
        })
    }

    async fn open_source(source: &mut SubscriptionManager) -> Result<(), BridgeError> {
        source.connect().await?;
        source.subscribe().await
    }

    /// Current state of the source session
    pub fn source_status(&self) -> SourceStatus {
        self.source.status()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Subscription manager driving this bridge
    pub fn source(&self) -> &SubscriptionManager {
        &self.source
    }

    /// Disconnect from the source, then drain pending deliveries
    pub async fn shutdown(mut self) {
        info!("Shutting down bridge");
        self.source.disconnect().await;
        self.publisher.shutdown(self.config.kafka.flush_timeout).await;
        info!("Bridge stopped");
    }
}

/// Handler serializing each envelope and publishing it keyed by client ID
///
/// Errors concern a single message and are only logged.
pub fn forwarding_handler(
    publisher: Arc<OutboundPublisher>,
    options: BridgeOptions,
    metrics: Arc<Metrics>,
) -> EnvelopeHandler {
    Arc::new(move |envelope: Envelope| {
        if options.payload_encoding == PayloadEncoding::Raw && !envelope.payload_is_text() {
            // Indistinguishable from text downstream; base64 mode avoids this
            metrics.payload_base64_fallbacks.inc();
            warn!(
                client_id = envelope.client_id(),
                "Payload is not UTF-8, sending it base64-encoded"
            );
        }

        let bytes = match envelope.to_json(options.payload_encoding) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    client_id = envelope.client_id(),
                    "Failed to serialize envelope: {}", e
                );
                return;
            }
        };

        if let Err(e) = publisher.publish(envelope.client_id(), &bytes) {
            if e.is_fatal() {
                error!(client_id = envelope.client_id(), "Publish failed: {}", e);
            } else {
                warn!(client_id = envelope.client_id(), "Publish failed: {}", e);
            }
        }
    })
}
