//! Outbound Publisher
//!
//! Hands serialized envelopes to the destination producer without waiting
//! for acknowledgment. Every accepted send yields a delivery future; a single
//! background task awaits those futures in order and logs failures together
//! with their partition metadata. Failed deliveries are not retried.
//!
//! The drain task runs until [`OutboundPublisher::shutdown`] is called, at
//! which point it stops accepting new deliveries and finishes the ones
//! already queued within a bounded window.

mod kafka;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::error::BridgeError;
use crate::metrics::Metrics;

pub use kafka::KafkaProducer;

/// Future resolving to the outcome of one send
pub type DeliveryFuture = BoxFuture<'static, DeliveryReport>;

/// Outcome of a single delivery as reported by the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Message key (device identifier)
    pub key: String,
    /// Destination topic
    pub topic: String,
    /// Partition the message was (or would have been) written to
    pub partition: Option<i32>,
    /// Offset assigned by the cluster
    pub offset: Option<i64>,
    /// Error description when the delivery failed
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered(key: &str, topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            key: key.to_string(),
            topic: topic.to_string(),
            partition: Some(partition),
            offset: Some(offset),
            error: None,
        }
    }

    pub fn failed(key: &str, topic: &str, partition: Option<i32>, error: impl fmt::Display) -> Self {
        Self {
            key: key.to_string(),
            topic: topic.to_string(),
            partition,
            offset: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The failure as a transient [`BridgeError::Delivery`]
    pub fn check(&self) -> Result<(), BridgeError> {
        match &self.error {
            None => Ok(()),
            Some(error) => Err(BridgeError::Delivery(format!(
                "{} (key={}, topic={}, partition={:?})",
                error, self.key, self.topic, self.partition
            ))),
        }
    }
}

/// Keyed, asynchronous producer the publisher sends through
pub trait DeliveryProducer: Send + Sync + 'static {
    /// Enqueue a message; must not block on broker acknowledgment
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<DeliveryFuture, BridgeError>;

    /// Wait up to `timeout` for queued messages to leave the client
    fn flush(&self, _timeout: Duration) {}
}

/// Fire-and-forget publisher with a supervised delivery drain task
pub struct OutboundPublisher {
    producer: Arc<dyn DeliveryProducer>,
    topic: String,
    metrics: Arc<Metrics>,
    pending_tx: mpsc::UnboundedSender<DeliveryFuture>,
    shutdown_tx: broadcast::Sender<()>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundPublisher {
    /// Create a publisher and spawn its drain task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        producer: Arc<dyn DeliveryProducer>,
        topic: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let drain = tokio::spawn(drain_deliveries(
            pending_rx,
            shutdown_rx,
            metrics.clone(),
        ));

        Self {
            producer,
            topic: topic.into(),
            metrics,
            pending_tx,
            shutdown_tx,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Create a publisher backed by a Kafka producer
    pub fn kafka(config: &SinkConfig, metrics: Arc<Metrics>) -> Result<Self, BridgeError> {
        let producer = KafkaProducer::new(config)?;
        info!(
            "Kafka producer created (brokers={}, topic={})",
            config.brokers, config.topic
        );
        Ok(Self::new(Arc::new(producer), config.topic.clone(), metrics))
    }

    /// Destination topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueue `payload` keyed by `key`; returns without waiting for delivery
    pub fn publish(&self, key: &str, payload: &[u8]) -> Result<(), BridgeError> {
        if self.pending_tx.is_closed() {
            self.metrics.publish_failures.inc();
            return Err(BridgeError::Enqueue("publisher is shut down".to_string()));
        }

        let delivery = match self.producer.send(&self.topic, key, payload) {
            Ok(delivery) => delivery,
            Err(e) => {
                self.metrics.publish_failures.inc();
                return Err(e);
            }
        };

        self.metrics.envelopes_forwarded.inc();
        if self.pending_tx.send(delivery).is_err() {
            // Drain task already gone; the message was still handed to the producer
            debug!(key, "Delivery report dropped, drain task stopped");
        }
        Ok(())
    }

    /// Stop the drain task, letting queued deliveries finish within `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        let Some(handle) = self.drain.lock().take() else {
            return;
        };

        let producer = self.producer.clone();
        let flush = tokio::task::spawn_blocking(move || producer.flush(timeout));
        if tokio::time::timeout(timeout, flush).await.is_err() {
            warn!("Producer flush did not finish within {:?}", timeout);
        }

        let _ = self.shutdown_tx.send(());
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => debug!("Delivery drain task stopped"),
            Err(_) => {
                warn!(
                    "Delivery drain task did not finish within {:?}, aborting",
                    timeout
                );
                abort.abort();
            }
        }
    }
}

impl Drop for OutboundPublisher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Await delivery futures in order until shutdown or channel close
async fn drain_deliveries(
    mut pending_rx: mpsc::UnboundedReceiver<DeliveryFuture>,
    mut shutdown_rx: broadcast::Receiver<()>,
    metrics: Arc<Metrics>,
) {
    loop {
        tokio::select! {
            delivery = pending_rx.recv() => {
                match delivery {
                    Some(delivery) => report(delivery.await, &metrics),
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => {
                // Stop accepting, then finish what is already queued
                pending_rx.close();
                while let Some(delivery) = pending_rx.recv().await {
                    report(delivery.await, &metrics);
                }
                break;
            }
        }
    }
    debug!("Delivery drain loop terminated");
}

fn report(report: DeliveryReport, metrics: &Metrics) {
    metrics.delivery(report.is_ok());
    match report.check() {
        Ok(()) => debug!(
            key = %report.key,
            topic = %report.topic,
            partition = ?report.partition,
            offset = ?report.offset,
            "Delivered"
        ),
        Err(e) => warn!("{}", e),
    }
}
