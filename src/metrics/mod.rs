//! Prometheus metrics for mqkafka
//!
//! Counts messages per pattern family on the way in and delivery outcomes on
//! the way out. Exposed at `/metrics` when the metrics endpoint is enabled.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All bridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Source side
    pub messages_received: IntCounterVec,
    pub unknown_client_ids: IntCounterVec,
    pub messages_dropped: IntCounterVec,
    pub source_connected: IntGauge,
    pub source_reconnects: IntCounter,

    // Sink side
    pub envelopes_forwarded: IntCounter,
    pub publish_failures: IntCounter,
    pub deliveries_succeeded: IntCounter,
    pub deliveries_failed: IntCounter,
    /// Raw-mode payloads that were not UTF-8 and went out as base64
    pub payload_base64_fallbacks: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounterVec::new(
            Opts::new(
                "mqkafka_messages_received_total",
                "MQTT messages received by pattern family",
            ),
            &["family"],
        )
        .unwrap();

        let unknown_client_ids = IntCounterVec::new(
            Opts::new(
                "mqkafka_unknown_client_ids_total",
                "Messages whose topic did not yield a client identifier",
            ),
            &["family"],
        )
        .unwrap();

        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "mqkafka_messages_dropped_total",
                "MQTT messages dropped before forwarding",
            ),
            &["reason"],
        )
        .unwrap();

        let source_connected = IntGauge::with_opts(Opts::new(
            "mqkafka_source_connected",
            "1 while the source MQTT session is up",
        ))
        .unwrap();

        let source_reconnects = IntCounter::with_opts(Opts::new(
            "mqkafka_source_reconnects_total",
            "Source MQTT session re-establishments",
        ))
        .unwrap();

        let envelopes_forwarded = IntCounter::with_opts(Opts::new(
            "mqkafka_envelopes_forwarded_total",
            "Envelopes handed to the Kafka producer",
        ))
        .unwrap();

        let publish_failures = IntCounter::with_opts(Opts::new(
            "mqkafka_publish_failures_total",
            "Envelopes the Kafka producer refused to enqueue",
        ))
        .unwrap();

        let deliveries_succeeded = IntCounter::with_opts(Opts::new(
            "mqkafka_deliveries_succeeded_total",
            "Kafka deliveries acknowledged by the cluster",
        ))
        .unwrap();

        let deliveries_failed = IntCounter::with_opts(Opts::new(
            "mqkafka_deliveries_failed_total",
            "Kafka deliveries reported as failed",
        ))
        .unwrap();

        let payload_base64_fallbacks = IntCounter::with_opts(Opts::new(
            "mqkafka_payload_base64_fallbacks_total",
            "Non-UTF-8 payloads base64-encoded in raw payload mode",
        ))
        .unwrap();

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(unknown_client_ids.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(source_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(source_reconnects.clone()))
            .unwrap();
        registry
            .register(Box::new(envelopes_forwarded.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(deliveries_succeeded.clone()))
            .unwrap();
        registry
            .register(Box::new(deliveries_failed.clone()))
            .unwrap();
        registry
            .register(Box::new(payload_base64_fallbacks.clone()))
            .unwrap();

        Self {
            registry,
            messages_received,
            unknown_client_ids,
            messages_dropped,
            source_connected,
            source_reconnects,
            envelopes_forwarded,
            publish_failures,
            deliveries_succeeded,
            deliveries_failed,
            payload_base64_fallbacks,
        }
    }

    /// Record an inbound message for a pattern family
    pub fn message_received(&self, family: &str, resolved: bool) {
        self.messages_received.with_label_values(&[family]).inc();
        if !resolved {
            self.unknown_client_ids.with_label_values(&[family]).inc();
        }
    }

    /// Record a message dropped before forwarding
    pub fn message_dropped(&self, reason: &str) {
        self.messages_dropped.with_label_values(&[reason]).inc();
    }

    pub fn set_source_connected(&self, connected: bool) {
        self.source_connected.set(i64::from(connected));
    }

    /// Record the outcome of one Kafka delivery
    pub fn delivery(&self, ok: bool) {
        if ok {
            self.deliveries_succeeded.inc();
        } else {
            self.deliveries_failed.inc();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
