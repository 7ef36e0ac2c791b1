//! Subscription manager and dispatch tests

use bytes::Bytes;
use pretty_assertions::assert_eq;
use rumqttc::QoS;
use test_case::test_case;

use super::*;
use crate::envelope::{Envelope, EventKind, PayloadEncoding};
use crate::topic::PatternFamily;

/// Dispatcher with the default bindings and a handler collecting envelopes
fn collecting_dispatcher(
    style: PresencePayloadStyle,
) -> (Dispatcher, Arc<parking_lot::Mutex<Vec<Envelope>>>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::new(default_bindings(), style, metrics.clone());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    dispatcher.set_handler(Arc::new(move |envelope: Envelope| sink.lock().push(envelope)));
    (dispatcher, seen, metrics)
}

fn json(envelope: &Envelope) -> String {
    String::from_utf8(envelope.to_json(PayloadEncoding::Raw).unwrap()).unwrap()
}

#[test]
fn test_default_bindings() {
    let bindings = default_bindings();
    let filters: Vec<_> = bindings.iter().map(|b| b.filter).collect();
    assert_eq!(
        filters,
        vec![
            "device/+",
            "$SYS/brokers/+/clients/+/+",
            "$SYS/broker/clients/+",
            "$SYS/+/mqtt/connect/received",
            "$SYS/+/mqtt/disconnect/received",
        ]
    );
    assert_eq!(bindings[0].qos, QoS::AtLeastOnce);
    assert!(bindings[1..].iter().all(|b| b.qos == QoS::ExactlyOnce));
}

#[test]
fn test_device_message_forwarded() {
    let (dispatcher, seen, metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);

    assert_eq!(dispatcher.dispatch("device/sensor-42", Bytes::from_static(b"23.5")), 1);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::DeviceMessage);
    assert_eq!(seen[0].client_id(), "sensor-42");
    assert_eq!(
        json(&seen[0]),
        r#"{"type":"DEVICE_MESSAGE","clientID":"sensor-42","payload":"23.5"}"#
    );
    assert_eq!(
        metrics
            .messages_received
            .with_label_values(&["device"])
            .get(),
        1
    );
}

#[test]
fn test_emq_disconnect_synthesizes_presence() {
    let (dispatcher, seen, _metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);

    dispatcher.dispatch(
        "$SYS/brokers/emqx@node1/clients/abc123/disconnected",
        Bytes::from_static(b"{\"reason\":\"normal\"}"),
    );

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::PresenceChange);
    assert_eq!(seen[0].client_id(), "abc123");
    assert_eq!(
        seen[0].payload(),
        &Bytes::from_static(b"{\"clientID\":abc123,\"connected\":false}")
    );
}

#[test]
fn test_emq_connect_synthesizes_presence() {
    let (dispatcher, seen, _metrics) = collecting_dispatcher(PresencePayloadStyle::Json);

    dispatcher.dispatch(
        "$SYS/brokers/emqx@node1/clients/abc123/connected",
        Bytes::new(),
    );

    let seen = seen.lock();
    assert_eq!(
        seen[0].payload(),
        &Bytes::from_static(b"{\"clientID\":\"abc123\",\"connected\":true}")
    );
}

#[test_case("$SYS/node1/mqtt/connect/received", "node1", true ; "connect")]
#[test_case("$SYS/node1/mqtt/disconnect/received", "node1", false ; "disconnect")]
fn test_vernemq_presence(topic: &str, client_id: &str, connected: bool) {
    let (dispatcher, seen, _metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);

    dispatcher.dispatch(topic, Bytes::from_static(b"ignored"));

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::PresenceChange);
    assert_eq!(seen[0].client_id(), client_id);
    let expected = format!(r#"{{"clientID":{},"connected":{}}}"#, client_id, connected);
    assert_eq!(seen[0].payload(), &Bytes::from(expected));
}

#[test]
fn test_mosquitto_payload_passed_through() {
    let (dispatcher, seen, _metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);

    dispatcher.dispatch("$SYS/broker/clients/connected", Bytes::from_static(b"17"));

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::PresenceChange);
    assert_eq!(seen[0].client_id(), "connected");
    assert_eq!(seen[0].payload(), &Bytes::from_static(b"17"));
}

#[test]
fn test_unresolved_client_id_still_forwarded() {
    let (dispatcher, seen, metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);

    // Delivered under the device binding but not shaped like a device topic
    let binding = dispatcher.bindings()[0].clone();
    assert!(dispatcher.dispatch_binding(&binding, "random/unmatched/path", Bytes::from_static(b"x")));

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].client_id(), "unknown");
    assert_eq!(
        metrics
            .unknown_client_ids
            .with_label_values(&["device"])
            .get(),
        1
    );
}

#[test]
fn test_unmatched_topic_dropped() {
    let (dispatcher, seen, metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);

    assert_eq!(dispatcher.dispatch("random/unmatched/path", Bytes::new()), 0);
    assert_eq!(dispatcher.dispatch("device/a/b", Bytes::new()), 0);

    assert!(seen.lock().is_empty());
    assert_eq!(
        metrics
            .messages_dropped
            .with_label_values(&["unmatched"])
            .get(),
        2
    );
}

#[test]
fn test_no_handler_drops_message() {
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::new(
        default_bindings(),
        PresencePayloadStyle::Legacy,
        metrics.clone(),
    );
    assert!(!dispatcher.has_handler());

    assert_eq!(dispatcher.dispatch("device/sensor-42", Bytes::from_static(b"1")), 0);
    assert_eq!(
        metrics
            .messages_dropped
            .with_label_values(&["no_handler"])
            .get(),
        1
    );
}

#[test]
fn test_handler_replaced() {
    let (dispatcher, first, _metrics) = collecting_dispatcher(PresencePayloadStyle::Legacy);
    dispatcher.dispatch("device/a", Bytes::new());

    let second = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = second.clone();
    dispatcher.set_handler(Arc::new(move |envelope: Envelope| {
        sink.lock().push(envelope.client_id().to_string())
    }));
    dispatcher.dispatch("device/b", Bytes::new());

    assert_eq!(first.lock().len(), 1);
    assert_eq!(*second.lock(), vec!["b".to_string()]);
}

#[test]
fn test_every_matching_binding_is_invoked() {
    let metrics = Arc::new(Metrics::new());
    let mut bindings = default_bindings();
    bindings.push(SubscriptionBinding {
        filter: "device/#",
        qos: QoS::AtMostOnce,
        family: PatternFamily::Device,
        rule: EnvelopeRule::DeviceMessage,
    });
    let dispatcher = Dispatcher::new(bindings, PresencePayloadStyle::Legacy, metrics);
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = count.clone();
    dispatcher.set_handler(Arc::new(move |_: Envelope| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));

    assert_eq!(dispatcher.dispatch("device/x", Bytes::new()), 2);
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
}

fn unreachable_config() -> SourceConfig {
    // Reserve a port, then release it so nothing listens there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    SourceConfig {
        address: format!("tcp://127.0.0.1:{}", port),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_unreachable_broker_is_fatal() {
    let metrics = Arc::new(Metrics::new());
    let mut manager =
        SubscriptionManager::new(unreachable_config(), PresencePayloadStyle::Legacy, metrics.clone())
            .unwrap();

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, BridgeError::SourceConnect(_)));
    assert!(err.is_fatal());
    assert_eq!(manager.status(), SourceStatus::Disconnected);
    assert_eq!(metrics.source_connected.get(), 0);
}

#[tokio::test]
async fn test_subscribe_requires_connection() {
    let mut manager = SubscriptionManager::new(
        unreachable_config(),
        PresencePayloadStyle::Legacy,
        Arc::new(Metrics::new()),
    )
    .unwrap();

    let err = manager.subscribe().await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState(_)));

    // Disconnecting an idle manager is a no-op
    manager.disconnect().await;
    assert_eq!(manager.status(), SourceStatus::Disconnected);
}

#[test]
fn test_invalid_address_rejected() {
    let config = SourceConfig {
        address: "ws://broker:8080".to_string(),
        ..Default::default()
    };
    let result =
        SubscriptionManager::new(config, PresencePayloadStyle::Legacy, Arc::new(Metrics::new()));
    assert!(matches!(result, Err(BridgeError::Config(_))));
}
