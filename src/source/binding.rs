//! Subscription bindings and message dispatch
//!
//! A binding ties one topic filter to the pattern family used to classify
//! its messages and to the rule that turns them into envelopes. The
//! [`Dispatcher`] owns the bindings together with the installed handler and
//! runs classify → normalize → handler for each delivered message.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rumqttc::QoS;
use tracing::{debug, trace};

use crate::envelope::{Envelope, PresencePayloadStyle};
use crate::metrics::Metrics;
use crate::topic::{topic_matches_filter, PatternFamily, PatternTable, UNKNOWN_CLIENT_ID};

/// Callback receiving every normalized envelope
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// How a binding turns a message into an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeRule {
    /// Device telemetry, payload unchanged
    DeviceMessage,
    /// Presence with a broker-provided payload, passed through
    PresencePassthrough,
    /// Presence inferred from the topic: disconnected when the topic
    /// contains `marker`
    PresenceFromTopic { marker: &'static str },
}

impl EnvelopeRule {
    /// Build the envelope for a message received on `topic`
    pub fn apply(
        &self,
        topic: &str,
        client_id: String,
        payload: Bytes,
        style: PresencePayloadStyle,
    ) -> Envelope {
        match self {
            EnvelopeRule::DeviceMessage => Envelope::device_message(client_id, payload),
            EnvelopeRule::PresencePassthrough => Envelope::presence(client_id, payload),
            EnvelopeRule::PresenceFromTopic { marker } => {
                Envelope::presence_from_topic(client_id, !topic.contains(marker), style)
            }
        }
    }
}

/// One subscription of the bridge on the source broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionBinding {
    pub filter: &'static str,
    pub qos: QoS,
    pub family: PatternFamily,
    pub rule: EnvelopeRule,
}

/// Subscriptions registered on the source broker
///
/// Device telemetry is high volume and subscribed at QoS 1; presence topics
/// are low volume and subscribed at QoS 2.
pub fn default_bindings() -> Vec<SubscriptionBinding> {
    vec![
        SubscriptionBinding {
            filter: "device/+",
            qos: QoS::AtLeastOnce,
            family: PatternFamily::Device,
            rule: EnvelopeRule::DeviceMessage,
        },
        // EMQ X
        SubscriptionBinding {
            filter: "$SYS/brokers/+/clients/+/+",
            qos: QoS::ExactlyOnce,
            family: PatternFamily::EmqSys,
            rule: EnvelopeRule::PresenceFromTopic {
                marker: "disconnected",
            },
        },
        // Mosquitto
        SubscriptionBinding {
            filter: "$SYS/broker/clients/+",
            qos: QoS::ExactlyOnce,
            family: PatternFamily::MosquittoSys,
            rule: EnvelopeRule::PresencePassthrough,
        },
        // VerneMQ
        SubscriptionBinding {
            filter: "$SYS/+/mqtt/connect/received",
            qos: QoS::ExactlyOnce,
            family: PatternFamily::VerneSys,
            rule: EnvelopeRule::PresenceFromTopic {
                marker: "disconnect",
            },
        },
        SubscriptionBinding {
            filter: "$SYS/+/mqtt/disconnect/received",
            qos: QoS::ExactlyOnce,
            family: PatternFamily::VerneSys,
            rule: EnvelopeRule::PresenceFromTopic {
                marker: "disconnect",
            },
        },
    ]
}

/// Routes delivered messages through their bindings to the handler
pub struct Dispatcher {
    bindings: Vec<SubscriptionBinding>,
    patterns: &'static PatternTable,
    presence_style: PresencePayloadStyle,
    handler: RwLock<Option<EnvelopeHandler>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        bindings: Vec<SubscriptionBinding>,
        presence_style: PresencePayloadStyle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            bindings,
            patterns: PatternTable::builtin(),
            presence_style,
            handler: RwLock::new(None),
            metrics,
        }
    }

    pub fn bindings(&self) -> &[SubscriptionBinding] {
        &self.bindings
    }

    /// Install the handler, replacing any previous one
    pub fn set_handler(&self, handler: EnvelopeHandler) {
        *self.handler.write() = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Dispatch a delivered message to every binding whose filter matches
    ///
    /// Returns the number of envelopes handed to the handler.
    pub fn dispatch(&self, topic: &str, payload: Bytes) -> usize {
        let mut forwarded = 0;
        let mut matched = false;
        for binding in &self.bindings {
            if topic_matches_filter(topic, binding.filter) {
                matched = true;
                if self.dispatch_binding(binding, topic, payload.clone()) {
                    forwarded += 1;
                }
            }
        }
        if !matched {
            debug!(topic, "No subscription matches topic, dropping");
            self.metrics.message_dropped("unmatched");
        }
        forwarded
    }

    /// Classify and normalize a message under one binding, then invoke the handler
    ///
    /// Returns false when no handler is installed; the message is dropped.
    pub fn dispatch_binding(
        &self,
        binding: &SubscriptionBinding,
        topic: &str,
        payload: Bytes,
    ) -> bool {
        let client_id = self.patterns.classify(topic, binding.family);
        let resolved = client_id != UNKNOWN_CLIENT_ID;
        self.metrics
            .message_received(binding.family.as_str(), resolved);
        if !resolved {
            debug!(topic, family = %binding.family, "Client identifier not resolved");
        }

        let envelope = binding
            .rule
            .apply(topic, client_id, payload, self.presence_style);

        // Clone out of the lock so the handler runs without holding it
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                trace!(
                    topic,
                    client_id = envelope.client_id(),
                    kind = envelope.kind().as_str(),
                    "Dispatching envelope"
                );
                handler(envelope);
                true
            }
            None => {
                debug!(topic, "No handler installed, dropping message");
                self.metrics.message_dropped("no_handler");
                false
            }
        }
    }
}
