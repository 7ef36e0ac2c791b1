//! Canonical envelopes
//!
//! Every message crossing the bridge is re-shaped into an [`Envelope`]:
//! the kind of event, the identifier of the device it concerns and a payload.
//! Device messages keep their payload byte-for-byte; presence events either
//! keep the broker's payload or get a small synthesized one when the broker
//! only signals connectivity through the topic.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::topic::UNKNOWN_CLIENT_ID;

/// Kind of event carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Telemetry published by a device on its own topic
    #[serde(rename = "DEVICE_MESSAGE")]
    DeviceMessage,
    /// Client connect/disconnect reported by the broker
    #[serde(rename = "DEVICE_CONNECTED")]
    PresenceChange,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeviceMessage => "DEVICE_MESSAGE",
            EventKind::PresenceChange => "DEVICE_CONNECTED",
        }
    }
}

/// How synthesized presence payloads render the client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresencePayloadStyle {
    /// Identifier written bare: `{"clientID":abc123,"connected":false}`
    #[default]
    Legacy,
    /// Identifier written as a JSON string
    Json,
}

/// How the envelope payload is written into the serialized message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// UTF-8 text as-is, base64 when the bytes are not valid UTF-8
    #[default]
    Raw,
    /// Always standard base64
    Base64,
}

/// A normalized event ready to be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: EventKind,
    client_id: String,
    payload: Bytes,
}

impl Envelope {
    /// Build an envelope, resolving an empty identifier to `"unknown"`
    pub fn new(kind: EventKind, client_id: impl Into<String>, payload: Bytes) -> Self {
        let mut client_id = client_id.into();
        if client_id.trim().is_empty() {
            client_id = UNKNOWN_CLIENT_ID.to_string();
        }
        Self {
            kind,
            client_id,
            payload,
        }
    }

    /// Device telemetry, payload passed through unmodified
    pub fn device_message(client_id: impl Into<String>, payload: Bytes) -> Self {
        Self::new(EventKind::DeviceMessage, client_id, payload)
    }

    /// Presence event whose payload already describes the connection state
    pub fn presence(client_id: impl Into<String>, payload: Bytes) -> Self {
        Self::new(EventKind::PresenceChange, client_id, payload)
    }

    /// Presence event inferred from the topic, with a synthesized payload
    pub fn presence_from_topic(
        client_id: impl Into<String>,
        connected: bool,
        style: PresencePayloadStyle,
    ) -> Self {
        let mut envelope = Self::new(EventKind::PresenceChange, client_id, Bytes::new());
        envelope.payload = presence_payload(&envelope.client_id, connected, style);
        envelope
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the payload is valid UTF-8 and serializes verbatim in raw mode
    pub fn payload_is_text(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Serialize to the outbound `{type, clientID, payload}` JSON object
    pub fn to_json(&self, encoding: PayloadEncoding) -> serde_json::Result<Vec<u8>> {
        let payload = match (encoding, std::str::from_utf8(&self.payload)) {
            (PayloadEncoding::Raw, Ok(text)) => Cow::Borrowed(text),
            _ => Cow::Owned(BASE64.encode(&self.payload)),
        };
        serde_json::to_vec(&WireMessage {
            kind: self.kind,
            client_id: &self.client_id,
            payload,
        })
    }
}

/// Field order of the outbound message
#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(rename = "clientID")]
    client_id: &'a str,
    payload: Cow<'a, str>,
}

/// Synthesize a `{"clientID":..,"connected":..}` presence payload
pub fn presence_payload(client_id: &str, connected: bool, style: PresencePayloadStyle) -> Bytes {
    let text = match style {
        PresencePayloadStyle::Legacy => {
            format!(r#"{{"clientID":{},"connected":{}}}"#, client_id, connected)
        }
        PresencePayloadStyle::Json => json!({
            "clientID": client_id,
            "connected": connected,
        })
        .to_string(),
    };
    Bytes::from(text)
}
