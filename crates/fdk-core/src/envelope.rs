// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport-agnostic message carrier.

use serde::{Deserialize, Serialize};

/// Immutable carrier for an inbound or outbound message.
///
/// Triggers construct one envelope per transport message; the runtime only
/// ever reads it. Response envelopes built by triggers leave
/// `received_topic` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Opaque id propagated end-to-end to tie logs, metrics, and retries
    /// together.
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    /// MIME type of `payload`.
    pub content_type: String,
    /// Raw message bytes.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// Topic the message arrived on, when the transport has topics.
    #[serde(default)]
    pub received_topic: String,
}

impl MessageEnvelope {
    /// Build an envelope for a message received on a topic.
    pub fn new(
        correlation_id: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
        received_topic: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            content_type: content_type.into(),
            payload,
            received_topic: received_topic.into(),
        }
    }

    /// Build a response envelope carrying pipeline output.
    pub fn response(
        correlation_id: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            content_type: content_type.into(),
            payload,
            received_topic: String::new(),
        }
    }
}

/// Envelope payloads travel base64-encoded inside the JSON wire form.
mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
