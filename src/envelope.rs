//! Wire envelope: `{"type": "...", "payload": {...}, "correlationID": "..."}`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

/// The unit exchanged over the connection.
///
/// `message_type` is required and non-empty. The payload is schema-less at this
/// layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

impl MessageEnvelope {
    /// Envelope with an empty payload
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            payload: Map::new(),
            correlation_id: None,
        }
    }

    /// Builder-style payload setter
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Builder-style single field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Builder-style correlation id setter
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Reject envelopes the peer could not dispatch.
    pub fn validate(&self) -> Result<(), Error> {
        if !has_dispatchable_type(&self.message_type) {
            return Err(Error::InvalidEnvelope("type must be non-empty".to_string()));
        }
        Ok(())
    }

    /// Encode as a text frame.
    pub fn to_message(&self) -> Result<Message, Error> {
        self.validate()?;
        let json = serde_json::to_string(self)
            .map_err(|e| Error::InvalidEnvelope(format!("serialization failed: {}", e)))?;
        Ok(Message::Text(json))
    }

    /// Decode from raw JSON text.
    ///
    /// Missing, null or blank `type` and non-object payloads are malformed.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let envelope: MessageEnvelope =
            serde_json::from_str(text).map_err(|e| Error::malformed(e.to_string()))?;
        if !has_dispatchable_type(&envelope.message_type) {
            return Err(Error::malformed("empty type"));
        }
        Ok(envelope)
    }

    /// Decode from a binary frame, which must hold UTF-8 JSON.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::malformed(format!("binary frame is not UTF-8: {}", e)))?;
        Self::from_json(text)
    }
}

/// Same rule for both directions: `type` must have a non-whitespace character.
fn has_dispatchable_type(message_type: &str) -> bool {
    !message_type.trim().is_empty()
}
