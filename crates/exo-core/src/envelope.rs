//! Wire-level message envelope.
//!
//! Every frame exchanged with the backend, on either transport, is one
//! envelope: `{"type": "...", "data": ...}`. Only `type` is interpreted by the
//! connection layer; `data` belongs to the application.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;

/// Chat message typed by the user or produced by the assistant.
pub const CHAT_MESSAGE: &str = "chat_message";
/// Recorded audio, base64 encoded under `data.audio`.
pub const VOICE_MESSAGE: &str = "voice_message";
/// Assistant activity broadcast (`data.state`).
pub const DOT_STATE: &str = "dot_state";
/// Generic application message.
pub const MESSAGE: &str = "message";

/// Envelope encode/decode error.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is not a valid envelope. The frame is dropped.
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    /// The envelope could not be serialized.
    #[error("Envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Typed unit of communication between client and backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque application payload.
    #[serde(rename = "data", default)]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope from a type and payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Chat message carrying `text`.
    #[must_use]
    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(CHAT_MESSAGE, json!({ "text": text.into() }))
    }

    /// Voice message carrying raw audio bytes (base64 encoded).
    #[must_use]
    pub fn voice(audio: &[u8], timestamp: f64) -> Self {
        Self::new(
            VOICE_MESSAGE,
            json!({ "audio": BASE64.encode(audio), "timestamp": timestamp }),
        )
    }

    /// Assistant activity broadcast.
    #[must_use]
    pub fn dot_state(state: &str) -> Self {
        Self::new(DOT_STATE, json!({ "state": state }))
    }

    /// Generic application message.
    #[must_use]
    pub fn message(payload: Value) -> Self {
        Self::new(MESSAGE, payload)
    }

    /// Whether this envelope has the given type.
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Decode audio data from a voice message.
    #[must_use]
    pub fn decode_audio(&self) -> Option<Vec<u8>> {
        if !self.is(VOICE_MESSAGE) {
            return None;
        }
        let data = self.payload.get("audio")?.as_str()?;
        BASE64.decode(data).ok()
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    /// Returns error if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EnvelopeError::Malformed(format!("{} payload: {e}", self.kind)))
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Malformed`] if the frame is not JSON, is not an
    /// object, or lacks a string `type`.
    pub fn decode(frame: &str) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_str(frame).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check what the type system cannot: the type must not be empty.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Malformed`] for an empty type.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.kind.is_empty() {
            return Err(EnvelopeError::Malformed("empty envelope type".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_roundtrip() {
        let audio = [0u8, 1, 2, 254, 255];
        let env = Envelope::voice(&audio, 1_700_000_000.5);
        let frame = env.encode().unwrap();

        let decoded = Envelope::decode(&frame).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.decode_audio().unwrap(), audio);
    }

    #[test]
    fn test_wire_shape_matches_backend() {
        let frame = Envelope::dot_state("listening").encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "dot_state");
        assert_eq!(value["data"]["state"], "listening");
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let env = Envelope::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.payload.is_null());
    }

    #[test]
    fn test_corrupted_frames_are_malformed() {
        for frame in [
            "",
            "not json",
            "[1,2,3]",
            r#"{"data":{}}"#,
            r#"{"type":42}"#,
            r#"{"type":""}"#,
            r#"{"type":"chat_message","data":{"text":"cut"#,
        ] {
            assert!(
                matches!(Envelope::decode(frame), Err(EnvelopeError::Malformed(_))),
                "frame {frame:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Chat {
            text: String,
        }

        let chat: Chat = Envelope::chat("hello").payload_as().unwrap();
        assert_eq!(chat.text, "hello");
        assert!(Envelope::dot_state("idle").payload_as::<Chat>().is_err());
    }

    #[test]
    fn test_decode_audio_only_for_voice() {
        assert!(Envelope::chat("hi").decode_audio().is_none());
        let bad = Envelope::new(VOICE_MESSAGE, json!({ "audio": "%%%" }));
        assert!(bad.decode_audio().is_none());
    }
}
