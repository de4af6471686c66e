//! Frame protocol of the primary transport.
//!
//! The primary channel wraps every envelope in an `event` frame carrying a
//! sequence id that the receiver acknowledges. The server opens the session
//! with an `open` handshake that announces its heartbeat interval; the client
//! pings on that interval and expects traffic back.

use exo_core::{Envelope, EnvelopeError};
use serde::{Deserialize, Serialize};

/// Frame from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Application envelope.
    Event { id: u64, envelope: Envelope },
    /// Acknowledge a server event.
    Ack { id: u64 },
    /// Heartbeat.
    Ping,
    /// Orderly shutdown.
    Close { reason: String },
}

/// Frame from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake; the channel counts as opened once this arrives.
    Open { heartbeat_ms: u64 },
    /// Application envelope.
    Event { id: u64, envelope: Envelope },
    /// Acknowledge a client event.
    Ack { id: u64 },
    /// Heartbeat reply.
    Pong,
    /// Orderly shutdown.
    Close { reason: String },
}

macro_rules! frame_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to a text frame.
            ///
            /// # Errors
            /// Returns error if the embedded payload cannot be serialized.
            pub fn encode(&self) -> Result<String, EnvelopeError> {
                Ok(serde_json::to_string(self)?)
            }

            /// Parse a text frame.
            ///
            /// # Errors
            /// Returns [`EnvelopeError::Malformed`] if the frame is not valid.
            pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
                let frame: Self = serde_json::from_str(text)
                    .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
                if let Self::Event { envelope, .. } = &frame {
                    envelope.validate()?;
                }
                Ok(frame)
            }
        }
    };
}

frame_codec!(ClientFrame);
frame_codec!(ServerFrame);
