//! Wire messages exchanged with an attached client.
//!
//! Every message is a JSON object tagged by `type`. Byte payloads travel as
//! standard base64 strings so arbitrary terminal output survives the trip.

use serde::{Deserialize, Serialize};
use tether_pty::ControlSignal;

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the process.
    Input {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The client's viewport changed.
    Resize { rows: u16, cols: u16 },
    /// Deliver a control signal to the process group.
    Signal { name: ControlSignal },
    /// Leave the session running and close this connection.
    Detach,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Live process output.
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Buffered recent output, sent once right after attaching.
    Replay {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The process exited. No further messages follow.
    Exited { code: i32 },
    /// The previous client message was refused. The connection stays open.
    Rejected { reason: String },
}

/// Errors at the message boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was readable but not a valid client message.
    #[error("malformed message: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Transport(e.to_string()))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}
