//! Wire frames of the op protocol.
//!
//! Frame and payload encoding is bincode (serde, standard config):
//! ```text
//! ┌──────────────┬──────────┬───────────────────────────────┐
//! │ kind (varint)│ id (str) │ name + payload / return / ... │
//! └──────────────┴──────────┴───────────────────────────────┘
//! ```
//! Payloads are encoded separately from the frame, so a consumer can route a
//! frame by name without knowing the payload type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OpError;

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpMessage {
    /// Request expecting exactly one `op:return`.
    #[serde(rename = "op")]
    Op {
        id: String,
        name: String,
        payload: Vec<u8>,
    },
    /// Reply to `op`, or the failure of an `op:subscribe`.
    #[serde(rename = "op:return")]
    Return {
        id: String,
        result: Result<Vec<u8>, OpError>,
    },
    /// Request for a stream of `op:next`.
    #[serde(rename = "op:subscribe")]
    Subscribe {
        id: String,
        name: String,
        payload: Vec<u8>,
    },
    /// One value of a subscription.
    #[serde(rename = "op:next")]
    Next { id: String, value: Vec<u8> },
    /// Stop a subscription (either direction) or drop a request's reply.
    #[serde(rename = "op:cancel")]
    Cancel { id: String },
}

impl OpMessage {
    /// Wire name of this frame kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OpMessage::Op { .. } => "op",
            OpMessage::Return { .. } => "op:return",
            OpMessage::Subscribe { .. } => "op:subscribe",
            OpMessage::Next { .. } => "op:next",
            OpMessage::Cancel { .. } => "op:cancel",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            OpMessage::Op { id, .. }
            | OpMessage::Return { id, .. }
            | OpMessage::Subscribe { id, .. }
            | OpMessage::Next { id, .. }
            | OpMessage::Cancel { id } => id,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, OpError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, OpError> {
        decode(bytes)
    }
}

/// Encode an op payload or return value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, OpError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| OpError::Codec(e.to_string()))
}

/// Decode an op payload or return value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, OpError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| OpError::Codec(e.to_string()))?;
    Ok(value)
}
