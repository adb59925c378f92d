//! Binary protocol for the document sync channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ space_id │ clock    │ payload  │
//! │ 1 byte   │ varint+N │ varint   │ variable │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake, per (re)connect:
//! ```text
//! client                         relay
//!   │── SyncStep1(client sv) ──────▸│
//!   │◂───── SyncStep2(diff) ────────│   client marks synced
//!   │◂───── SyncStep1(relay sv) ────│
//!   │── SyncStep2(diff) ───────────▸│   relay integrates + fans out
//!   │◂═══════ Update ═══════════════▸│
//! ```

use serde::{Deserialize, Serialize};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector
    SyncStep1 = 1,
    /// Yrs state diff answering a state vector
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// Top-level sync channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub space_id: String,
    /// Sender-local sequence number, for diagnostics only.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, space_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            space_id: space_id.to_string(),
            clock,
            payload,
        }
    }

    pub fn update(space_id: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, space_id, clock, yrs_update)
    }

    pub fn sync_step1(space_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, space_id, 0, state_vector)
    }

    pub fn sync_step2(space_id: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, space_id, 0, state_diff)
    }

    pub fn ping(space_id: &str) -> Self {
        Self::new(MessageType::Ping, space_id, 0, Vec::new())
    }

    pub fn pong(space_id: &str) -> Self {
        Self::new(MessageType::Pong, space_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    WrongSpace { expected: String, got: String },
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::WrongSpace { expected, got } => {
                write!(f, "Message for space {got} on channel for {expected}")
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
