//! Binary protocol for text sync and presence.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Messages originating at the relay carry `Uuid::nil()` as `peer_id`.
//! For `Awareness` messages `clock` is the sender's presence clock.

use codepad_core::{Position, Range};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

/// Largest WebSocket message either side accepts. Handshake and resync
/// frames carry the whole document, so this bounds document size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

/// WebSocket settings allowing single frames up to `max_message_size`.
pub fn websocket_config(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(max_message_size))
        .max_frame_size(Some(max_message_size))
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Encoded yrs state vector; the receiver answers with what it lacks.
    SyncStep1 = 1,
    /// Encoded yrs update answering a SyncStep1.
    SyncStep2 = 2,
    /// Incremental yrs update.
    Delta = 3,
    /// Presence state (identity and cursor).
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Display identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    /// `#RRGGBB`
    pub color: String,
}

/// Cursor/selection in editor coordinates. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: Position,
    pub head: Position,
}

impl CursorRange {
    pub fn caret(at: Position) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn selection(range: Range) -> Self {
        Self {
            anchor: range.start,
            head: range.end,
        }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

/// Ephemeral per-participant state. Entries without `user` are not shown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: Option<UserIdentity>,
    pub cursor: Option<CursorRange>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, doc_id: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, doc_id, clock, yrs_update)
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, state_diff)
    }

    /// Presence update; `None` withdraws the sender's entry.
    pub fn awareness(
        peer_id: Uuid,
        doc_id: &str,
        clock: u64,
        state: Option<&PresenceState>,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, doc_id, clock, payload))
    }

    pub fn peer_joined(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::PeerJoined, peer_id, doc_id, 0, Vec::new())
    }

    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
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

    /// Parse the presence payload of an `Awareness` message.
    pub fn presence_state(&self) -> Result<Option<PresenceState>, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (state, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(state)
    }

    /// Same message re-tagged as `msg_type`.
    pub fn retagged(mut self, msg_type: MessageType) -> Self {
        self.msg_type = msg_type;
        self
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
