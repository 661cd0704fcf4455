//! Wire protocol for client connections and the fanout backplane.
//!
//! Client frames are JSON text, adjacently tagged:
//! ```text
//! {"event": "joinRoom", "data": "general"}
//! {"event": "message",  "data": {"room": "general", "username": "bob", "text": "hi"}}
//! {"event": "typing",   "data": {"room": "general", "isTyping": true}}
//! ```
//!
//! Backplane frames are bincode-encoded [`BridgeFrame`]s:
//! ```text
//! ┌───────────┬──────────┬────────────────┬──────────┐
//! │ origin    │ room     │ exclude (opt)  │ event    │
//! │ 16 bytes  │ variable │ 1 + 16 bytes   │ variable │
//! └───────────┴──────────┴────────────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

/// Identifies one live client connection.
pub type SessionId = Uuid;

/// Author name for messages sent without a username.
pub const DEFAULT_AUTHOR: &str = "Anonymous";
/// Name announced in `userJoined` when the session never supplied one.
pub const DEFAULT_JOIN_NAME: &str = "User";
/// Name attached to typing signals from unnamed sessions.
pub const DEFAULT_TYPING_NAME: &str = "Someone";

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch, never decreasing within this process.
pub fn now_millis() -> u64 {
    let wall = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let prev = LAST_TIMESTAMP.fetch_max(wall, Ordering::SeqCst);
    prev.max(wall)
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room: String,
    pub username: String,
    pub text: String,
    /// Milliseconds since epoch, assigned by the receiving process
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(room: impl Into<String>, username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.into(),
            username: username.into(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }

    /// JSON form stored in the history log.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Payload of `joinRoom`: a bare room name or a room plus display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinRequest {
    Room(String),
    Detailed {
        room: String,
        #[serde(default)]
        username: Option<String>,
    },
}

impl JoinRequest {
    pub fn room(&self) -> &str {
        match self {
            JoinRequest::Room(room) => room,
            JoinRequest::Detailed { room, .. } => room,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            JoinRequest::Room(_) => None,
            JoinRequest::Detailed { username, .. } => username.as_deref(),
        }
    }
}

/// Payload of an inbound `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// Payload of an inbound `typing` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub username: Option<String>,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom(JoinRequest),
    Message(OutgoingMessage),
    Typing(TypingUpdate),
    LeaveRoom(String),
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Some clients send JSON in binary frames.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// `userJoined` / `userLeft` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNotice {
    pub id: SessionId,
    pub username: String,
}

/// Outbound typing payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub username: String,
    pub is_typing: bool,
}

/// Outbound `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

/// Events sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    History(Vec<ChatMessage>),
    Message(ChatMessage),
    UserJoined(PeerNotice),
    UserLeft(PeerNotice),
    Typing(TypingNotice),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Room-scoped events carried over the backplane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomEvent {
    Message(ChatMessage),
    UserJoined(PeerNotice),
    UserLeft(PeerNotice),
    Typing(TypingNotice),
}

impl From<RoomEvent> for ServerEvent {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::Message(msg) => ServerEvent::Message(msg),
            RoomEvent::UserJoined(notice) => ServerEvent::UserJoined(notice),
            RoomEvent::UserLeft(notice) => ServerEvent::UserLeft(notice),
            RoomEvent::Typing(notice) => ServerEvent::Typing(notice),
        }
    }
}

/// Backplane frame: one room event tagged with its room and origin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeFrame {
    /// Instance that published the frame
    pub origin: Uuid,
    pub room: String,
    /// Session that must not receive the event (typing signals)
    pub exclude: Option<SessionId>,
    pub event: RoomEvent,
}

impl BridgeFrame {
    pub fn new(origin: Uuid, room: impl Into<String>, event: RoomEvent) -> Self {
        Self {
            origin,
            room: room.into(),
            exclude: None,
            event,
        }
    }

    pub fn excluding(mut self, session: SessionId) -> Self {
        self.exclude = Some(session);
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
}
