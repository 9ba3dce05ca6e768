//! JSON WebSocket protocol between clients and the relay.
//!
//! Every frame is one JSON object tagged by its `"event"` field
//! (`"document:change"`, `"user:cursor"`, ...) with camelCase payload fields.
//! Text frames only; binary frames are not part of the protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::change::{Change, ChangeKind, Edit, Position, Range};
use super::comments::Comment;
use super::{CollaboratorId, DocumentId, SessionId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unexpected event: {0}")]
    UnexpectedEvent(String),
}

/// A change as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChange {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub from: Position,
    pub to: Position,
    #[serde(default)]
    pub text: String,
    pub timestamp: i64,
}

/// `document:change` in both directions.
///
/// `version` is the document version the change was computed against.
/// `seq` is the last relay sequence the sender observed on the way in and the
/// sequence the relay assigned on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    pub document_id: DocumentId,
    pub user_id: CollaboratorId,
    pub change: WireChange,
    pub version: u64,
    #[serde(default)]
    pub seq: u64,
}

impl ChangeMessage {
    pub fn from_change(document_id: impl Into<String>, change: &Change, seq: u64) -> Self {
        let range = change.range();
        Self {
            document_id: document_id.into(),
            user_id: change.origin().to_string(),
            change: WireChange {
                id: change.id(),
                kind: change.kind(),
                from: range.from,
                to: range.to,
                text: change.text().to_string(),
                timestamp: change.timestamp(),
            },
            version: change.base_version(),
            seq,
        }
    }

    /// Rebuild the typed change, rejecting kind/range/text combinations that make no sense
    pub fn to_change(&self) -> Result<Change, ProtocolError> {
        let wire = &self.change;
        let edit = Edit::from_parts(wire.kind, Range::new(wire.from, wire.to), wire.text.clone())
            .map_err(ProtocolError::InvalidFormat)?;
        Ok(Change::from_parts(
            wire.id,
            edit,
            self.user_id.clone(),
            wire.timestamp,
            self.version,
        ))
    }
}

/// First frame of every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHello {
    pub protocol_version: u8,
    pub user_id: CollaboratorId,
    pub user_name: String,
    pub document_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Ask for the full text in `document:joined`
    #[serde(default)]
    pub request_state: bool,
}

/// Authoritative text and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub text: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: CollaboratorId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentJoined {
    pub session_id: SessionId,
    pub collaborators: Vec<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_state: Option<DocumentState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMessage {
    pub document_state: DocumentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub document_id: DocumentId,
    pub version: u64,
}

/// The relay refused a change because it overlaps one it sequenced earlier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMessage {
    pub local_change: ChangeMessage,
    pub remote_change: ChangeMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: CollaboratorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMessage {
    pub user_id: CollaboratorId,
    pub document_id: DocumentId,
    pub cursor: Position,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionMessage {
    pub user_id: CollaboratorId,
    pub document_id: DocumentId,
    pub selection: Range,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentMessage {
    pub comment: Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDeleted {
    pub document_id: DocumentId,
    pub comment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
}

/// Frames sent from client to relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "session:hello")]
    SessionHello(SessionHello),

    #[serde(rename = "document:change")]
    DocumentChange(ChangeMessage),

    #[serde(rename = "document:sync")]
    DocumentSync(SyncRequest),

    #[serde(rename = "user:cursor")]
    UserCursor(CursorMessage),

    #[serde(rename = "user:selection")]
    UserSelection(SelectionMessage),

    #[serde(rename = "comment:add")]
    CommentAdd(CommentMessage),

    #[serde(rename = "comment:updated")]
    CommentUpdated(CommentMessage),

    #[serde(rename = "comment:deleted")]
    CommentDeleted(CommentDeleted),

    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionHello(_) => "session:hello",
            ClientEvent::DocumentChange(_) => "document:change",
            ClientEvent::DocumentSync(_) => "document:sync",
            ClientEvent::UserCursor(_) => "user:cursor",
            ClientEvent::UserSelection(_) => "user:selection",
            ClientEvent::CommentAdd(_) => "comment:add",
            ClientEvent::CommentUpdated(_) => "comment:updated",
            ClientEvent::CommentDeleted(_) => "comment:deleted",
            ClientEvent::Ping => "ping",
        }
    }
}

/// Frames sent from relay to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RelayEvent {
    #[serde(rename = "document:joined")]
    DocumentJoined(DocumentJoined),

    #[serde(rename = "document:state")]
    DocumentState(StateMessage),

    #[serde(rename = "document:change")]
    DocumentChange(ChangeMessage),

    #[serde(rename = "document:conflict")]
    DocumentConflict(ConflictMessage),

    #[serde(rename = "user:joined")]
    UserJoined(UserJoined),

    #[serde(rename = "user:left")]
    UserLeft(UserLeft),

    #[serde(rename = "user:cursor")]
    UserCursor(CursorMessage),

    #[serde(rename = "user:selection")]
    UserSelection(SelectionMessage),

    #[serde(rename = "comment:added")]
    CommentAdded(CommentMessage),

    #[serde(rename = "comment:updated")]
    CommentUpdated(CommentMessage),

    #[serde(rename = "comment:deleted")]
    CommentDeleted(CommentDeleted),

    #[serde(rename = "error")]
    Error(ErrorMessage),
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::DocumentJoined(_) => "document:joined",
            RelayEvent::DocumentState(_) => "document:state",
            RelayEvent::DocumentChange(_) => "document:change",
            RelayEvent::DocumentConflict(_) => "document:conflict",
            RelayEvent::UserJoined(_) => "user:joined",
            RelayEvent::UserLeft(_) => "user:left",
            RelayEvent::UserCursor(_) => "user:cursor",
            RelayEvent::UserSelection(_) => "user:selection",
            RelayEvent::CommentAdded(_) => "comment:added",
            RelayEvent::CommentUpdated(_) => "comment:updated",
            RelayEvent::CommentDeleted(_) => "comment:deleted",
            RelayEvent::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayEvent::Error(ErrorMessage {
            message: message.into(),
        })
    }
}

/// Protocol codec for encoding/decoding frames
pub struct WireCodec;

impl WireCodec {
    pub fn encode_client(event: &ClientEvent) -> Result<String, ProtocolError> {
        encode(event)
    }

    pub fn encode_relay(event: &RelayEvent) -> Result<String, ProtocolError> {
        encode(event)
    }

    pub fn decode_client(frame: &str) -> Result<ClientEvent, ProtocolError> {
        decode(frame)
    }

    pub fn decode_relay(frame: &str) -> Result<RelayEvent, ProtocolError> {
        decode(frame)
    }

    /// Check the version announced in a hello
    pub fn check_version(hello: &SessionHello) -> Result<(), ProtocolError> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(
                PROTOCOL_VERSION,
                hello.protocol_version,
            ));
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let frame =
        serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(frame.len(), MAX_MESSAGE_SIZE));
    }
    Ok(frame)
}

fn decode<T: for<'de> Deserialize<'de>>(frame: &str) -> Result<T, ProtocolError> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(frame.len(), MAX_MESSAGE_SIZE));
    }
    serde_json::from_str(frame).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
}
