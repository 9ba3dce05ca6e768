//! Synchronization core for real-time collaborative editing.
//!
//! This module implements the client side of document collaboration:
//! - Change model and document version tracking
//! - Conflict resolution with simplified offset adjustment
//! - Presence and cursor tracking
//! - Connection lifecycle over a JSON WebSocket protocol
//! - The coordinator routing local and remote events
//! - Comment synchronization

pub mod change;
pub mod comments;
pub mod conflict;
pub mod connection;
pub mod coordinator;
pub mod document;
pub mod editor;
pub mod presence;
pub mod protocol;

pub use change::{Change, ChangeKind, Edit, Position, Range};
pub use conflict::{resolve, Resolution};
pub use connection::{ConnectionManager, ConnectionState};
pub use coordinator::Coordinator;
pub use document::{ApplyError, Document, TextBuffer};

use std::time::Duration;

/// Unique identifier for a document
pub type DocumentId = String;

/// Unique identifier for a collaborator (stable per client)
pub type CollaboratorId = String;

/// Identifier the relay assigns to one connected session
pub type SessionId = String;

/// Result type for collaboration operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors surfaced by the collaboration core
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    /// Transport or handshake failure
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A change did not map onto the local document
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Action attempted while not connected
    #[error("Offline: {0}")]
    Offline(String),

    /// Malformed or unexpected message
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Invalid comment: {0}")]
    InvalidComment(String),

    #[error("Presence error: {0}")]
    Presence(#[from] presence::PresenceError),

    #[error("No conflict is awaiting a decision")]
    NoPendingConflict,

    #[error("Comment not found: {0}")]
    CommentNotFound(String),
}

/// Connection failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("No acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Relay rejected the session: {0}")]
    Rejected(String),

    #[error("Connection manager was closed")]
    Closed,
}

impl CollabError {
    /// Whether the error can be recovered by resync or reconnect
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollabError::Connection(_) | CollabError::Apply(_) | CollabError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collab_error_display() {
        let err = CollabError::Offline("cannot add comment".to_string());
        assert_eq!(err.to_string(), "Offline: cannot add comment");

        let err = CollabError::from(ConnectionError::Timeout(Duration::from_secs(10)));
        assert_eq!(err.to_string(), "Connection error: No acknowledgment within 10s");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(CollabError::from(ConnectionError::Closed).is_recoverable());
        assert!(!CollabError::Offline("x".to_string()).is_recoverable());
        assert!(!CollabError::NoPendingConflict.is_recoverable());
    }
}
