//! Inline comment synchronization.
//!
//! Comments are never inserted optimistically: `add_comment` only sends the
//! request, and the comment appears once the relay echoes `comment:added`
//! back. Updates and deletes follow the same rule.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::change::Position;
use super::connection::EventSink;
use super::protocol::{ClientEvent, CommentDeleted, CommentMessage};
use super::{CollabError, CollabResult, CollaboratorId, DocumentId};

/// Author as captured when the comment was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorSnapshot {
    pub id: CollaboratorId,
    pub name: String,
}

/// Comment anchored at a document position.
///
/// The anchor is not adjusted when the text around it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub document_id: DocumentId,
    pub author: AuthorSnapshot,
    pub position: Position,
    pub text: String,
    /// Creation time (milliseconds since epoch)
    pub created_at: i64,
}

/// Comment events forwarded to the UI unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentNotice {
    Added(Comment),
    Updated(Comment),
    Deleted { comment_id: String },
}

/// Comment list for one document, materialized from relay echoes
#[derive(Debug)]
pub struct CommentSync {
    document_id: DocumentId,
    author: AuthorSnapshot,
    comments: HashMap<String, Comment>,
}

impl CommentSync {
    pub fn new(document_id: impl Into<String>, author: AuthorSnapshot) -> Self {
        Self {
            document_id: document_id.into(),
            author,
            comments: HashMap::new(),
        }
    }

    /// Request a new comment; returns its id.
    ///
    /// Fails with `Offline` when not connected and rejects blank text.
    pub fn add_comment(
        &self,
        sink: &dyn EventSink,
        text: &str,
        position: Position,
    ) -> CollabResult<String> {
        if !sink.is_connected() {
            return Err(CollabError::Offline("cannot add comment".to_string()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CollabError::InvalidComment("comment text is empty".to_string()));
        }

        let comment = Comment {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: self.document_id.clone(),
            author: self.author.clone(),
            position,
            text: text.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let id = comment.id.clone();

        sink.send(ClientEvent::CommentAdd(CommentMessage { comment }))?;
        debug!(comment = %id, "comment requested");
        Ok(id)
    }

    /// Request a text change on an existing comment
    pub fn update_comment(&self, sink: &dyn EventSink, id: &str, text: &str) -> CollabResult<()> {
        if !sink.is_connected() {
            return Err(CollabError::Offline("cannot update comment".to_string()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CollabError::InvalidComment("comment text is empty".to_string()));
        }
        let mut comment = self
            .comments
            .get(id)
            .cloned()
            .ok_or_else(|| CollabError::CommentNotFound(id.to_string()))?;
        comment.text = text.to_string();

        sink.send(ClientEvent::CommentUpdated(CommentMessage { comment }))
    }

    /// Request removal of a comment
    pub fn delete_comment(&self, sink: &dyn EventSink, id: &str) -> CollabResult<()> {
        if !sink.is_connected() {
            return Err(CollabError::Offline("cannot delete comment".to_string()));
        }
        if !self.comments.contains_key(id) {
            return Err(CollabError::CommentNotFound(id.to_string()));
        }

        sink.send(ClientEvent::CommentDeleted(CommentDeleted {
            document_id: self.document_id.clone(),
            comment_id: id.to_string(),
        }))
    }

    pub fn on_added(&mut self, comment: Comment) -> Option<CommentNotice> {
        if !self.is_ours(&comment) {
            return None;
        }
        info!(comment = %comment.id, author = %comment.author.id, "comment added");
        self.comments.insert(comment.id.clone(), comment.clone());
        Some(CommentNotice::Added(comment))
    }

    /// Last write wins
    pub fn on_updated(&mut self, comment: Comment) -> Option<CommentNotice> {
        if !self.is_ours(&comment) {
            return None;
        }
        self.comments.insert(comment.id.clone(), comment.clone());
        Some(CommentNotice::Updated(comment))
    }

    pub fn on_deleted(&mut self, message: CommentDeleted) -> Option<CommentNotice> {
        if message.document_id != self.document_id {
            return None;
        }
        self.comments.remove(&message.comment_id);
        Some(CommentNotice::Deleted {
            comment_id: message.comment_id,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Comment> {
        self.comments.get(id)
    }

    /// Snapshot ordered by creation time
    pub fn comments(&self) -> Vec<Comment> {
        let mut all: Vec<_> = self.comments.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    fn is_ours(&self, comment: &Comment) -> bool {
        if comment.document_id != self.document_id {
            debug!(comment = %comment.id, document = %comment.document_id, "comment for another document ignored");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        connected: bool,
        sent: Mutex<Vec<ClientEvent>>,
    }

    impl EventSink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn send(&self, event: ClientEvent) -> CollabResult<()> {
            if !self.connected {
                return Err(CollabError::Offline("not connected".to_string()));
            }
            self.sent.lock().push(event);
            Ok(())
        }
    }

    fn online() -> RecordingSink {
        RecordingSink {
            connected: true,
            ..Default::default()
        }
    }

    fn sync() -> CommentSync {
        CommentSync::new(
            "doc-1",
            AuthorSnapshot {
                id: "u1".to_string(),
                name: "Alice".to_string(),
            },
        )
    }

    fn sent_comment(sink: &RecordingSink) -> Comment {
        match sink.sent.lock().last() {
            Some(ClientEvent::CommentAdd(message)) => message.comment.clone(),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_add_comment_offline() {
        let sink = RecordingSink::default();
        let result = sync().add_comment(&sink, "hello", Position::new(0, 0));
        assert!(matches!(result, Err(CollabError::Offline(_))));
        assert!(sink.sent.lock().is_empty());
    }

    #[test]
    fn test_blank_comment_rejected() {
        let sink = online();
        let result = sync().add_comment(&sink, "   ", Position::new(0, 0));
        assert!(matches!(result, Err(CollabError::InvalidComment(_))));
    }

    #[test]
    fn test_comment_materializes_on_echo_only() {
        let sink = online();
        let mut comments = sync();

        let id = comments.add_comment(&sink, " typo ", Position::new(3, 1)).unwrap();
        assert!(comments.comments().is_empty());

        let comment = sent_comment(&sink);
        assert_eq!(comment.id, id);
        assert_eq!(comment.text, "typo");
        assert_eq!(comment.author.name, "Alice");

        let notice = comments.on_added(comment.clone());
        assert_eq!(notice, Some(CommentNotice::Added(comment)));
        assert_eq!(comments.comments().len(), 1);
    }

    #[test]
    fn test_update_and_delete() {
        let sink = online();
        let mut comments = sync();

        assert!(matches!(
            comments.update_comment(&sink, "missing", "x"),
            Err(CollabError::CommentNotFound(_))
        ));

        comments.add_comment(&sink, "first", Position::new(0, 0)).unwrap();
        let comment = sent_comment(&sink);
        comments.on_added(comment.clone());

        comments.update_comment(&sink, &comment.id, "second").unwrap();
        // not applied until echoed
        assert_eq!(comments.get(&comment.id).unwrap().text, "first");

        let mut edited = comment.clone();
        edited.text = "second".to_string();
        comments.on_updated(edited);
        assert_eq!(comments.get(&comment.id).unwrap().text, "second");

        comments.delete_comment(&sink, &comment.id).unwrap();
        comments.on_deleted(CommentDeleted {
            document_id: "doc-1".to_string(),
            comment_id: comment.id.clone(),
        });
        assert!(comments.comments().is_empty());
    }

    #[test]
    fn test_other_document_ignored() {
        let mut comments = sync();
        let comment = Comment {
            id: "c".to_string(),
            document_id: "doc-2".to_string(),
            author: AuthorSnapshot {
                id: "u2".to_string(),
                name: "Bob".to_string(),
            },
            position: Position::new(0, 0),
            text: "elsewhere".to_string(),
            created_at: 0,
        };
        assert!(comments.on_added(comment).is_none());
        assert!(comments.comments().is_empty());
    }
}
