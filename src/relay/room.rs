//! One document on the relay: authoritative text, sequenced history, members
//! and comments.

use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RelayError;
use crate::sync::change::Change;
use crate::sync::comments::Comment;
use crate::sync::conflict::{resolve, Resolution};
use crate::sync::document::TextBuffer;
use crate::sync::protocol::{
    ChangeMessage, CommentDeleted, ConflictMessage, DocumentJoined, DocumentState, RelayEvent,
    UserInfo, UserJoined, UserLeft,
};
use crate::sync::{DocumentId, SessionId};

/// A connected session
struct Member {
    user: UserInfo,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

/// A change as sequenced by the relay
struct Sequenced {
    seq: u64,
    change: Change,
}

/// What happened to a submitted change
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Sequenced; broadcast to every member
    Accepted(ChangeMessage),
    /// Same edit as one already sequenced; nothing to send
    Absorbed,
    /// Overlaps a change the sender had not seen
    Conflict(ConflictMessage),
    /// Could not be applied; the sender gets the reason and a fresh state
    Rejected {
        reason: String,
        state: DocumentState,
    },
}

pub struct DocumentRoom {
    id: DocumentId,
    buffer: TextBuffer,
    seq: u64,
    history: VecDeque<Sequenced>,
    history_limit: usize,
    /// Highest sequence dropped from history
    history_floor: u64,
    members: HashMap<SessionId, Member>,
    comments: HashMap<String, Comment>,
}

impl DocumentRoom {
    pub fn new(id: impl Into<String>, history_limit: usize) -> Self {
        Self {
            id: id.into(),
            buffer: TextBuffer::default(),
            seq: 0,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            history_floor: 0,
            members: HashMap::new(),
            comments: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> DocumentState {
        DocumentState {
            text: self.buffer.text().to_string(),
            version: self.seq,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn user_of(&self, session_id: &str) -> Option<&UserInfo> {
        self.members.get(session_id).map(|m| &m.user)
    }

    /// Add a session and announce it to the others
    pub fn join(
        &mut self,
        session_id: &str,
        user: UserInfo,
        tx: mpsc::UnboundedSender<RelayEvent>,
        request_state: bool,
    ) -> DocumentJoined {
        self.broadcast_except(
            session_id,
            RelayEvent::UserJoined(UserJoined { user: user.clone() }),
        );
        info!(document = %self.id, user = %user.id, session = %session_id, "Session joined");
        self.members
            .insert(session_id.to_string(), Member { user, tx });

        let mut collaborators: Vec<UserInfo> =
            self.members.values().map(|m| m.user.clone()).collect();
        collaborators.sort_by(|a, b| a.id.cmp(&b.id));
        collaborators.dedup_by(|a, b| a.id == b.id);

        DocumentJoined {
            session_id: session_id.to_string(),
            collaborators,
            document_state: request_state.then(|| self.state()),
        }
    }

    /// Remove a session; `user:left` goes out once the user's last session is gone
    pub fn leave(&mut self, session_id: &str) -> Option<UserInfo> {
        let member = self.members.remove(session_id)?;
        info!(document = %self.id, user = %member.user.id, "Session left");

        let still_present = self.members.values().any(|m| m.user.id == member.user.id);
        if !still_present {
            self.broadcast(RelayEvent::UserLeft(UserLeft {
                user_id: member.user.id.clone(),
            }));
        }
        Some(member.user)
    }

    /// Sequence a client change.
    ///
    /// The change is transformed past every change from other origins that the
    /// sender had not observed (`seq` above the sender's).
    pub fn submit(&mut self, message: &ChangeMessage) -> Submission {
        let mut change = match message.to_change() {
            Ok(change) => change,
            Err(e) => return self.reject(e.to_string()),
        };
        if change.is_noop() {
            return self.reject("change neither removes nor inserts text".to_string());
        }
        if message.seq < self.history_floor {
            return self.reject(format!(
                "change is based on sequence {} which is no longer in history",
                message.seq
            ));
        }

        let origin = change.origin().to_string();
        for entry in self
            .history
            .iter()
            .filter(|e| e.seq > message.seq && e.change.origin() != origin)
        {
            match resolve(&change, &entry.change) {
                Resolution::AcceptRemote => {
                    debug!(change = %change.id(), "Absorbed identical change");
                    return Submission::Absorbed;
                }
                Resolution::Merge(plan) => {
                    if let Some(rebased) = plan.member(change.id()) {
                        change = rebased.clone();
                    }
                }
                Resolution::UserChoice => {
                    info!(
                        document = %self.id,
                        local = %change.id(),
                        remote = %entry.change.id(),
                        "Overlapping change refused"
                    );
                    return Submission::Conflict(ConflictMessage {
                        local_change: message.clone(),
                        remote_change: ChangeMessage::from_change(
                            self.id.as_str(),
                            &entry.change,
                            entry.seq,
                        ),
                    });
                }
            }
        }

        if let Err(e) = self.buffer.apply_change(&change) {
            warn!(document = %self.id, change = %change.id(), "Change did not apply: {}", e);
            return self.reject(e.to_string());
        }

        self.seq += 1;
        let accepted = ChangeMessage::from_change(self.id.as_str(), &change, self.seq);
        self.history.push_back(Sequenced {
            seq: self.seq,
            change,
        });
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.history_floor = dropped.seq;
            }
        }

        Submission::Accepted(accepted)
    }

    pub fn comments(&self) -> Vec<Comment> {
        let mut all: Vec<_> = self.comments.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn add_comment(&mut self, comment: Comment) -> Result<Comment, RelayError> {
        self.check_document(&comment.document_id)?;
        if comment.text.trim().is_empty() {
            return Err(RelayError::InvalidRequest("comment text is empty".to_string()));
        }
        if self.comments.contains_key(&comment.id) {
            return Err(RelayError::InvalidRequest(format!(
                "comment {} already exists",
                comment.id
            )));
        }
        self.comments.insert(comment.id.clone(), comment.clone());
        Ok(comment)
    }

    /// Only the text changes; author, anchor and creation time stay
    pub fn update_comment(&mut self, comment: Comment) -> Result<Comment, RelayError> {
        self.check_document(&comment.document_id)?;
        let stored = self
            .comments
            .get_mut(&comment.id)
            .ok_or_else(|| RelayError::InvalidRequest(format!("comment {} not found", comment.id)))?;
        stored.text = comment.text;
        Ok(stored.clone())
    }

    pub fn delete_comment(&mut self, request: &CommentDeleted) -> Result<(), RelayError> {
        self.check_document(&request.document_id)?;
        self.comments
            .remove(&request.comment_id)
            .map(|_| ())
            .ok_or_else(|| {
                RelayError::InvalidRequest(format!("comment {} not found", request.comment_id))
            })
    }

    /// Send to every member, including the originator
    pub fn broadcast(&self, event: RelayEvent) {
        for member in self.members.values() {
            let _ = member.tx.send(event.clone());
        }
    }

    pub fn broadcast_except(&self, session_id: &str, event: RelayEvent) {
        for (id, member) in &self.members {
            if id != session_id {
                let _ = member.tx.send(event.clone());
            }
        }
    }

    pub fn check_document(&self, document_id: &str) -> Result<(), RelayError> {
        if document_id != self.id {
            return Err(RelayError::InvalidRequest(format!(
                "session is joined to {}, not {}",
                self.id, document_id
            )));
        }
        Ok(())
    }

    fn reject(&self, reason: String) -> Submission {
        Submission::Rejected {
            reason,
            state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::change::{Edit, Position, Range};
    use crate::sync::comments::AuthorSnapshot;
    use tokio_test::{assert_err, assert_ok};

    fn user(id: &str) -> UserInfo {
        UserInfo {
            id: id.to_string(),
            name: id.to_uppercase(),
            avatar: None,
        }
    }

    fn message(edit: Edit, origin: &str, seq: u64) -> ChangeMessage {
        let change = Change::new(edit, origin, seq);
        ChangeMessage::from_change("doc", &change, seq)
    }

    fn seeded(text: &str) -> DocumentRoom {
        let mut room = DocumentRoom::new("doc", 16);
        let seed = message(Edit::insert(Position::new(0, 0), text), "seed", 0);
        assert!(matches!(room.submit(&seed), Submission::Accepted(_)));
        room
    }

    #[test]
    fn test_join_and_leave() {
        let mut room = DocumentRoom::new("doc", 16);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();

        let joined = room.join("s1", user("alice"), a_tx, true);
        assert_eq!(joined.collaborators.len(), 1);
        assert_eq!(joined.document_state.unwrap().version, 0);

        let joined = room.join("s2", user("bob"), b_tx, false);
        assert_eq!(joined.collaborators.len(), 2);
        assert!(joined.document_state.is_none());
        assert!(matches!(a_rx.try_recv(), Ok(RelayEvent::UserJoined(_))));

        assert_eq!(room.leave("s2").unwrap().id, "bob");
        assert!(matches!(a_rx.try_recv(), Ok(RelayEvent::UserLeft(left)) if left.user_id == "bob"));
        assert!(room.leave("s2").is_none());
    }

    #[test]
    fn test_sequencing() {
        let mut room = seeded("Hello");
        let accepted = room.submit(&message(
            Edit::insert(Position::new(0, 5), " World"),
            "alice",
            1,
        ));

        match accepted {
            Submission::Accepted(message) => assert_eq!(message.seq, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(room.state().text, "Hello World");
        assert_eq!(room.state().version, 2);
    }

    #[test]
    fn test_late_change_is_transformed() {
        let mut room = seeded("Hello World");
        room.submit(&message(Edit::delete(Range::between((0, 6), (0, 11))), "bob", 1));

        // alice typed "!" at the end without having seen bob's delete
        let late = room.submit(&message(Edit::insert(Position::new(0, 11), "!"), "alice", 1));
        match late {
            Submission::Accepted(message) => {
                assert_eq!(message.change.from, Position::new(0, 6));
                assert_eq!(message.seq, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(room.state().text, "Hello !");
    }

    #[test]
    fn test_overlapping_late_change_conflicts() {
        let mut room = seeded("Hello World");
        room.submit(&message(
            Edit::replace(Range::between((0, 0), (0, 11)), "Greetings"),
            "bob",
            1,
        ));

        let late = room.submit(&message(
            Edit::replace(Range::between((0, 0), (0, 5)), "Hi"),
            "alice",
            1,
        ));
        match late {
            Submission::Conflict(conflict) => {
                assert_eq!(conflict.local_change.user_id, "alice");
                assert_eq!(conflict.remote_change.user_id, "bob");
                assert_eq!(conflict.remote_change.seq, 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(room.state().text, "Greetings");
    }

    #[test]
    fn test_identical_change_absorbed() {
        let mut room = seeded("abc");
        room.submit(&message(Edit::insert(Position::new(0, 3), "d"), "bob", 1));
        let same = room.submit(&message(Edit::insert(Position::new(0, 3), "d"), "alice", 1));

        assert_eq!(same, Submission::Absorbed);
        assert_eq!(room.state().text, "abcd");
        assert_eq!(room.state().version, 2);
    }

    #[test]
    fn test_own_history_not_transformed() {
        let mut room = seeded("ab");
        room.submit(&message(Edit::insert(Position::new(0, 2), "c"), "alice", 1));
        // computed on top of alice's own previous change
        let next = room.submit(&message(Edit::insert(Position::new(0, 3), "d"), "alice", 1));

        assert!(matches!(next, Submission::Accepted(_)));
        assert_eq!(room.state().text, "abcd");
    }

    #[test]
    fn test_out_of_bounds_rejected_with_state() {
        let mut room = seeded("abc");
        let result = room.submit(&message(Edit::insert(Position::new(4, 0), "x"), "alice", 1));

        match result {
            Submission::Rejected { state, .. } => {
                assert_eq!(state.text, "abc");
                assert_eq!(state.version, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_trimmed_history_rejects_stale_change() {
        let mut room = DocumentRoom::new("doc", 2);
        for i in 0..4u64 {
            room.submit(&message(Edit::insert(Position::new(0, 0), "x"), "bob", i));
        }

        let stale = room.submit(&message(Edit::insert(Position::new(0, 0), "y"), "alice", 0));
        assert!(matches!(stale, Submission::Rejected { .. }));
    }

    #[test]
    fn test_comments() {
        let mut room = DocumentRoom::new("doc", 4);
        let comment = Comment {
            id: "c1".to_string(),
            document_id: "doc".to_string(),
            author: AuthorSnapshot {
                id: "alice".to_string(),
                name: "Alice".to_string(),
            },
            position: Position::new(0, 0),
            text: "first".to_string(),
            created_at: 1,
        };

        assert_ok!(room.add_comment(comment.clone()));
        assert_err!(room.add_comment(comment.clone()));

        let mut edited = comment.clone();
        edited.text = "second".to_string();
        edited.created_at = 99;
        let stored = room.update_comment(edited).unwrap();
        assert_eq!(stored.text, "second");
        assert_eq!(stored.created_at, 1);

        let mut elsewhere = comment.clone();
        elsewhere.id = "c2".to_string();
        elsewhere.document_id = "other".to_string();
        assert_err!(room.add_comment(elsewhere));

        assert_ok!(room.delete_comment(&CommentDeleted {
            document_id: "doc".to_string(),
            comment_id: "c1".to_string(),
        }));
        assert!(room.comments().is_empty());
    }
}
