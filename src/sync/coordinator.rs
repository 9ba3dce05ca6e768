//! Collaboration coordinator.
//!
//! Owns the document state for one client and routes everything through a
//! single dispatch loop:
//! - edits reported by the editor surface
//! - events from the connection manager
//! - commands from the UI via [`CoordinatorHandle`]
//!
//! Local edits are applied by the editor first and sent afterwards; they stay
//! pending until the relay echoes them back. Remote changes arriving while
//! edits are pending go through the conflict resolver.

use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::change::{Change, Edit, Position};
use super::comments::{AuthorSnapshot, Comment, CommentNotice, CommentSync};
use super::conflict::{Conflict, Resolution};
use super::connection::{ConnectionEvent, ConnectionManager, ConnectionState, EventSink};
use super::document::{Document, TextBuffer};
use super::editor::{ApplyGuard, EditReporter, EditorSurface};
use super::presence::{Collaborator, CursorPosition, CursorState, PresenceTracker};
use super::protocol::{
    ChangeMessage, ClientEvent, ConflictMessage, CursorMessage, DocumentJoined, DocumentState,
    RelayEvent, SelectionMessage, SyncRequest,
};
use super::{CollabError, CollabResult, CollaboratorId, ConnectionError};
use crate::config::CollabConfig;

/// Own change ids remembered across snapshots; older ones are forgotten
const REPLAY_LIMIT: usize = 256;

/// How the user settled an overlapping edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep this client's text and push it to everyone
    AcceptLocal,
    /// Take the relay's text
    AcceptRemote,
    /// Use text the user merged by hand
    ManualMerge(String),
}

/// Things the UI may want to show
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected { reconnected: bool },
    Disconnected,
    /// The reconnect attempt failed; edits stay local
    Offline(ConnectionError),
    CollaboratorJoined(Collaborator),
    CollaboratorLeft(CollaboratorId),
    CursorMoved(CursorState),
    /// Overlapping edits need a [`Decision`]
    ConflictPending { local: Change, remote: Change },
    Resynced { version: u64 },
    /// Edits made while offline were replaced by the relay's text
    LocalEditsDiscarded { count: usize },
    Comment(CommentNotice),
    RelayError(String),
}

enum Command {
    MoveCursor(CursorPosition),
    AddComment {
        text: String,
        position: Position,
        reply: oneshot::Sender<CollabResult<String>>,
    },
    UpdateComment {
        id: String,
        text: String,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    DeleteComment {
        id: String,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    ResolveConflict {
        decision: Decision,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    Resync,
    Shutdown,
}

/// Cloneable handle for driving a running coordinator from the UI
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    fn submit(&self, command: Command) -> CollabResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::from(ConnectionError::Closed))
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<CollabResult<T>>) -> Command,
    ) -> CollabResult<T> {
        let (reply, rx) = oneshot::channel();
        self.submit(build(reply))?;
        rx.await
            .map_err(|_| CollabError::from(ConnectionError::Closed))?
    }

    pub fn move_cursor(&self, position: CursorPosition) -> CollabResult<()> {
        self.submit(Command::MoveCursor(position))
    }

    pub async fn add_comment(
        &self,
        text: impl Into<String>,
        position: Position,
    ) -> CollabResult<String> {
        let text = text.into();
        self.ask(|reply| Command::AddComment {
            text,
            position,
            reply,
        })
        .await
    }

    pub async fn update_comment(&self, id: impl Into<String>, text: impl Into<String>) -> CollabResult<()> {
        let (id, text) = (id.into(), text.into());
        self.ask(|reply| Command::UpdateComment { id, text, reply })
            .await
    }

    pub async fn delete_comment(&self, id: impl Into<String>) -> CollabResult<()> {
        let id = id.into();
        self.ask(|reply| Command::DeleteComment { id, reply }).await
    }

    pub async fn resolve_conflict(&self, decision: Decision) -> CollabResult<()> {
        self.ask(|reply| Command::ResolveConflict { decision, reply })
            .await
    }

    pub fn request_resync(&self) -> CollabResult<()> {
        self.submit(Command::Resync)
    }

    /// Disconnect and end the dispatch loop
    pub fn shutdown(&self) {
        let _ = self.submit(Command::Shutdown);
    }
}

/// Client-side collaboration state for one document
pub struct Coordinator<S: EditorSurface> {
    user_id: CollaboratorId,
    user_name: String,
    surface: S,
    connection: ConnectionManager,
    presence: PresenceTracker,
    comments: CommentSync,
    document: Document,
    guard: ApplyGuard,
    edits: mpsc::UnboundedReceiver<Edit>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: CoordinatorHandle,
    /// Sent but not yet echoed, in send order
    pending: VecDeque<Change>,
    /// Own changes overwritten by a snapshot before their echo arrived
    replay: VecDeque<Uuid>,
    /// Local edits made while offline since the last snapshot
    unsent: usize,
    held: Option<Conflict>,
    sync_in_flight: bool,
    /// Text to push as a whole-document replace once the next snapshot lands
    reassert: Option<String>,
    /// Highest relay sequence observed
    last_seq: u64,
    notices: Vec<Notice>,
}

impl<S: EditorSurface> Coordinator<S> {
    pub fn new(config: &CollabConfig, mut surface: S, connection: ConnectionManager) -> Self {
        let guard = ApplyGuard::new();
        let (reporter, edits) = EditReporter::new(guard.clone());
        surface.attach_reporter(reporter);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let author = AuthorSnapshot {
            id: config.user_id.clone(),
            name: config.user_name.clone(),
        };

        Self {
            user_id: config.user_id.clone(),
            user_name: config.user_name.clone(),
            surface,
            connection,
            presence: PresenceTracker::new(config.active_window),
            comments: CommentSync::new(config.document_id.clone(), author),
            document: Document::new(config.document_id.clone()),
            guard,
            edits,
            commands,
            handle: CoordinatorHandle {
                commands: commands_tx,
            },
            pending: VecDeque::new(),
            replay: VecDeque::new(),
            unsent: 0,
            held: None,
            sync_in_flight: false,
            reassert: None,
            last_seq: 0,
            notices: Vec::new(),
        }
    }

    /// Connect and load the initial document state
    pub async fn start(&mut self) -> CollabResult<()> {
        let joined = self
            .connection
            .connect(&self.user_id, &self.user_name, self.document.id())
            .await?;
        self.on_joined(joined, false);
        Ok(())
    }

    /// Dispatch until shut down
    pub async fn run(&mut self) {
        while self.step().await {}
        info!(document = %self.document.id(), "Coordinator stopped");
    }

    /// Process one input. Returns false once the coordinator is shut down.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            // edits already applied by the surface go first, so remote
            // changes are always transformed against them
            biased;

            Some(edit) = self.edits.recv() => {
                if let Err(e) = self.on_local_edit(edit) {
                    warn!("Local edit rejected: {}", e);
                }
            }

            event = self.connection.next_event() => match event {
                Some(event) => self.on_connection_event(event),
                None => return false,
            },

            command = self.commands.recv() => match command {
                Some(Command::Shutdown) | None => {
                    self.connection.disconnect();
                    return false;
                }
                Some(command) => self.on_command(command),
            },
        }
        true
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// A user edit already applied by the editor.
    ///
    /// Ignored while a remote change is being applied.
    pub fn on_local_edit(&mut self, edit: Edit) -> CollabResult<()> {
        if self.guard.is_held() {
            debug!("Ignoring edit produced while applying a remote change");
            return Ok(());
        }
        if edit.is_noop() {
            return Err(CollabError::InvalidChange(
                "edit neither removes nor inserts text".to_string(),
            ));
        }

        let change = Change::new(edit, self.user_id.clone(), self.document.version());
        self.record_local(change)
    }

    fn record_local(&mut self, change: Change) -> CollabResult<()> {
        self.document.advance();

        if !self.connection.is_connected() {
            warn!(change = %change.id(), "Offline, edit kept locally until the next resync");
            self.unsent += 1;
            return Ok(());
        }

        let message = ChangeMessage::from_change(self.document.id(), &change, self.last_seq);
        self.pending.push_back(change);
        self.connection.send(ClientEvent::DocumentChange(message))
    }

    /// A `document:change` broadcast by the relay
    pub fn on_remote_change(&mut self, message: ChangeMessage) {
        self.last_seq = self.last_seq.max(message.seq);

        let remote = match message.to_change() {
            Ok(change) => change,
            Err(e) => {
                warn!("Malformed change from relay: {}", e);
                self.request_resync();
                return;
            }
        };

        if remote.origin() == self.user_id && !self.take_replay(remote.id()) {
            match self.pending.iter().position(|c| c.id() == remote.id()) {
                Some(index) => {
                    self.pending.remove(index);
                    debug!(change = %remote.id(), "Change acknowledged");
                }
                None => debug!(change = %remote.id(), "Echo of an unknown own change ignored"),
            }
            return;
        }
        self.presence.touch(remote.origin(), remote.timestamp());

        let mut incoming = Some(remote);
        let locals: Vec<Change> = self.pending.iter().cloned().collect();
        for local in locals {
            let Some(remote) = incoming.take() else {
                break;
            };
            incoming = self.on_conflict(local, remote);
        }

        if let Some(remote) = incoming {
            self.apply_remote(&remote);
        }
    }

    /// Resolve a remote change against one pending local change.
    ///
    /// Returns the remote change as it still has to be applied here, if at all.
    pub fn on_conflict(&mut self, local: Change, remote: Change) -> Option<Change> {
        let local_id = local.id();
        let conflict = Conflict::detect(local, remote);

        match &conflict.outcome {
            Resolution::AcceptRemote => {
                debug!(change = %local_id, "Remote made the same edit");
                self.drop_pending(local_id);
                None
            }
            Resolution::Merge(plan) => {
                if let Some(rebased) = plan.member(local_id) {
                    if let Some(slot) = self.pending.iter_mut().find(|c| c.id() == local_id) {
                        *slot = rebased.clone();
                    }
                }
                plan.counterpart(local_id).cloned()
            }
            Resolution::UserChoice => {
                self.hold_conflict(conflict.local, conflict.remote);
                None
            }
        }
    }

    /// Settle the conflict awaiting a decision
    pub fn resolve_conflict(&mut self, decision: Decision) -> CollabResult<()> {
        let conflict = self.held.take().ok_or(CollabError::NoPendingConflict)?;
        info!(
            local = %conflict.local.id(),
            remote = %conflict.remote.id(),
            ?decision,
            "Conflict resolved"
        );

        match decision {
            Decision::AcceptRemote => {}
            Decision::AcceptLocal => self.reassert = Some(self.surface.text()),
            Decision::ManualMerge(text) => self.reassert = Some(text),
        }
        if self.reassert.is_some() {
            // the re-asserted text already contains every local edit
            self.pending.clear();
            self.replay.clear();
        }

        self.request_resync();
        Ok(())
    }

    /// Ask the relay for its text; at most one request is in flight
    pub fn request_resync(&mut self) {
        if self.sync_in_flight {
            debug!("Resync already requested");
            return;
        }
        let request = ClientEvent::DocumentSync(SyncRequest {
            document_id: self.document.id().to_string(),
            version: self.document.version(),
        });
        match self.connection.send(request) {
            Ok(()) => self.sync_in_flight = true,
            Err(e) => debug!("Resync deferred: {}", e),
        }
    }

    pub fn move_cursor(&mut self, position: CursorPosition) -> CollabResult<()> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let user_id = self.user_id.clone();
        let document_id = self.document.id().to_string();

        let event = match position {
            CursorPosition::Caret(cursor) => ClientEvent::UserCursor(CursorMessage {
                user_id,
                document_id,
                cursor,
                timestamp,
            }),
            CursorPosition::Selection(selection) => ClientEvent::UserSelection(SelectionMessage {
                user_id,
                document_id,
                selection,
                timestamp,
            }),
        };
        self.connection.send(event)
    }

    pub fn add_comment(&mut self, text: &str, position: Position) -> CollabResult<String> {
        self.comments.add_comment(&self.connection, text, position)
    }

    pub fn update_comment(&mut self, id: &str, text: &str) -> CollabResult<()> {
        self.comments.update_comment(&self.connection, id, text)
    }

    pub fn delete_comment(&mut self, id: &str) -> CollabResult<()> {
        self.comments.delete_comment(&self.connection, id)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn text(&self) -> String {
        self.surface.text()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.presence.collaborators()
    }

    pub fn cursors(&self) -> Vec<CursorState> {
        self.presence.cursors()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.comments.comments()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_offline(&self) -> bool {
        self.connection.is_offline()
    }

    pub fn pending_changes(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_conflict(&self) -> Option<&Conflict> {
        self.held.as_ref()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::MoveCursor(position) => {
                if let Err(e) = self.move_cursor(position) {
                    debug!("Cursor update not sent: {}", e);
                }
            }
            Command::AddComment {
                text,
                position,
                reply,
            } => {
                let _ = reply.send(self.add_comment(&text, position));
            }
            Command::UpdateComment { id, text, reply } => {
                let _ = reply.send(self.update_comment(&id, &text));
            }
            Command::DeleteComment { id, reply } => {
                let _ = reply.send(self.delete_comment(&id));
            }
            Command::ResolveConflict { decision, reply } => {
                let _ = reply.send(self.resolve_conflict(decision));
            }
            Command::Resync => self.request_resync(),
            Command::Shutdown => self.connection.disconnect(),
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened {
                reconnected,
                joined,
            } => self.on_joined(joined, reconnected),
            ConnectionEvent::Closed => {
                // a request sent on the old link will never be answered
                self.sync_in_flight = false;
                self.notices.push(Notice::Disconnected);
            }
            ConnectionEvent::Error(e) => {
                warn!("Working offline: {}", e);
                self.notices.push(Notice::Offline(e));
            }
            ConnectionEvent::Message(event) => self.on_relay_event(event),
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::DocumentJoined(_) => debug!("Unexpected document:joined ignored"),
            RelayEvent::DocumentState(message) => self.on_document_state(message.document_state),
            RelayEvent::DocumentChange(message) => self.on_remote_change(message),
            RelayEvent::DocumentConflict(message) => self.on_relay_conflict(message),
            RelayEvent::UserJoined(joined) => {
                if joined.user.id == self.user_id {
                    return;
                }
                let collaborator =
                    Collaborator::new(joined.user.id, joined.user.name).with_avatar(joined.user.avatar);
                info!(user = %collaborator.id, "Collaborator joined");
                self.presence.upsert_collaborator(collaborator.clone());
                self.notices.push(Notice::CollaboratorJoined(collaborator));
            }
            RelayEvent::UserLeft(left) => {
                if self.presence.remove_collaborator(&left.user_id).is_some() {
                    info!(user = %left.user_id, "Collaborator left");
                    self.notices.push(Notice::CollaboratorLeft(left.user_id));
                }
            }
            RelayEvent::UserCursor(message) => self.on_cursor(
                &message.user_id,
                CursorPosition::Caret(message.cursor),
                message.timestamp,
            ),
            RelayEvent::UserSelection(message) => self.on_cursor(
                &message.user_id,
                CursorPosition::Selection(message.selection),
                message.timestamp,
            ),
            RelayEvent::CommentAdded(message) => {
                self.presence
                    .touch(&message.comment.author.id, message.comment.created_at);
                let notice = self.comments.on_added(message.comment);
                self.push_comment_notice(notice);
            }
            RelayEvent::CommentUpdated(message) => {
                let notice = self.comments.on_updated(message.comment);
                self.push_comment_notice(notice);
            }
            RelayEvent::CommentDeleted(message) => {
                let notice = self.comments.on_deleted(message);
                self.push_comment_notice(notice);
            }
            RelayEvent::Error(error) => {
                warn!("Relay error: {}", error.message);
                self.notices.push(Notice::RelayError(error.message));
            }
        }
    }

    fn on_joined(&mut self, joined: DocumentJoined, reconnected: bool) {
        self.presence.clear();
        for user in joined.collaborators {
            if user.id != self.user_id {
                self.presence
                    .upsert_collaborator(Collaborator::new(user.id, user.name).with_avatar(user.avatar));
            }
        }

        if reconnected {
            // echoes sent on the old link are gone with it
            self.pending.clear();
            self.replay.clear();
        }
        if let Some(state) = joined.document_state {
            self.load_snapshot(state);
        }
        if reconnected {
            self.sync_in_flight = false;
            self.request_resync();
        }
        self.notices.push(Notice::Connected { reconnected });
    }

    fn on_document_state(&mut self, state: DocumentState) {
        self.sync_in_flight = false;
        let version = self.load_snapshot(state);
        info!(version, "Document resynced");
        self.notices.push(Notice::Resynced { version });

        if let Some(text) = self.reassert.take() {
            self.reassert_text(text);
        }
    }

    fn load_snapshot(&mut self, state: DocumentState) -> u64 {
        {
            let _scope = self.guard.enter();
            self.surface.load(&state.text);
        }
        self.last_seq = self.last_seq.max(state.version);
        self.replay.extend(self.pending.drain(..).map(|c| c.id()));
        if self.replay.len() > REPLAY_LIMIT {
            let excess = self.replay.len() - REPLAY_LIMIT;
            self.replay.drain(..excess);
        }

        if self.unsent > 0 {
            warn!(count = self.unsent, "Offline edits replaced by the relay's text");
            self.notices.push(Notice::LocalEditsDiscarded { count: self.unsent });
            self.unsent = 0;
        }
        self.document.adopt(state.version)
    }

    fn take_replay(&mut self, id: Uuid) -> bool {
        match self.replay.iter().position(|r| *r == id) {
            Some(index) => self.replay.remove(index).is_some(),
            None => false,
        }
    }

    /// Replace the whole document with `text` and send that as one change
    fn reassert_text(&mut self, text: String) {
        let current = TextBuffer::new(self.surface.text());
        if current.text() == text {
            return;
        }

        let edit = Edit::replace(current.full_range(), text);
        let change = Change::new(edit, self.user_id.clone(), self.document.version());
        let applied = {
            let _scope = self.guard.enter();
            self.surface.apply_change(&change)
        };
        if let Err(e) = applied {
            warn!("Could not re-assert local text: {}", e);
            return;
        }
        if let Err(e) = self.record_local(change) {
            warn!("Could not send re-asserted text: {}", e);
        }
    }

    fn on_relay_conflict(&mut self, message: ConflictMessage) {
        let (local, remote) = match (
            message.local_change.to_change(),
            message.remote_change.to_change(),
        ) {
            (Ok(local), Ok(remote)) => (local, remote),
            _ => {
                warn!("Malformed conflict from relay");
                self.request_resync();
                return;
            }
        };

        if self.held.as_ref().map(|c| c.local.id()) == Some(local.id()) {
            debug!(change = %local.id(), "Conflict already awaiting a decision");
            return;
        }

        let local = self
            .pending
            .iter()
            .find(|c| c.id() == local.id())
            .cloned()
            .unwrap_or(local);
        self.hold_conflict(local, remote);
    }

    fn hold_conflict(&mut self, local: Change, remote: Change) {
        self.drop_pending(local.id());
        if self.held.is_some() {
            debug!(change = %local.id(), "Another conflict is awaiting a decision");
            return;
        }

        info!(local = %local.id(), remote = %remote.id(), "Overlapping edits need a decision");
        self.notices.push(Notice::ConflictPending {
            local: local.clone(),
            remote: remote.clone(),
        });
        self.held = Some(Conflict {
            local,
            remote,
            outcome: Resolution::UserChoice,
        });
    }

    fn drop_pending(&mut self, id: Uuid) {
        self.pending.retain(|c| c.id() != id);
    }

    fn apply_remote(&mut self, change: &Change) {
        let applied = {
            let _scope = self.guard.enter();
            self.surface.apply_change(change)
        };

        match applied {
            Ok(()) => {
                self.document.advance();
            }
            Err(e) => {
                warn!(change = %change.id(), "Remote change did not apply: {}", e);
                if self.held.is_none() {
                    self.request_resync();
                }
            }
        }
    }

    fn on_cursor(&mut self, user_id: &str, position: CursorPosition, timestamp: i64) {
        match self.presence.update_cursor(user_id, position, timestamp) {
            Ok(()) => {
                if let Some(state) = self.presence.cursor(user_id) {
                    self.notices.push(Notice::CursorMoved(state.clone()));
                }
            }
            Err(e) => debug!("Cursor ignored: {}", e),
        }
    }

    fn push_comment_notice(&mut self, notice: Option<CommentNotice>) {
        if let Some(notice) = notice {
            self.notices.push(Notice::Comment(notice));
        }
    }
}
