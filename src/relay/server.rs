//! Relay registry and the axum WebSocket front end.
//!
//! Uses DashMap for concurrent access to document rooms; each room sits behind
//! a parking_lot mutex so sequencing and fan-out for one document happen
//! atomically.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use super::room::{DocumentRoom, Submission};
use super::RelayError;
use crate::config::RelayConfig;
use crate::sync::protocol::{
    ClientEvent, CommentMessage, DocumentJoined, DocumentState, RelayEvent, SessionHello,
    StateMessage, UserInfo, WireCodec, PROTOCOL_VERSION,
};
use crate::sync::{DocumentId, SessionId};

/// How long a fresh socket may take to send `session:hello`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type SharedRoom = Arc<Mutex<DocumentRoom>>;

/// All documents served by this relay
pub struct RelayServer {
    config: RelayConfig,
    rooms: DashMap<DocumentId, SharedRoom>,
    sessions: DashMap<SessionId, DocumentId>,
    started_at: Instant,
}

/// Relay statistics
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub documents: usize,
    pub sessions: usize,
    pub uptime_seconds: u64,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: DashMap::new(),
            sessions: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Admit a session to the document named in its hello.
    ///
    /// `document:joined` and the stored comments are queued on `tx` while the
    /// room is locked, so they reach the session before any later broadcast.
    /// The registry entry stays locked until the session is a member, so an
    /// emptied room cannot be dropped underneath a join.
    pub fn join(
        &self,
        session_id: &str,
        hello: &SessionHello,
        tx: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<(SharedRoom, DocumentJoined), RelayError> {
        WireCodec::check_version(hello).map_err(|e| RelayError::Handshake(e.to_string()))?;
        if hello.document_id.is_empty() || hello.user_id.is_empty() {
            return Err(RelayError::Handshake(
                "userId and documentId are required".to_string(),
            ));
        }

        let entry = self
            .rooms
            .entry(hello.document_id.clone())
            .or_insert_with(|| {
                info!(document = %hello.document_id, "Document created");
                Arc::new(Mutex::new(DocumentRoom::new(
                    &hello.document_id,
                    self.config.history_limit,
                )))
            });
        let room = entry.value().clone();
        let joined = {
            let mut guard = room.lock();
            if guard.member_count() >= self.config.max_sessions_per_document {
                return Err(RelayError::DocumentFull(hello.document_id.clone()));
            }
            let user = UserInfo {
                id: hello.user_id.clone(),
                name: hello.user_name.clone(),
                avatar: hello.avatar.clone(),
            };
            let joined = guard.join(session_id, user, tx.clone(), hello.request_state);

            let _ = tx.send(RelayEvent::DocumentJoined(joined.clone()));
            for comment in guard.comments() {
                let _ = tx.send(RelayEvent::CommentAdded(CommentMessage { comment }));
            }
            joined
        };
        drop(entry);

        self.sessions
            .insert(session_id.to_string(), hello.document_id.clone());
        Ok((room, joined))
    }

    pub fn leave(&self, session_id: &str) {
        let Some((_, document_id)) = self.sessions.remove(session_id) else {
            return;
        };
        if let Some(room) = self.rooms.get(&document_id) {
            room.lock().leave(session_id);
        }
        // documents live only while someone has them open
        let removed = self
            .rooms
            .remove_if(&document_id, |_, room| room.lock().member_count() == 0);
        if removed.is_some() {
            info!(document = %document_id, "Document closed");
        }
    }

    /// Current text and version of a document, if it exists
    pub fn document_state(&self, document_id: &str) -> Option<DocumentState> {
        self.rooms.get(document_id).map(|room| room.lock().state())
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            documents: self.rooms.len(),
            sessions: self.sessions.len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Handle one client frame for a joined session
pub fn handle_client_event(
    room: &Mutex<DocumentRoom>,
    session_id: &str,
    tx: &mpsc::UnboundedSender<RelayEvent>,
    event: ClientEvent,
) {
    let mut room = room.lock();

    let result = match event {
        ClientEvent::SessionHello(_) => Err(RelayError::Handshake(
            "session already established".to_string(),
        )),

        ClientEvent::DocumentChange(message) => room
            .check_document(&message.document_id)
            .map(|_| match room.submit(&message) {
                Submission::Accepted(accepted) => {
                    debug!(seq = accepted.seq, user = %accepted.user_id, "Change sequenced");
                    room.broadcast(RelayEvent::DocumentChange(accepted));
                }
                Submission::Absorbed => {}
                Submission::Conflict(conflict) => {
                    let _ = tx.send(RelayEvent::DocumentConflict(conflict));
                }
                Submission::Rejected { reason, state } => {
                    let _ = tx.send(RelayEvent::error(reason));
                    let _ = tx.send(RelayEvent::DocumentState(StateMessage {
                        document_state: state,
                    }));
                }
            }),

        ClientEvent::DocumentSync(request) => room.check_document(&request.document_id).map(|_| {
            let _ = tx.send(RelayEvent::DocumentState(StateMessage {
                document_state: room.state(),
            }));
        }),

        ClientEvent::UserCursor(mut message) => room.check_document(&message.document_id).map(|_| {
            if let Some(user) = room.user_of(session_id) {
                message.user_id = user.id.clone();
            }
            room.broadcast_except(session_id, RelayEvent::UserCursor(message));
        }),

        ClientEvent::UserSelection(mut message) => {
            room.check_document(&message.document_id).map(|_| {
                if let Some(user) = room.user_of(session_id) {
                    message.user_id = user.id.clone();
                }
                room.broadcast_except(session_id, RelayEvent::UserSelection(message));
            })
        }

        ClientEvent::CommentAdd(message) => room.add_comment(message.comment).map(|comment| {
            room.broadcast(RelayEvent::CommentAdded(CommentMessage { comment }));
        }),

        ClientEvent::CommentUpdated(message) => {
            room.update_comment(message.comment).map(|comment| {
                room.broadcast(RelayEvent::CommentUpdated(CommentMessage { comment }));
            })
        }

        ClientEvent::CommentDeleted(request) => room
            .delete_comment(&request)
            .map(|_| room.broadcast(RelayEvent::CommentDeleted(request))),

        ClientEvent::Ping => Ok(()),
    };

    if let Err(e) = result {
        warn!(session = %session_id, "Request refused: {}", e);
        let _ = tx.send(RelayEvent::error(e.to_string()));
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    #[serde(flatten)]
    stats: RelayStats,
}

async fn health_check(State(server): State<Arc<RelayServer>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        stats: server.stats(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<RelayServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, server))
}

/// Wait for the first text frame and decode it as `session:hello`
async fn read_hello(receiver: &mut SplitStream<WebSocket>) -> Result<SessionHello, RelayError> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await
    .map_err(|_| RelayError::Handshake("no session:hello received".to_string()))?
    .ok_or_else(|| RelayError::Handshake("socket closed before session:hello".to_string()))?;

    match WireCodec::decode_client(&first) {
        Ok(ClientEvent::SessionHello(hello)) => Ok(hello),
        Ok(other) => Err(RelayError::Handshake(format!(
            "expected session:hello, got {}",
            other.name()
        ))),
        Err(e) => Err(RelayError::Handshake(e.to_string())),
    }
}

/// Report why the session was refused and close the socket
async fn refuse(mut sender: SplitSink<WebSocket, Message>, error: RelayError) {
    if let Ok(frame) = WireCodec::encode_relay(&RelayEvent::error(error.to_string())) {
        let _ = sender.send(Message::Text(frame)).await;
    }
    let _ = sender.close().await;
}

async fn handle_websocket(socket: WebSocket, server: Arc<RelayServer>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let hello = match read_hello(&mut ws_receiver).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!("Rejecting socket: {}", e);
            refuse(ws_sender, e).await;
            return;
        }
    };

    let session_id = generate_session_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();

    let room = match server.join(&session_id, &hello, tx.clone()) {
        Ok((room, joined)) => {
            debug!(
                session = %session_id,
                collaborators = joined.collaborators.len(),
                "Session admitted"
            );
            room
        }
        Err(e) => {
            warn!(user = %hello.user_id, "Rejecting session: {}", e);
            refuse(ws_sender, e).await;
            return;
        }
    };

    let session_send = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match WireCodec::encode_relay(&event) {
                Ok(frame) => {
                    if ws_sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode {}: {}", event.name(), e),
            }
        }
        debug!("Send task ended for session {}", session_send);
    });

    let session_recv = session_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => match WireCodec::decode_client(&text) {
                    Ok(event) => handle_client_event(&room, &session_recv, &tx, event),
                    Err(e) => {
                        warn!("Malformed frame from {}: {}", session_recv, e);
                        let _ = tx.send(RelayEvent::error(e.to_string()));
                    }
                },
                Message::Binary(_) => {
                    let _ = tx.send(RelayEvent::error("binary frames are not supported"));
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", session_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for session {}", session_recv);
    });

    let send_abort = send_task.abort_handle();
    let recv_abort = recv_task.abort_handle();
    tokio::select! {
        _ = send_task => recv_abort.abort(),
        _ = recv_task => send_abort.abort(),
    }

    server.leave(&session_id);
    info!(session = %session_id, document = %hello.document_id, "Session closed");
}

/// Random session id
fn generate_session_id() -> String {
    use sha2::{Digest, Sha256};
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Routes: `/health` and the `/ws` WebSocket endpoint
pub fn router(server: Arc<RelayServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(server)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve the relay on an already bound listener
pub async fn serve(listener: TcpListener, server: Arc<RelayServer>) -> std::io::Result<()> {
    axum::serve(listener, router(server)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::change::{Change, Edit, Position};
    use crate::sync::protocol::{ChangeMessage, CursorMessage, SyncRequest};
    use tokio_test::assert_ok;

    fn hello(user: &str, document: &str) -> SessionHello {
        SessionHello {
            protocol_version: PROTOCOL_VERSION,
            user_id: user.to_string(),
            user_name: user.to_string(),
            document_id: document.to_string(),
            avatar: None,
            request_state: true,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_join_rejects_wrong_version() {
        let server = RelayServer::new(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut old = hello("alice", "doc");
        old.protocol_version = PROTOCOL_VERSION + 1;

        assert!(matches!(
            server.join("s1", &old, tx),
            Err(RelayError::Handshake(_))
        ));
        assert_eq!(server.stats().sessions, 0);
    }

    #[test]
    fn test_document_full() {
        let mut config = RelayConfig::default();
        config.max_sessions_per_document = 1;
        let server = RelayServer::new(config);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_ok!(server.join("s1", &hello("alice", "doc"), tx.clone()));
        assert!(matches!(
            server.join("s2", &hello("bob", "doc"), tx),
            Err(RelayError::DocumentFull(_))
        ));
    }

    #[test]
    fn test_change_broadcast_to_everyone() {
        let server = RelayServer::new(RelayConfig::default());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (room, _) = server.join("s1", &hello("alice", "doc"), a_tx.clone()).unwrap();
        server.join("s2", &hello("bob", "doc"), b_tx).unwrap();
        drain(&mut a_rx);

        let change = Change::new(Edit::insert(Position::new(0, 0), "hi"), "alice", 0);
        handle_client_event(
            &room,
            "s1",
            &a_tx,
            ClientEvent::DocumentChange(ChangeMessage::from_change("doc", &change, 0)),
        );

        for events in [drain(&mut a_rx), drain(&mut b_rx)] {
            assert!(events
                .iter()
                .any(|e| matches!(e, RelayEvent::DocumentChange(m) if m.seq == 1)));
        }
        assert_eq!(server.document_state("doc").unwrap().text, "hi");
    }

    #[test]
    fn test_cursor_goes_to_others_only() {
        let server = RelayServer::new(RelayConfig::default());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (room, _) = server.join("s1", &hello("alice", "doc"), a_tx.clone()).unwrap();
        server.join("s2", &hello("bob", "doc"), b_tx).unwrap();
        drain(&mut a_rx);

        handle_client_event(
            &room,
            "s1",
            &a_tx,
            ClientEvent::UserCursor(CursorMessage {
                user_id: "mallory".to_string(),
                document_id: "doc".to_string(),
                cursor: Position::new(0, 0),
                timestamp: 0,
            }),
        );

        assert!(drain(&mut a_rx).is_empty());
        match drain(&mut b_rx).pop() {
            Some(RelayEvent::UserCursor(message)) => assert_eq!(message.user_id, "alice"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_sync_for_other_document_refused() {
        let server = RelayServer::new(RelayConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (room, _) = server.join("s1", &hello("alice", "doc"), tx.clone()).unwrap();

        handle_client_event(
            &room,
            "s1",
            &tx,
            ClientEvent::DocumentSync(SyncRequest {
                document_id: "elsewhere".to_string(),
                version: 0,
            }),
        );
        assert!(matches!(drain(&mut rx).pop(), Some(RelayEvent::Error(_))));
    }

    #[test]
    fn test_leave_announces_departure() {
        let server = RelayServer::new(RelayConfig::default());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        server.join("s1", &hello("alice", "doc"), a_tx).unwrap();
        server.join("s2", &hello("bob", "doc"), b_tx).unwrap();
        drain(&mut a_rx);

        server.leave("s2");
        assert!(matches!(
            drain(&mut a_rx).pop(),
            Some(RelayEvent::UserLeft(left)) if left.user_id == "bob"
        ));
        assert_eq!(server.stats().sessions, 1);
    }

    #[test]
    fn test_last_leave_closes_document() {
        let server = RelayServer::new(RelayConfig::default());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        server.join("s1", &hello("alice", "doc"), a_tx.clone()).unwrap();
        server.join("s2", &hello("bob", "doc"), b_tx).unwrap();

        server.leave("s1");
        assert!(server.document_state("doc").is_some());

        server.leave("s2");
        assert!(server.document_state("doc").is_none());
        assert_eq!(server.stats().documents, 0);

        // the id can be opened again from scratch
        let (_, joined) = server.join("s3", &hello("alice", "doc"), a_tx).unwrap();
        assert_eq!(joined.document_state.unwrap().version, 0);
        assert_eq!(server.stats().documents, 1);
    }
}
