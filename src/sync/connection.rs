//! Connection lifecycle against the relay.
//!
//! The manager owns one link at a time. Background tasks (frame reader,
//! heartbeat, reconnect timer) report back over a single channel and tag every
//! event with the generation they were started under; anything from an older
//! generation is discarded, so a late timer or a reader from a dropped link
//! cannot touch the current session.
//!
//! After an unexpected drop there is exactly one reconnect attempt. If it
//! fails the manager stays offline until `connect()` is called again.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::protocol::{ClientEvent, DocumentJoined, RelayEvent, SessionHello, WireCodec, PROTOCOL_VERSION};
use super::{CollabError, CollabResult, CollaboratorId, ConnectionError, DocumentId};
use crate::config::CollabConfig;

/// Both directions of an open link, as text frames
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the relay
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<TransportLink, ConnectionError>;
}

/// WebSocket transport over tokio-tungstenite
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<TransportLink, ConnectionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: ends when every outbound sender is gone
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Text(frame)).await {
                    debug!("WebSocket write failed: {}", e);
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader: ends on close, error, or when nobody listens anymore
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the coordinator sees from the connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A reconnect attempt succeeded
    Opened { reconnected: bool, joined: DocumentJoined },
    /// The link dropped unexpectedly; one reconnect is scheduled
    Closed,
    /// The reconnect attempt failed; the manager is now offline
    Error(ConnectionError),
    /// A relay frame
    Message(RelayEvent),
}

/// Who is connecting to what
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub user_id: CollaboratorId,
    pub user_name: String,
    pub document_id: DocumentId,
    pub avatar: Option<String>,
}

/// Outbound side used by components that only need to send
pub trait EventSink {
    fn is_connected(&self) -> bool;
    fn send(&self, event: ClientEvent) -> CollabResult<()>;
}

enum TaskEvent {
    Frame(RelayEvent),
    Dropped,
    Reconnected(Result<(TransportLink, DocumentJoined), ConnectionError>),
}

struct Tagged {
    generation: u64,
    event: TaskEvent,
}

/// Owns the link to the relay and its background tasks
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    state: ConnectionState,
    generation: u64,
    offline: bool,
    closed: bool,
    metadata: Option<SessionMetadata>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: &CollabConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            reconnect_delay: config.reconnect_delay,
            state: ConnectionState::Disconnected,
            generation: 0,
            offline: false,
            closed: false,
            metadata: None,
            outbound: None,
            events_tx,
            events_rx,
            tasks: Vec::new(),
        }
    }

    /// WebSocket manager for the configured relay URL
    pub fn websocket(config: &CollabConfig) -> Self {
        Self::new(Arc::new(WsTransport::new(config.relay_url.clone())), config)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Set after a failed connect or reconnect, cleared by the next success
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Open a session and wait for `document:joined`.
    ///
    /// The hello asks for the full document state.
    pub async fn connect(
        &mut self,
        user_id: &str,
        user_name: &str,
        document_id: &str,
    ) -> CollabResult<DocumentJoined> {
        if self.closed {
            return Err(ConnectionError::Closed.into());
        }

        self.generation += 1;
        self.stop_tasks();
        self.outbound = None;
        self.state = ConnectionState::Connecting;

        let metadata = SessionMetadata {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            document_id: document_id.to_string(),
            avatar: None,
        };
        self.metadata = Some(metadata.clone());
        info!(document = %document_id, user = %user_id, "Connecting to relay");

        match handshake(self.transport.as_ref(), &metadata, true, self.connect_timeout).await {
            Ok((link, joined)) => {
                self.install(link);
                info!(session = %joined.session_id, "Connected to relay");
                Ok(joined)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.offline = true;
                error!("Failed to connect: {}", e);
                Err(e.into())
            }
        }
    }

    /// Close the session for good; later `connect()` calls fail
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.generation += 1;
        self.stop_tasks();
        self.outbound = None;
        self.state = ConnectionState::Disconnected;
        info!("Disconnected from relay");
    }

    /// Next event for the current session.
    ///
    /// Cancel-safe: nothing is awaited after an event has been taken off the
    /// channel.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        loop {
            let tagged = self.events_rx.recv().await?;
            if tagged.generation != self.generation {
                debug!(
                    stale = tagged.generation,
                    current = self.generation,
                    "Discarding stale connection event"
                );
                continue;
            }

            match tagged.event {
                TaskEvent::Frame(event) => return Some(ConnectionEvent::Message(event)),
                TaskEvent::Dropped => {
                    if self.state != ConnectionState::Connected {
                        continue;
                    }
                    self.on_dropped();
                    return Some(ConnectionEvent::Closed);
                }
                TaskEvent::Reconnected(Ok((link, joined))) => {
                    self.install(link);
                    info!(session = %joined.session_id, "Reconnected to relay");
                    return Some(ConnectionEvent::Opened {
                        reconnected: true,
                        joined,
                    });
                }
                TaskEvent::Reconnected(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    self.offline = true;
                    self.stop_tasks();
                    warn!("Reconnect failed, staying offline: {}", e);
                    return Some(ConnectionEvent::Error(e));
                }
            }
        }
    }

    fn install(&mut self, link: TransportLink) {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        let generation = self.generation;

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match WireCodec::decode_relay(&frame) {
                    Ok(event) => {
                        if events
                            .send(Tagged {
                                generation,
                                event: TaskEvent::Frame(event),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping malformed relay frame: {}", e),
                }
            }
            let _ = events.send(Tagged {
                generation,
                event: TaskEvent::Dropped,
            });
        });

        let ping = outbound.clone();
        let period = self.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let frame = match WireCodec::encode_client(&ClientEvent::Ping) {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                if ping.send(frame).is_err() {
                    return;
                }
            }
        });

        self.stop_tasks();
        self.tasks.push(reader);
        self.tasks.push(heartbeat);
        self.outbound = Some(outbound);
        self.state = ConnectionState::Connected;
        self.offline = false;
    }

    fn on_dropped(&mut self) {
        warn!("Connection to relay lost");
        self.generation += 1;
        self.stop_tasks();
        self.outbound = None;
        self.state = ConnectionState::Disconnected;

        let Some(metadata) = self.metadata.clone() else {
            return;
        };

        let generation = self.generation;
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let delay = self.reconnect_delay;
        let timeout = self.connect_timeout;

        self.state = ConnectionState::Reconnecting;
        info!("Reconnecting in {:?}", delay);
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = handshake(transport.as_ref(), &metadata, false, timeout).await;
            let _ = events.send(Tagged {
                generation,
                event: TaskEvent::Reconnected(result),
            });
        }));
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl EventSink for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn send(&self, event: ClientEvent) -> CollabResult<()> {
        let outbound = match (&self.outbound, self.state) {
            (Some(outbound), ConnectionState::Connected) => outbound,
            _ => return Err(CollabError::Offline(format!("cannot send {}", event.name()))),
        };
        let frame = WireCodec::encode_client(&event)?;
        outbound
            .send(frame)
            .map_err(|_| ConnectionError::Transport("link closed".to_string()).into())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Open a link, say hello and wait for the relay to acknowledge the session
async fn handshake(
    transport: &dyn Transport,
    metadata: &SessionMetadata,
    request_state: bool,
    timeout: Duration,
) -> Result<(TransportLink, DocumentJoined), ConnectionError> {
    tokio::time::timeout(timeout, open_session(transport, metadata, request_state))
        .await
        .map_err(|_| ConnectionError::Timeout(timeout))?
}

async fn open_session(
    transport: &dyn Transport,
    metadata: &SessionMetadata,
    request_state: bool,
) -> Result<(TransportLink, DocumentJoined), ConnectionError> {
    let mut link = transport.open().await?;

    let hello = ClientEvent::SessionHello(SessionHello {
        protocol_version: PROTOCOL_VERSION,
        user_id: metadata.user_id.clone(),
        user_name: metadata.user_name.clone(),
        document_id: metadata.document_id.clone(),
        avatar: metadata.avatar.clone(),
        request_state,
    });
    let frame =
        WireCodec::encode_client(&hello).map_err(|e| ConnectionError::Transport(e.to_string()))?;
    link.outbound
        .send(frame)
        .map_err(|_| ConnectionError::Transport("link closed before hello".to_string()))?;

    while let Some(frame) = link.inbound.recv().await {
        match WireCodec::decode_relay(&frame) {
            Ok(RelayEvent::DocumentJoined(joined)) => return Ok((link, joined)),
            Ok(RelayEvent::Error(e)) => return Err(ConnectionError::Rejected(e.message)),
            Ok(other) => debug!("Ignoring {} before join acknowledgment", other.name()),
            Err(e) => warn!("Dropping malformed relay frame: {}", e),
        }
    }
    Err(ConnectionError::Transport(
        "link closed during handshake".to_string(),
    ))
}
