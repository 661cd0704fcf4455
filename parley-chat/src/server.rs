//! WebSocket chat gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── HistoryLog   (chat:{room})
//!            ├── Session ── RoomRegistry ── Presence    (online:{room})
//! Client B ──┘      ▲                  └── FanoutBridge ──► shared channel
//!                   │                                          │
//!                   └──── outbox ◄── LocalRooms ◄── receive ◄──┘
//! ```
//!
//! Each connection runs one task that selects over inbound frames and the
//! session outbox. Inbound JSON events are dispatched to the session manager;
//! outbound events are written as JSON text frames. Whatever ends the loop,
//! the session is closed and its rooms cleaned up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::fanout::FanoutBridge;
use crate::history::HistoryLog;
use crate::presence::PresenceRegistry;
use crate::protocol::{ClientEvent, ServerEvent, SessionId};
use crate::rooms::{LocalRooms, RoomError, RoomRegistry};
use crate::session::{SessionError, SessionManager};
use crate::store::{RedisStore, SharedStore, StoreError};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub events_received: u64,
    pub events_sent: u64,
    pub undecodable_frames: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub active_rooms: usize,
    pub frames_published: u64,
    pub frames_received: u64,
}

/// Lock-free connection counters.
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    events_received: AtomicU64,
    events_sent: AtomicU64,
    undecodable_frames: AtomicU64,
}

/// The chat server. One per process.
pub struct ChatServer {
    config: ServerConfig,
    local: Arc<LocalRooms>,
    bridge: Arc<FanoutBridge>,
    sessions: Arc<SessionManager>,
    stats: Arc<AtomicServerStats>,
}

impl ChatServer {
    /// Connect to the store at `config.store_url`. Failure is fatal.
    pub async fn connect(config: ServerConfig) -> Result<Self, ServerError> {
        let store = RedisStore::connect(&config.store_url, config.store_timeout).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Build a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SharedStore>) -> Self {
        let local = Arc::new(LocalRooms::new());
        let bridge = Arc::new(FanoutBridge::new(
            store.clone(),
            config.fanout_channel.clone(),
            local.clone(),
        ));
        let rooms = RoomRegistry::new(
            local.clone(),
            HistoryLog::with_capacity(store.clone(), config.history_capacity),
            PresenceRegistry::new(store),
            bridge.clone(),
        )
        .with_replay_limit(config.replay_limit)
        .with_cleanup_attempts(config.presence_cleanup_attempts);
        let sessions = Arc::new(SessionManager::new(Arc::new(rooms), config.outbox_capacity));

        Self {
            config,
            local,
            bridge,
            sessions,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Subscribe the fanout bridge, bind, and accept connections until the
    /// listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let bridge_task = self.bridge.start().await?;
        let listener = match TcpListener::bind(&self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                bridge_task.abort();
                return Err(e.into());
            }
        };
        log::info!("Chat server listening on {}", self.config.bind_addr);

        let result = self.accept_loop(listener).await;
        bridge_task.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let sessions = self.sessions.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, sessions, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sessions: Arc<SessionManager>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let (session, mut outbox) = sessions.open().await;
        log::info!("WebSocket connection established from {addr} (session {session})");

        let result: Result<(), ServerError> = async {
            loop {
                tokio::select! {
                    // Inbound client frame
                    msg = ws_receiver.next() => {
                        let decoded = match msg {
                            Some(Ok(Message::Text(text))) => ClientEvent::decode(text.as_str()),
                            Some(Ok(Message::Binary(data))) => ClientEvent::decode_bytes(&data),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        match decoded {
                            Ok(event) => {
                                stats.events_received.fetch_add(1, Ordering::Relaxed);
                                if let Some(reply) = Self::dispatch(&sessions, session, event).await {
                                    if let Ok(text) = reply.encode() {
                                        ws_sender.send(Message::Text(text.into())).await?;
                                    }
                                }
                            }
                            Err(e) => {
                                stats.undecodable_frames.fetch_add(1, Ordering::Relaxed);
                                log::debug!("Ignoring undecodable frame from {addr}: {e}");
                            }
                        }
                    }

                    // Outbound event queued for this session
                    event = outbox.recv() => {
                        let Some(event) = event else { break };
                        match event.encode() {
                            Ok(text) => {
                                ws_sender.send(Message::Text(text.into())).await?;
                                stats.events_sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => log::warn!("Failed to encode event for {session}: {e}"),
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        sessions.close(session).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Session {session} from {addr} closed");
        result
    }

    /// Apply one client event. Returns a reply for the client, if any.
    async fn dispatch(
        sessions: &SessionManager,
        session: SessionId,
        event: ClientEvent,
    ) -> Option<ServerEvent> {
        let outcome = match event {
            ClientEvent::JoinRoom(req) => {
                match sessions.join(session, req.room(), req.username()).await {
                    Err(SessionError::Room(e @ RoomError::InvalidRoom)) => {
                        return Some(ServerEvent::error(e.code(), e.to_string()));
                    }
                    other => other.map(|_| ()),
                }
            }
            ClientEvent::Message(msg) => sessions
                .send(session, &msg.room, msg.username.as_deref(), &msg.text)
                .await
                .map(|_| ()),
            ClientEvent::Typing(update) => {
                sessions
                    .typing(session, &update.room, update.is_typing, update.username.as_deref())
                    .await
            }
            ClientEvent::LeaveRoom(room) => sessions.leave(session, &room).await,
        };

        match outcome {
            Ok(()) => {}
            Err(SessionError::Room(e @ (RoomError::InvalidRoom | RoomError::EmptyMessage))) => {
                log::debug!("Dropped event from {session}: {e}");
            }
            Err(e) => log::warn!("Event from {session} failed: {e}"),
        }
        None
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let delivery = self.local.stats().await;
        let fanout = self.bridge.stats();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            undecodable_frames: self.stats.undecodable_frames.load(Ordering::Relaxed),
            events_delivered: delivery.events_delivered,
            events_dropped: delivery.events_dropped,
            active_rooms: delivery.active_rooms,
            frames_published: fanout.frames_published,
            frames_received: fanout.frames_received,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn bridge(&self) -> &Arc<FanoutBridge> {
        &self.bridge
    }
}
