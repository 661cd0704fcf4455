//! WebSocket chat client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Room operations: join, message, typing, leave
//! - A stream of [`ChatEvent`]s decoded from server frames

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ClientEvent, JoinRequest, OutgoingMessage, ProtocolError, ServerEvent, TypingUpdate,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the chat client.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Event pushed by the server
    Server(ServerEvent),
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The chat client.
pub struct ChatClient {
    /// Display name sent with joins and messages
    username: Option<String>,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    event_rx: Option<mpsc::Receiver<ChatEvent>>,
    event_tx: mpsc::Sender<ChatEvent>,

    server_url: String,
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            username: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames, close when the client drops its sender
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ChatEvent::Connected).await;

        // Reader task: decode server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            let _ = event_tx.send(ChatEvent::Server(event)).await;
                        }
                        Err(e) => log::debug!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ChatEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Pending outgoing frames are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send any client event.
    pub async fn send_event(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let encoded = event.encode()?;
        tx.send(encoded).await.map_err(|_| ClientError::NotConnected)
    }

    pub async fn join_room(&self, room: impl Into<String>) -> Result<(), ClientError> {
        let room = room.into();
        let request = match &self.username {
            Some(name) => JoinRequest::Detailed {
                room,
                username: Some(name.clone()),
            },
            None => JoinRequest::Room(room),
        };
        self.send_event(&ClientEvent::JoinRoom(request)).await
    }

    pub async fn send_message(
        &self,
        room: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send_event(&ClientEvent::Message(OutgoingMessage {
            room: room.into(),
            username: self.username.clone(),
            text: text.into(),
        }))
        .await
    }

    pub async fn set_typing(&self, room: impl Into<String>, is_typing: bool) -> Result<(), ClientError> {
        self.send_event(&ClientEvent::Typing(TypingUpdate {
            room: room.into(),
            is_typing,
            username: self.username.clone(),
        }))
        .await
    }

    pub async fn leave_room(&self, room: impl Into<String>) -> Result<(), ClientError> {
        self.send_event(&ClientEvent::LeaveRoom(room.into())).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
