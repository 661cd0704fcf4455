//! Per-connection session state.
//!
//! ```text
//!  open ──► Connected ──join──► Member ──leave last room──► Connected
//!               │                  │
//!               └──────close───────┴──────────────► Closed (terminal)
//! ```
//!
//! A closed session accepts no further operations and receives no further
//! events: `close` removes it from every room before returning.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ChatMessage, ServerEvent, SessionId};
use crate::rooms::{Outbox, RoomError, RoomRegistry, SessionHandle};

/// Default per-session outbox capacity.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Member,
    Closed,
}

/// Session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(SessionId),
    #[error(transparent)]
    Room(#[from] RoomError),
}

struct Session {
    id: SessionId,
    display_name: Option<String>,
    rooms: BTreeSet<String>,
    state: SessionState,
    outbox: Outbox,
}

impl Session {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            display_name: self.display_name.clone(),
            outbox: self.outbox.clone(),
        }
    }

    fn remember_name(&mut self, username: Option<&str>) {
        if let Some(name) = username.map(str::trim).filter(|n| !n.is_empty()) {
            self.display_name = Some(name.to_string());
        }
    }
}

/// Owns every live session on this instance.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Session>>,
    rooms: Arc<RoomRegistry>,
    outbox_capacity: usize,
}

impl SessionManager {
    pub fn new(rooms: Arc<RoomRegistry>, outbox_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rooms,
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Register a new connection. The receiver yields every event queued
    /// for it.
    pub async fn open(&self) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (outbox, rx) = mpsc::channel(self.outbox_capacity);
        let id = Uuid::new_v4();
        self.sessions.write().await.insert(
            id,
            Session {
                id,
                display_name: None,
                rooms: BTreeSet::new(),
                state: SessionState::Connected,
                outbox,
            },
        );
        log::debug!("Session {id} opened");
        (id, rx)
    }

    async fn handle(&self, id: SessionId, username: Option<&str>) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(SessionError::Closed(id))?;
        session.remember_name(username);
        Ok(session.handle())
    }

    /// Join `room`, optionally setting the session's display name first.
    pub async fn join(
        &self,
        id: SessionId,
        room: &str,
        username: Option<&str>,
    ) -> Result<usize, SessionError> {
        let handle = self.handle(id, username).await?;
        let replayed = self.rooms.join(&handle, room).await?;

        let still_open = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&id) {
                Some(session) => {
                    session.rooms.insert(room.to_string());
                    session.state = SessionState::Member;
                    true
                }
                None => false,
            }
        };
        if !still_open {
            // Closed while the join was in flight; undo it.
            self.rooms.leave_all(&handle, &[room.to_string()]).await;
            return Err(SessionError::Closed(id));
        }
        Ok(replayed)
    }

    pub async fn send(
        &self,
        id: SessionId,
        room: &str,
        username: Option<&str>,
        text: &str,
    ) -> Result<ChatMessage, SessionError> {
        let handle = self.handle(id, username).await?;
        Ok(self.rooms.send(&handle, room, text).await?)
    }

    pub async fn typing(
        &self,
        id: SessionId,
        room: &str,
        is_typing: bool,
        username: Option<&str>,
    ) -> Result<(), SessionError> {
        let handle = self.handle(id, username).await?;
        Ok(self.rooms.typing(&handle, room, is_typing).await?)
    }

    /// Leave one room. The session returns to `Connected` after its last room.
    /// Leaving a room the session is not in is a no-op.
    pub async fn leave(&self, id: SessionId, room: &str) -> Result<(), SessionError> {
        if room.is_empty() {
            return Err(RoomError::InvalidRoom.into());
        }
        let handle = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(SessionError::Closed(id))?;
            if !session.rooms.remove(room) {
                log::debug!("Session {id} is not in room {room}; nothing to leave");
                return Ok(());
            }
            if session.rooms.is_empty() {
                session.state = SessionState::Connected;
            }
            session.handle()
        };
        Ok(self.rooms.leave(&handle, room).await?)
    }

    /// Close a session and clean up every room it joined.
    /// Returns false if it was already closed.
    pub async fn close(&self, id: SessionId) -> bool {
        let Some(mut session) = self.sessions.write().await.remove(&id) else {
            return false;
        };
        session.state = SessionState::Closed;
        let rooms: Vec<String> = std::mem::take(&mut session.rooms).into_iter().collect();
        self.rooms.leave_all(&session.handle(), &rooms).await;
        log::debug!("Session {id} closed ({} rooms cleaned up)", rooms.len());
        true
    }

    /// Unknown ids report `Closed`.
    pub async fn state(&self, id: SessionId) -> SessionState {
        self.sessions
            .read()
            .await
            .get(&id)
            .map_or(SessionState::Closed, |s| s.state)
    }

    pub async fn rooms_of(&self, id: SessionId) -> Vec<String> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn display_name(&self, id: SessionId) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&id)
            .and_then(|s| s.display_name.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
