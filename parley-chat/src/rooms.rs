//! Room membership and local fan-out.
//!
//! Two layers:
//! - [`LocalRooms`]: this instance's table of room → local member outboxes.
//!   The fanout bridge delivers every backplane event through it.
//! - [`RoomRegistry`]: join/send/typing/leave orchestration over the
//!   history log, presence registry and fanout bridge.
//!
//! ```text
//! join ──► LocalRooms.add (pending) ──► Presence.join ──► History.recent
//!                 ──► LocalRooms.complete_join ──► outbox (history, then buffered events)
//!                                                       └──► Bridge.publish(userJoined)
//! send ──► History.append ──► Bridge.publish(message)
//!                                   │   (round trip through the store)
//!                                   ▼
//!                  every instance: LocalRooms.deliver ──► member outboxes
//! ```
//!
//! The publishing instance never delivers directly; its own members receive
//! events from the bridge like everyone else, which keeps delivery at exactly
//! once per session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::fanout::{FanoutBridge, FanoutError};
use crate::history::{HistoryError, HistoryLog, REPLAY_LIMIT};
use crate::presence::PresenceRegistry;
use crate::protocol::{
    ChatMessage, PeerNotice, RoomEvent, ServerEvent, SessionId, TypingNotice, DEFAULT_AUTHOR,
    DEFAULT_JOIN_NAME, DEFAULT_TYPING_NAME,
};
use crate::store::StoreError;

/// Bounded queue of events waiting to be written to one session's socket.
pub type Outbox = mpsc::Sender<ServerEvent>;

/// Room errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoomError {
    #[error("Room name must not be empty")]
    InvalidRoom,
    #[error("Message text must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

impl RoomError {
    /// Short code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::InvalidRoom => "invalidRoom",
            RoomError::EmptyMessage => "emptyMessage",
            RoomError::Store(_) | RoomError::History(_) | RoomError::Fanout(_) => "unavailable",
        }
    }
}

/// What the room layer needs to know about a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub display_name: Option<String>,
    pub outbox: Outbox,
}

impl SessionHandle {
    pub fn name_or(&self, default: &str) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}

/// Local delivery statistics.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub active_rooms: usize,
    pub local_members: usize,
}

/// Lock-free counters for the delivery hot path.
struct AtomicDeliveryStats {
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicDeliveryStats {
    fn new() -> Self {
        Self {
            events_delivered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }
}

/// One local member of a room.
///
/// While `pending` is `Some`, the member's history replay is still being
/// read and live events are buffered instead of queued.
struct Member {
    outbox: Outbox,
    pending: Mutex<Option<Vec<ServerEvent>>>,
}

impl Member {
    fn new(outbox: Outbox, pending: bool) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            pending: Mutex::new(pending.then(Vec::new)),
        })
    }
}

/// This instance's room membership table.
pub struct LocalRooms {
    rooms: RwLock<HashMap<String, HashMap<SessionId, Arc<Member>>>>,
    stats: AtomicDeliveryStats,
}

impl LocalRooms {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicDeliveryStats::new(),
        }
    }

    /// Register `session` in `room`. Returns false if it was already a member.
    pub async fn add_member(&self, room: &str, session: SessionId, outbox: Outbox) -> bool {
        self.insert(room, session, Member::new(outbox, false)).await
    }

    /// Register `session` in `room` with delivery held back until
    /// [`complete_join`](Self::complete_join).
    pub async fn add_pending_member(&self, room: &str, session: SessionId, outbox: Outbox) -> bool {
        self.insert(room, session, Member::new(outbox, true)).await
    }

    async fn insert(&self, room: &str, session: SessionId, member: Arc<Member>) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(session, member)
            .is_none()
    }

    /// Release a pending member: queue `history` (if any), then every event
    /// buffered since registration. Buffered messages already contained in
    /// `history` are skipped.
    pub async fn complete_join(
        &self,
        room: &str,
        session: SessionId,
        history: Option<Vec<ChatMessage>>,
    ) {
        let member = {
            let rooms = self.rooms.read().await;
            match rooms.get(room).and_then(|members| members.get(&session)) {
                Some(member) => member.clone(),
                None => return,
            }
        };

        let mut pending = member.pending.lock().await;
        let buffered = pending.take().unwrap_or_default();
        let replayed: HashSet<Uuid> = history
            .as_ref()
            .map(|h| h.iter().map(|m| m.id).collect())
            .unwrap_or_default();

        if let Some(history) = history {
            self.push(room, session, &member.outbox, ServerEvent::History(history));
        }
        for event in buffered {
            if let ServerEvent::Message(msg) = &event {
                if replayed.contains(&msg.id) {
                    log::debug!("Skipping live copy of replayed message {} for {session}", msg.id);
                    continue;
                }
            }
            self.push(room, session, &member.outbox, event);
        }
    }

    /// Unregister `session` from `room`, dropping the room once empty.
    pub async fn remove_member(&self, room: &str, session: SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&session).is_some();
        if members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    pub async fn is_member(&self, room: &str, session: SessionId) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .is_some_and(|members| members.contains_key(&session))
    }

    pub async fn members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Push `event` to every local member of `room` except `exclude`.
    ///
    /// A full outbox drops the event for that session only. Pending members
    /// buffer it. Returns the number of sessions the event was queued or
    /// buffered for.
    pub async fn deliver(
        &self,
        room: &str,
        event: &ServerEvent,
        exclude: Option<SessionId>,
    ) -> usize {
        let targets: Vec<(SessionId, Arc<Member>)> = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(members) => members
                    .iter()
                    .filter(|(id, _)| Some(**id) != exclude)
                    .map(|(id, member)| (*id, member.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, member) in targets {
            let mut pending = member.pending.lock().await;
            if let Some(buffer) = pending.as_mut() {
                buffer.push(event.clone());
                delivered += 1;
            } else if self.push(room, id, &member.outbox, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn push(&self, room: &str, session: SessionId, outbox: &Outbox, event: ServerEvent) -> bool {
        match outbox.try_send(event) {
            Ok(()) => {
                self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox full for session {session} in room {room}; event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Session {session} closed before delivery in room {room}");
                false
            }
        }
    }

    pub async fn stats(&self) -> DeliveryStats {
        let rooms = self.rooms.read().await;
        DeliveryStats {
            events_delivered: self.stats.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            local_members: rooms.values().map(|m| m.len()).sum(),
        }
    }
}

impl Default for LocalRooms {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_room(room: &str) -> Result<(), RoomError> {
    if room.is_empty() {
        Err(RoomError::InvalidRoom)
    } else {
        Ok(())
    }
}

/// Join/send/typing/leave over history, presence and the fanout bridge.
pub struct RoomRegistry {
    local: Arc<LocalRooms>,
    history: HistoryLog,
    presence: PresenceRegistry,
    bridge: Arc<FanoutBridge>,
    replay_limit: usize,
    cleanup_attempts: u32,
}

impl RoomRegistry {
    pub fn new(
        local: Arc<LocalRooms>,
        history: HistoryLog,
        presence: PresenceRegistry,
        bridge: Arc<FanoutBridge>,
    ) -> Self {
        Self {
            local,
            history,
            presence,
            bridge,
            replay_limit: REPLAY_LIMIT,
            cleanup_attempts: 3,
        }
    }

    pub fn with_replay_limit(mut self, limit: usize) -> Self {
        self.replay_limit = limit;
        self
    }

    pub fn with_cleanup_attempts(mut self, attempts: u32) -> Self {
        self.cleanup_attempts = attempts.max(1);
        self
    }

    pub fn local(&self) -> &Arc<LocalRooms> {
        &self.local
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Join `room`: local membership, presence, one-time history replay,
    /// then a `userJoined` notice. Returns the number of replayed messages.
    pub async fn join(&self, session: &SessionHandle, room: &str) -> Result<usize, RoomError> {
        validate_room(room)?;

        // Held back until the replay is queued, so live events never precede
        // or duplicate it.
        let newly_added = self
            .local
            .add_pending_member(room, session.id, session.outbox.clone())
            .await;
        if let Err(e) = self.presence.join(room, session.id).await {
            if newly_added {
                self.local.remove_member(room, session.id).await;
            } else {
                self.local.complete_join(room, session.id, None).await;
            }
            return Err(e.into());
        }

        let replayed = match self.history.recent(room, self.replay_limit).await {
            Ok(history) => {
                let count = history.len();
                self.local.complete_join(room, session.id, Some(history)).await;
                count
            }
            Err(e) => {
                log::warn!("History unavailable for room {room}, skipping replay: {e}");
                self.local.complete_join(room, session.id, None).await;
                0
            }
        };

        let notice = PeerNotice {
            id: session.id,
            username: session.name_or(DEFAULT_JOIN_NAME),
        };
        if let Err(e) = self.bridge.publish(room, RoomEvent::UserJoined(notice)).await {
            log::warn!("Failed to announce {} joining {room}: {e}", session.id);
        }

        log::info!("Session {} joined room {room} ({replayed} replayed)", session.id);
        Ok(replayed)
    }

    /// Persist and broadcast a message. Empty rooms or empty text are rejected.
    pub async fn send(
        &self,
        session: &SessionHandle,
        room: &str,
        text: &str,
    ) -> Result<ChatMessage, RoomError> {
        validate_room(room)?;
        if text.is_empty() {
            return Err(RoomError::EmptyMessage);
        }

        let message = ChatMessage::new(room, session.name_or(DEFAULT_AUTHOR), text);
        self.history.append(room, &message).await?;
        self.bridge
            .publish(room, RoomEvent::Message(message.clone()))
            .await?;

        log::debug!("Session {} sent {} to room {room}", session.id, message.id);
        Ok(message)
    }

    /// Broadcast a typing signal to everyone in `room` except the sender.
    pub async fn typing(
        &self,
        session: &SessionHandle,
        room: &str,
        is_typing: bool,
    ) -> Result<(), RoomError> {
        validate_room(room)?;
        let notice = TypingNotice {
            username: session.name_or(DEFAULT_TYPING_NAME),
            is_typing,
        };
        self.bridge
            .publish_excluding(room, RoomEvent::Typing(notice), session.id)
            .await?;
        Ok(())
    }

    /// Leave one room explicitly. Leaving a room the session is not in does
    /// nothing.
    pub async fn leave(&self, session: &SessionHandle, room: &str) -> Result<(), RoomError> {
        validate_room(room)?;
        if !self.local.remove_member(room, session.id).await {
            log::debug!("Session {} left room {room} it had not joined", session.id);
            return Ok(());
        }
        self.presence.leave(room, session.id).await?;
        self.announce_leave(session, room).await;
        log::info!("Session {} left room {room}", session.id);
        Ok(())
    }

    /// Disconnect cleanup for every room `session` had joined.
    ///
    /// Local membership is always removed. Presence removal is retried;
    /// failures are logged, never returned.
    pub async fn leave_all(&self, session: &SessionHandle, rooms: &[String]) {
        for room in rooms {
            self.local.remove_member(room, session.id).await;
            if let Err(e) = self
                .presence
                .leave_with_retry(room, session.id, self.cleanup_attempts)
                .await
            {
                log::warn!(
                    "Presence cleanup for session {} in room {room} failed, entry may be stale: {e}",
                    session.id
                );
            }
            self.announce_leave(session, room).await;
        }
    }

    async fn announce_leave(&self, session: &SessionHandle, room: &str) {
        let notice = PeerNotice {
            id: session.id,
            username: session.name_or(DEFAULT_JOIN_NAME),
        };
        if let Err(e) = self.bridge.publish(room, RoomEvent::UserLeft(notice)).await {
            log::debug!("Failed to announce {} leaving {room}: {e}", session.id);
        }
    }
}
