//! # parley-chat: Room-scoped realtime chat over a shared store
//!
//! Any number of server instances share one store (Redis in production).
//! The store holds each room's bounded history and presence set and carries
//! a pub/sub channel that fans every room event out to all instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket/JSON   ┌──────────────┐        ┌──────────────┐
//! │ ChatClient  │ ◄────────────────► │ ChatServer A │        │ ChatServer B │
//! └─────────────┘                    └──────┬───────┘        └──────┬───────┘
//!                                           │                       │
//!                                           ▼                       ▼
//!                                 ┌───────────────────────────────────────┐
//!                                 │ SharedStore                           │
//!                                 │  chat:{room}    bounded history list  │
//!                                 │  online:{room}  presence set          │
//!                                 │  parley:events  fanout channel        │
//!                                 └───────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON client events and bincode backplane frames
//! - [`store`]: `SharedStore` trait with Redis and in-memory backends
//! - [`history`]: Per-room bounded message log
//! - [`presence`]: Per-room online session sets
//! - [`fanout`]: Cross-instance event delivery
//! - [`rooms`]: Join/send/typing/leave orchestration and local delivery
//! - [`session`]: Per-connection state machine
//! - [`server`]: WebSocket gateway
//! - [`client`]: WebSocket client

pub mod protocol;
pub mod store;
pub mod history;
pub mod presence;
pub mod fanout;
pub mod rooms;
pub mod session;
pub mod config;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    BridgeFrame, ChatMessage, ClientEvent, JoinRequest, PeerNotice, ProtocolError, RoomEvent,
    ServerEvent, SessionId, TypingNotice,
};
pub use store::{MemoryStore, RedisStore, SharedStore, StoreError};
pub use history::{HistoryError, HistoryLog, HISTORY_CAPACITY, REPLAY_LIMIT};
pub use presence::PresenceRegistry;
pub use fanout::{FanoutBridge, FanoutError, FanoutStats};
pub use rooms::{DeliveryStats, LocalRooms, RoomError, RoomRegistry, SessionHandle};
pub use session::{SessionError, SessionManager, SessionState};
pub use config::ServerConfig;
pub use server::{ChatServer, ServerError, ServerStats};
pub use client::{ChatClient, ChatEvent, ClientError, ConnectionState};
