//! Cross-instance fanout over the shared store's pub/sub channel.
//!
//! Every instance subscribes to one channel. Publishing a room event sends a
//! [`BridgeFrame`] to the channel; every subscribed instance (the publisher
//! included) decodes it and delivers to its local members of that room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{BridgeFrame, ProtocolError, RoomEvent, ServerEvent, SessionId};
use crate::rooms::LocalRooms;
use crate::store::{SharedStore, StoreError, Subscription};

/// Default backplane channel name.
pub const DEFAULT_CHANNEL: &str = "parley:events";

const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Fanout errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FanoutError {
    #[error("Fanout publish failed: {0}")]
    Publish(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Bridge statistics.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub frames_published: u64,
    pub frames_received: u64,
    pub frames_undecodable: u64,
}

struct AtomicFanoutStats {
    frames_published: AtomicU64,
    frames_received: AtomicU64,
    frames_undecodable: AtomicU64,
}

/// Publishes room events to the backplane and delivers received ones locally.
pub struct FanoutBridge {
    store: Arc<dyn SharedStore>,
    channel: String,
    instance_id: Uuid,
    local: Arc<LocalRooms>,
    stats: AtomicFanoutStats,
}

impl FanoutBridge {
    pub fn new(store: Arc<dyn SharedStore>, channel: impl Into<String>, local: Arc<LocalRooms>) -> Self {
        Self {
            store,
            channel: channel.into(),
            instance_id: Uuid::new_v4(),
            local,
            stats: AtomicFanoutStats {
                frames_published: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                frames_undecodable: AtomicU64::new(0),
            },
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe to the channel and spawn the receive loop.
    ///
    /// The first subscription must succeed; later drops are resubscribed
    /// with backoff.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, StoreError> {
        let subscription = self.store.subscribe(&self.channel).await?;
        log::info!(
            "Fanout bridge {} listening on {}",
            self.instance_id,
            self.channel
        );
        let bridge = Arc::clone(self);
        Ok(tokio::spawn(bridge.run(subscription)))
    }

    async fn run(self: Arc<Self>, mut subscription: Subscription) {
        loop {
            while let Some(payload) = subscription.recv().await {
                self.dispatch(&payload).await;
            }

            log::warn!("Fanout subscription on {} closed; resubscribing", self.channel);
            let mut delay = RESUBSCRIBE_BASE_DELAY;
            subscription = loop {
                tokio::time::sleep(delay).await;
                match self.store.subscribe(&self.channel).await {
                    Ok(sub) => {
                        log::info!("Fanout resubscribed to {}", self.channel);
                        break sub;
                    }
                    Err(e) => {
                        log::warn!("Resubscribe to {} failed: {e}", self.channel);
                        delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                    }
                }
            };
        }
    }

    /// Decode one backplane payload and deliver it to local members.
    /// Returns the number of local sessions it reached.
    pub async fn dispatch(&self, payload: &[u8]) -> usize {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = match BridgeFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.frames_undecodable.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping undecodable fanout frame ({} bytes): {e}", payload.len());
                return 0;
            }
        };

        let event = ServerEvent::from(frame.event);
        self.local.deliver(&frame.room, &event, frame.exclude).await
    }

    pub async fn publish(&self, room: &str, event: RoomEvent) -> Result<(), FanoutError> {
        self.publish_frame(BridgeFrame::new(self.instance_id, room, event))
            .await
    }

    /// Publish `event` to every member of `room` except `exclude`.
    pub async fn publish_excluding(
        &self,
        room: &str,
        event: RoomEvent,
        exclude: SessionId,
    ) -> Result<(), FanoutError> {
        self.publish_frame(BridgeFrame::new(self.instance_id, room, event).excluding(exclude))
            .await
    }

    async fn publish_frame(&self, frame: BridgeFrame) -> Result<(), FanoutError> {
        let payload = frame.encode()?;
        self.store.publish(&self.channel, &payload).await?;
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_undecodable: self.stats.frames_undecodable.load(Ordering::Relaxed),
        }
    }
}
