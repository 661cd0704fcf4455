//! Redis-backed shared store.
//!
//! Commands go through one multiplexed connection, which keeps publishes
//! from this instance in order. Each subscription opens its own pub/sub
//! connection and forwards payloads into a [`Subscription`] channel.

use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use tokio::sync::mpsc;

use super::{SharedStore, StoreError, Subscription, SUBSCRIPTION_BUFFER};

/// Redis-backed [`SharedStore`].
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    ///
    /// Fails with `StoreError::Connection` if the server can't be reached
    /// within `op_timeout`.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = tokio::time::timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Connection(format!("timed out connecting to {url}")))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        log::info!("Connected to Redis at {url}");
        Ok(Self {
            client,
            conn,
            op_timeout,
        })
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }
}

/// Run one command under the configured timeout.
async fn bounded<T, F>(op_timeout: Duration, command: &str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(op_timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StoreError::Unavailable(format!("{command}: {e}"))),
        Err(_) => Err(StoreError::Unavailable(format!(
            "{command}: timed out after {op_timeout:?}"
        ))),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "LPUSH", conn.lpush::<_, _, ()>(key, value)).await
    }

    async fn list_trim(&self, key: &str, start: isize, end: isize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "LTRIM", conn.ltrim::<_, ()>(key, start, end)).await
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "LRANGE", conn.lrange::<_, Vec<String>>(key, start, end)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "SADD", conn.sadd::<_, _, ()>(key, member)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "SREM", conn.srem::<_, _, ()>(key, member)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "SMEMBERS", conn.smembers::<_, Vec<String>>(key)).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.op_timeout, "PUBLISH", conn.publish::<_, _, ()>(channel, payload)).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = bounded(self.op_timeout, "SUBSCRIBE", self.client.get_async_pubsub()).await?;
        bounded(self.op_timeout, "SUBSCRIBE", pubsub.subscribe(channel)).await?;
        log::info!("Subscribed to Redis channel {channel}");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Unreadable payload on {channel}: {e}");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            log::warn!("Redis subscription on {channel} ended");
        });
        Ok(rx)
    }
}
