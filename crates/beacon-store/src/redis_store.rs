//! Redis-backed [`SharedStore`] for clustered deployments. One multiplexed
//! connection serves commands; each pattern subscription gets its own pub/sub
//! connection drained by a forwarding task.

use std::time::Duration;

use futures::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::{ChannelMessage, SharedStore};

const SUBSCRIPTION_BUFFER: usize = 256;
// A store outage must surface as an error on the individual call, never hang
// a sweep loop.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT);
        let manager = client
            .get_connection_manager_with_config(config)
            .await?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry; clamp up to the smallest it accepts.
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe_by_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "dropping unreadable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(ChannelMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            tracing::debug!(pattern = %pattern, "pub/sub subscription closed");
        });

        Ok(rx)
    }
}
