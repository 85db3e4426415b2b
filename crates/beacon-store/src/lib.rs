//! Adapter for the shared external store: a key-value server with expiring
//! keys, sets, prefix scans, and publish/subscribe. The core consumes this
//! surface and nothing more; [`MemoryStore`] backs tests and single-node
//! deployments, [`RedisStore`] backs production clusters.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// A message received on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// The store operations this core depends on. All reads may observe state
/// written concurrently by sibling instances and must be treated as possibly
/// stale.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// `Ok(None)` when the key does not exist; `Err(Unavailable)` when the
    /// store could not be asked.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Members of a set; empty when the set does not exist.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Reset a key's time-to-live.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to every channel matching `pattern` (exact name, or a
    /// trailing `*` glob). Messages arrive on the returned receiver until it
    /// is dropped.
    async fn subscribe_by_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, StoreError>;
}

/// Channel-pattern match: exact, or prefix when the pattern ends in `*`.
/// This is the only pattern shape the core uses.
pub(crate) fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
