//! In-memory [`SharedStore`] with native key expiry and pattern pub/sub.
//! Backs tests and single-instance deployments where no external store runs.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::{pattern_matches, ChannelMessage, SharedStore};

const SUBSCRIPTION_BUFFER: usize = 256;

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<DateTime<Utc>>,
}

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<ChannelMessage>,
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Entry>>,
    sets: Mutex<HashMap<String, SetEntry>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        expires_at.map_or(true, |deadline| now < deadline)
    }
}

#[async_trait::async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let mut values = self.values.lock();
        match values.get(key) {
            Some(entry) if Self::live(entry.expires_at, now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.values.lock().insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().remove(key);
        self.sets.lock().remove(key);
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.sets
            .lock()
            .entry(key.into())
            .or_insert_with(|| SetEntry {
                members: HashSet::new(),
                expires_at: None,
            })
            .members
            .insert(member.into());
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut sets = self.sets.lock();
        if let Some(entry) = sets.get_mut(key) {
            entry.members.remove(member);
            if entry.members.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut sets = self.sets.lock();
        match sets.get(key) {
            Some(entry) if Self::live(entry.expires_at, now) => {
                Ok(entry.members.iter().cloned().collect())
            }
            Some(_) => {
                sets.remove(key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if let Some(entry) = self.values.lock().get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        if let Some(entry) = self.sets.lock().get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut keys = Vec::new();
        {
            let mut values = self.values.lock();
            values.retain(|_, entry| Self::live(entry.expires_at, now));
            keys.extend(values.keys().filter(|k| k.starts_with(prefix)).cloned());
        }
        {
            let mut sets = self.sets.lock();
            sets.retain(|_, entry| Self::live(entry.expires_at, now));
            keys.extend(sets.keys().filter(|k| k.starts_with(prefix)).cloned());
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|sub| !sub.tx.is_closed());
        for sub in subscriptions.iter() {
            if pattern_matches(&sub.pattern, channel) {
                // A full buffer drops the message, matching the fire-and-forget
                // semantics of real pub/sub.
                let _ = sub.tx.try_send(ChannelMessage {
                    channel: channel.into(),
                    payload: payload.into(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe_by_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions.lock().push(Subscription {
            pattern: pattern.into(),
            tx,
        });
        Ok(rx)
    }
}
