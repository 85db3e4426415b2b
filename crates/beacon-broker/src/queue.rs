//! Retry bookkeeping for guaranteed messages. Deadlines are lazy: nothing
//! fires per-message timers, the sweep just asks what is due.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use beacon_core::ids::MessageId;
use beacon_core::Message;

/// A guaranteed message waiting for (re)delivery. `attempts` counts delivery
/// attempts already made; the first backoff scheduling therefore sees 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message: Message,
    pub attempts: u32,
    pub next_retry: DateTime<Utc>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Fresh entry, due immediately.
    pub fn new(message: Message) -> Self {
        let now = Utc::now();
        Self {
            message,
            attempts: 0,
            next_retry: now,
            last_error: None,
            enqueued_at: now,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.message.delivery.retry_policy.max_attempts
    }
}

/// Coarsely locked in-memory queue. Contention is bounded by sweep frequency
/// and publish rate of guaranteed messages, not overall message volume.
#[derive(Default)]
pub struct MessageQueue {
    messages: Mutex<HashMap<MessageId, QueuedMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, queued: QueuedMessage) {
        self.messages
            .lock()
            .insert(queued.message.id.clone(), queued);
    }

    pub fn remove(&self, id: &MessageId) -> Option<QueuedMessage> {
        self.messages.lock().remove(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<QueuedMessage> {
        self.messages.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Entries due at `now`, highest priority first, earliest deadline
    /// breaking ties.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        let messages = self.messages.lock();
        let mut due: Vec<QueuedMessage> = messages
            .values()
            .filter(|m| m.next_retry <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then(a.next_retry.cmp(&b.next_retry))
        });
        due
    }

    /// Record a failed attempt and push the deadline out per the message's
    /// retry policy. Returns the updated entry, or None when the message was
    /// removed concurrently.
    pub fn reschedule(
        &self,
        id: &MessageId,
        now: DateTime<Utc>,
        error: String,
    ) -> Option<QueuedMessage> {
        let mut messages = self.messages.lock();
        let entry = messages.get_mut(id)?;
        entry.attempts += 1;
        let delay = entry.message.delivery.retry_policy.delay_for(entry.attempts);
        entry.next_retry = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        entry.last_error = Some(error);
        Some(entry.clone())
    }

    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.messages.lock().values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn force_due(&self, id: &MessageId) {
        if let Some(entry) = self.messages.lock().get_mut(id) {
            entry.next_retry = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{BackoffStrategy, MessageDraft, Priority, RetryPolicy};

    fn queued(priority: Priority) -> QueuedMessage {
        QueuedMessage::new(
            MessageDraft::event("e", serde_json::Value::Null)
                .priority(priority)
                .guaranteed()
                .resolve(),
        )
    }

    #[test]
    fn new_entries_are_due_immediately() {
        let queue = MessageQueue::new();
        let entry = queued(Priority::Normal);
        let id = entry.message.id.clone();
        queue.insert(entry);

        let due = queue.due(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.id, id);
        assert_eq!(due[0].attempts, 0);
    }

    #[test]
    fn due_orders_by_priority_then_deadline() {
        let queue = MessageQueue::new();
        let low = queued(Priority::Low);
        let urgent = queued(Priority::Urgent);
        let normal = queued(Priority::Normal);
        let expected = vec![
            urgent.message.id.clone(),
            normal.message.id.clone(),
            low.message.id.clone(),
        ];
        queue.insert(low);
        queue.insert(urgent);
        queue.insert(normal);

        let order: Vec<MessageId> = queue
            .due(Utc::now())
            .into_iter()
            .map(|m| m.message.id)
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn rescheduled_entries_leave_the_due_set() {
        let queue = MessageQueue::new();
        let entry = queued(Priority::Normal);
        let id = entry.message.id.clone();
        queue.insert(entry);

        let now = Utc::now();
        let updated = queue.reschedule(&id, now, "boom".into()).unwrap();
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
        assert!(updated.next_retry > now);
        assert!(queue.due(now).is_empty());
    }

    #[test]
    fn reschedule_follows_backoff_schedule() {
        let queue = MessageQueue::new();
        let mut message = MessageDraft::event("e", serde_json::Value::Null)
            .guaranteed()
            .resolve();
        message.delivery.retry_policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        };
        let id = message.id.clone();
        queue.insert(QueuedMessage::new(message));

        let now = Utc::now();
        let first = queue.reschedule(&id, now, "e1".into()).unwrap();
        assert_eq!(first.next_retry, now + chrono::Duration::milliseconds(1_000));

        let second = queue.reschedule(&id, now, "e2".into()).unwrap();
        assert_eq!(second.next_retry, now + chrono::Duration::milliseconds(2_000));
    }

    #[test]
    fn exhaustion_tracks_policy_max() {
        let queue = MessageQueue::new();
        let entry = queued(Priority::Normal);
        let id = entry.message.id.clone();
        let max = entry.message.delivery.retry_policy.max_attempts;
        queue.insert(entry);

        for _ in 0..max {
            queue.reschedule(&id, Utc::now(), "err".into());
        }
        assert!(queue.get(&id).unwrap().attempts_exhausted());
    }

    #[test]
    fn reschedule_missing_message_is_none() {
        let queue = MessageQueue::new();
        assert!(queue
            .reschedule(&MessageId::new(), Utc::now(), "e".into())
            .is_none());
    }

    #[test]
    fn queued_message_serde_roundtrip() {
        let entry = queued(Priority::High);
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: QueuedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message.id, entry.message.id);
        assert_eq!(parsed.attempts, 0);
        assert_eq!(parsed.next_retry, entry.next_retry);
    }
}
