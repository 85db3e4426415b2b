use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};
use crate::routing::Routing;

/// Message priority. Only orders the retry sweep and colors logs; delivery is
/// never preempted by it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Retry schedule for guaranteed messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts made so
    /// far (starts at 1 on first scheduling). Clamped to `max_delay_ms`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let ms = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(attempts)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Delivery contract attached to every message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Queue and retry until delivered, permanently failed, or expired.
    pub guaranteed: bool,
    /// Mirror the queued message to the shared store so it survives restarts.
    /// Only meaningful together with `guaranteed`.
    pub persistent: bool,
    /// Maximum lifetime in the queue.
    pub ttl_ms: Option<u64>,
    pub retry_policy: RetryPolicy,
    /// Reserved for receipt tracking; carried but inert.
    pub acknowledgment: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            guaranteed: false,
            persistent: false,
            ttl_ms: None,
            retry_policy: RetryPolicy::default(),
            acknowledgment: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    #[default]
    System,
    Service,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub kind: SenderKind,
}

impl Sender {
    pub fn system() -> Self {
        Self {
            id: "system".into(),
            kind: SenderKind::System,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SenderKind::User,
        }
    }
}

/// A fully-resolved unit of delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Type/category; also selects the cross-instance channel.
    pub kind: String,
    /// Free-form event name handed to the transport.
    pub event: String,
    pub payload: serde_json::Value,
    pub sender: Sender,
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub routing: Routing,
    pub delivery: DeliveryOptions,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether the message's queue lifetime has elapsed at `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.delivery.ttl_ms {
            Some(ttl_ms) => {
                let deadline = self.created_at + chrono::Duration::milliseconds(ttl_ms as i64);
                now >= deadline
            }
            None => false,
        }
    }
}

/// Caller-supplied subset of a message. `MessageBroker::publish` resolves it
/// into a full [`Message`], filling id, timestamp, and defaults.
#[derive(Clone, Debug, Default)]
pub struct MessageDraft {
    pub kind: Option<String>,
    pub event: String,
    pub payload: serde_json::Value,
    pub sender: Option<Sender>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub routing: Option<Routing>,
    pub delivery: Option<DeliveryOptions>,
}

impl MessageDraft {
    pub fn event(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn from_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn guaranteed(mut self) -> Self {
        self.delivery.get_or_insert_with(DeliveryOptions::default).guaranteed = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        let delivery = self.delivery.get_or_insert_with(DeliveryOptions::default);
        delivery.guaranteed = true;
        delivery.persistent = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.delivery.get_or_insert_with(DeliveryOptions::default).ttl_ms =
            Some(ttl.as_millis() as u64);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.delivery.get_or_insert_with(DeliveryOptions::default).retry_policy = policy;
        self
    }

    /// Resolve into a fully-specified message.
    pub fn resolve(self) -> Message {
        Message {
            id: MessageId::new(),
            kind: self.kind.unwrap_or_else(|| "event".into()),
            event: self.event,
            payload: self.payload,
            sender: self.sender.unwrap_or_else(Sender::system),
            priority: self.priority.unwrap_or_default(),
            tags: self.tags,
            session_id: self.session_id,
            correlation_id: self.correlation_id,
            routing: self.routing.unwrap_or_default(),
            delivery: self.delivery.unwrap_or_default(),
            created_at: Utc::now(),
        }
    }
}
