//! In-process fan-out. Subscribers register against a pattern and optionally
//! a context object that routing conditions are evaluated against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use beacon_core::Message;

/// What a local subscriber listens for. Kept as a tagged variant so matching
/// is exhaustive instead of free-text comparison.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum SubscriberPattern {
    /// Every message.
    Wildcard,
    /// Exact message kind (type/category).
    Kind(String),
    /// Exact event name.
    Event(String),
}

impl SubscriberPattern {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Kind(kind) => &message.kind == kind,
            Self::Event(event) => &message.event == event,
        }
    }
}

/// Handlers run synchronously on the delivering task; a failing handler is
/// logged and the rest still run.
pub type SubscriberHandler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    context: Option<serde_json::Value>,
    handler: SubscriberHandler,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    patterns: RwLock<HashMap<SubscriberPattern, Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, pattern: SubscriberPattern, handler: SubscriberHandler) -> u64 {
        self.subscribe_with_context(pattern, None, handler)
    }

    pub fn subscribe_with_context(
        &self,
        pattern: SubscriberPattern,
        context: Option<serde_json::Value>,
        handler: SubscriberHandler,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.patterns
            .write()
            .entry(pattern)
            .or_default()
            .push(Subscriber {
                id,
                context,
                handler,
            });
        id
    }

    /// Returns false when no such subscription existed.
    pub fn unsubscribe(&self, pattern: &SubscriberPattern, id: u64) -> bool {
        let mut patterns = self.patterns.write();
        let Some(subscribers) = patterns.get_mut(pattern) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() < before;
        if subscribers.is_empty() {
            patterns.remove(pattern);
        }
        removed
    }

    /// Notify every matching subscriber whose context passes the message's
    /// conditions. Returns how many handlers ran.
    pub fn notify(&self, message: &Message) -> usize {
        // Snapshot matching handlers first so a handler can (un)subscribe
        // without deadlocking against this read lock.
        let matching: Vec<(Option<serde_json::Value>, SubscriberHandler)> = {
            let patterns = self.patterns.read();
            patterns
                .iter()
                .filter(|(pattern, _)| pattern.matches(message))
                .flat_map(|(_, subscribers)| subscribers.iter())
                .map(|s| (s.context.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        let mut notified = 0;
        for (context, handler) in matching {
            if !message.routing.conditions_match(context.as_ref()) {
                continue;
            }
            if let Err(e) = handler(message) {
                tracing::warn!(message_id = %message.id, error = %e, "subscriber handler failed");
            }
            notified += 1;
        }
        notified
    }

    pub fn subscriber_count(&self) -> usize {
        self.patterns.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{Condition, ConditionOp, MessageDraft, Routing};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> SubscriberHandler {
        Arc::new(move |_message| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn message(kind: &str, event: &str) -> Message {
        MessageDraft::event(event, serde_json::Value::Null)
            .kind(kind)
            .resolve()
    }

    #[test]
    fn pattern_matching_is_exhaustive() {
        let msg = message("task", "task.update");
        assert!(SubscriberPattern::Wildcard.matches(&msg));
        assert!(SubscriberPattern::Kind("task".into()).matches(&msg));
        assert!(!SubscriberPattern::Kind("chat".into()).matches(&msg));
        assert!(SubscriberPattern::Event("task.update".into()).matches(&msg));
        assert!(!SubscriberPattern::Event("task.done".into()).matches(&msg));
    }

    #[test]
    fn notify_reaches_all_matching_patterns() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.subscribe(SubscriberPattern::Wildcard, counting_handler(count.clone()));
        registry.subscribe(
            SubscriberPattern::Kind("task".into()),
            counting_handler(count.clone()),
        );
        registry.subscribe(
            SubscriberPattern::Event("chat.sent".into()),
            counting_handler(count.clone()),
        );

        let notified = registry.notify(&message("task", "task.update"));
        assert_eq!(notified, 2);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn multiple_handlers_per_pattern() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.subscribe(SubscriberPattern::Wildcard, counting_handler(count.clone()));
        registry.subscribe(SubscriberPattern::Wildcard, counting_handler(count.clone()));

        assert_eq!(registry.notify(&message("task", "e")), 2);
    }

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.subscribe(
            SubscriberPattern::Wildcard,
            Arc::new(|_| anyhow::bail!("handler exploded")),
        );
        registry.subscribe(SubscriberPattern::Wildcard, counting_handler(count.clone()));

        let notified = registry.notify(&message("task", "e"));
        assert_eq!(notified, 2);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribe_removes_one_handler() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = registry.subscribe(SubscriberPattern::Wildcard, counting_handler(count.clone()));
        registry.subscribe(SubscriberPattern::Wildcard, counting_handler(count.clone()));

        assert!(registry.unsubscribe(&SubscriberPattern::Wildcard, id));
        assert!(!registry.unsubscribe(&SubscriberPattern::Wildcard, id));
        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(registry.notify(&message("task", "e")), 1);
    }

    #[test]
    fn conditions_filter_by_subscriber_context() {
        let registry = SubscriberRegistry::new();
        let ios = Arc::new(AtomicUsize::new(0));
        let web = Arc::new(AtomicUsize::new(0));
        registry.subscribe_with_context(
            SubscriberPattern::Wildcard,
            Some(json!({"platform": "ios"})),
            counting_handler(ios.clone()),
        );
        registry.subscribe_with_context(
            SubscriberPattern::Wildcard,
            Some(json!({"platform": "web"})),
            counting_handler(web.clone()),
        );

        let mut msg = message("task", "e");
        msg.routing = Routing {
            conditions: vec![Condition::new("platform", ConditionOp::Eq, json!("ios"))],
            ..Routing::default()
        };

        assert_eq!(registry.notify(&msg), 1);
        assert_eq!(ios.load(Ordering::Relaxed), 1);
        assert_eq!(web.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn handler_may_subscribe_reentrantly() {
        let registry = Arc::new(SubscriberRegistry::new());
        let inner = Arc::clone(&registry);
        registry.subscribe(
            SubscriberPattern::Wildcard,
            Arc::new(move |_| {
                inner.subscribe(SubscriberPattern::Wildcard, Arc::new(|_| Ok(())));
                Ok(())
            }),
        );

        registry.notify(&message("task", "e"));
        assert_eq!(registry.subscriber_count(), 2);
    }
}
