//! Message broker: resolves drafts into messages, fans them out to the
//! transport, republishes across the cluster, and retries guaranteed
//! messages until delivered, permanently failed, or expired.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use beacon_core::ids::MessageId;
use beacon_core::{Message, MessageDraft, Routing, RoutingTarget, Transport};
use beacon_store::{keys, SharedStore};
use beacon_telemetry::MetricsRecorder;

use crate::error::BrokerError;
use crate::queue::{MessageQueue, QueuedMessage};
use crate::subscribers::{SubscriberHandler, SubscriberPattern, SubscriberRegistry};

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Identifies this process in cluster envelopes so it can skip its own
    /// republications.
    pub instance_id: String,
    /// How often the retry sweep runs.
    pub sweep_interval: Duration,
    /// Store TTL for persistent queue mirrors without an explicit message TTL.
    pub queue_mirror_ttl: Duration,
    /// Capacity of the local broker-event channel.
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("inst_{}", uuid::Uuid::now_v7()),
            sweep_interval: Duration::from_secs(1),
            queue_mirror_ttl: Duration::from_secs(24 * 60 * 60),
            event_capacity: 256,
        }
    }
}

/// Local lifecycle notifications for the surrounding application.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    Published { message_id: MessageId },
    Delivered { message_id: MessageId, attempts: u32 },
    /// Retry attempts exhausted; carries the last delivery error.
    Failed { message_id: MessageId, error: String },
    /// Queue TTL elapsed before delivery succeeded.
    Expired { message_id: MessageId },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub expired: usize,
}

/// Read-only snapshot for external monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrokerStats {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub queued: usize,
    pub avg_delivery_latency_ms: f64,
}

/// Wire shape republished on `messages:{kind}` so sibling instances can
/// deliver to connections they own.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ClusterEnvelope {
    origin: String,
    message: Message,
}

pub struct MessageBroker {
    store: Arc<dyn SharedStore>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsRecorder>,
    config: BrokerConfig,
    queue: MessageQueue,
    subscribers: SubscriberRegistry,
    events: broadcast::Sender<BrokerEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBroker {
    pub fn new(
        store: Arc<dyn SharedStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsRecorder>,
        config: BrokerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            store,
            transport,
            metrics,
            config,
            queue: MessageQueue::new(),
            subscribers: SubscriberRegistry::new(),
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a draft and either queue it (guaranteed) or deliver it now.
    /// A non-guaranteed message that fails is counted and the error is
    /// returned to the caller; it never enters the queue.
    #[instrument(skip(self, draft), fields(event = %draft.event))]
    pub async fn publish(&self, draft: MessageDraft) -> Result<MessageId, BrokerError> {
        let message = draft.resolve();
        let message_id = message.id.clone();

        self.metrics.counter_inc("broker.messages.sent", &[], 1);
        let _ = self.events.send(BrokerEvent::Published {
            message_id: message_id.clone(),
        });

        if message.delivery.guaranteed {
            self.enqueue(message).await;
            return Ok(message_id);
        }

        match self.deliver(&message, true).await {
            Ok(()) => {
                self.metrics.counter_inc("broker.messages.delivered", &[], 1);
                let _ = self.events.send(BrokerEvent::Delivered {
                    message_id: message_id.clone(),
                    attempts: 1,
                });
                Ok(message_id)
            }
            Err(e) => {
                self.metrics.counter_inc("broker.messages.failed", &[], 1);
                Err(e)
            }
        }
    }

    pub async fn publish_to_user(
        &self,
        user_id: &str,
        draft: MessageDraft,
    ) -> Result<MessageId, BrokerError> {
        self.publish(draft.routing(Routing::to_user(user_id))).await
    }

    pub async fn publish_to_role(
        &self,
        role: &str,
        draft: MessageDraft,
    ) -> Result<MessageId, BrokerError> {
        self.publish(draft.routing(Routing::to_role(role))).await
    }

    pub async fn publish_to_room(
        &self,
        room_id: &str,
        draft: MessageDraft,
    ) -> Result<MessageId, BrokerError> {
        self.publish(draft.routing(Routing::to_room(room_id))).await
    }

    pub async fn broadcast(&self, draft: MessageDraft) -> Result<MessageId, BrokerError> {
        self.publish(draft.routing(Routing::to_all())).await
    }

    pub fn subscribe(&self, pattern: SubscriberPattern, handler: SubscriberHandler) -> u64 {
        self.subscribers.subscribe(pattern, handler)
    }

    pub fn subscribe_with_context(
        &self,
        pattern: SubscriberPattern,
        context: serde_json::Value,
        handler: SubscriberHandler,
    ) -> u64 {
        self.subscribers
            .subscribe_with_context(pattern, Some(context), handler)
    }

    pub fn unsubscribe(&self, pattern: &SubscriberPattern, id: u64) -> bool {
        self.subscribers.unsubscribe(pattern, id)
    }

    /// Local lifecycle notifications (published / delivered / failed /
    /// expired).
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// One pass over the due queue. The periodic sweep, the shutdown drain,
    /// and tests all come through here. A failure on one message never
    /// aborts the rest of the pass.
    pub async fn sweep_queue_once(&self) -> SweepStats {
        let now = Utc::now();
        let due = self.queue.due(now);
        let mut stats = SweepStats::default();

        for queued in due {
            let message_id = queued.message.id.clone();

            if queued.message.expired_at(now) {
                self.queue.remove(&message_id);
                self.drop_mirror(&queued.message).await;
                self.metrics.counter_inc("broker.messages.expired", &[], 1);
                let _ = self.events.send(BrokerEvent::Expired {
                    message_id: message_id.clone(),
                });
                tracing::warn!(message_id = %message_id, "queued message expired before delivery");
                stats.expired += 1;
                continue;
            }

            match self.deliver(&queued.message, true).await {
                Ok(()) => {
                    self.queue.remove(&message_id);
                    self.drop_mirror(&queued.message).await;
                    self.metrics.counter_inc("broker.messages.delivered", &[], 1);
                    let _ = self.events.send(BrokerEvent::Delivered {
                        message_id,
                        attempts: queued.attempts + 1,
                    });
                    stats.delivered += 1;
                }
                Err(e) => {
                    let error = e.to_string();
                    let attempts_made = queued.attempts + 1;
                    if attempts_made >= queued.message.delivery.retry_policy.max_attempts {
                        self.queue.remove(&message_id);
                        self.drop_mirror(&queued.message).await;
                        self.metrics.counter_inc("broker.messages.failed", &[], 1);
                        tracing::error!(
                            message_id = %message_id,
                            attempts = attempts_made,
                            error = %error,
                            "message permanently failed"
                        );
                        let _ = self.events.send(BrokerEvent::Failed { message_id, error });
                        stats.failed += 1;
                    } else if let Some(updated) =
                        self.queue.reschedule(&message_id, Utc::now(), error)
                    {
                        self.mirror_queued(&updated).await;
                        tracing::debug!(
                            message_id = %updated.message.id,
                            attempts = updated.attempts,
                            next_retry = %updated.next_retry,
                            "delivery rescheduled"
                        );
                        stats.rescheduled += 1;
                    }
                }
            }
        }

        self.metrics
            .gauge_set("broker.queue.depth", &[], self.queue.len() as i64);
        stats
    }

    /// Reload persistent queue mirrors written before a restart. Runs once
    /// at start; already-queued ids are left untouched.
    pub async fn restore_queue(&self) -> Result<usize, BrokerError> {
        let mirror_keys = self.store.keys_by_prefix(keys::QUEUED_PREFIX).await?;
        let mut restored = 0;
        for key in mirror_keys {
            match self.store.get(&key).await {
                Ok(Some(json)) => match serde_json::from_str::<QueuedMessage>(&json) {
                    Ok(queued) => {
                        if !self.queue.contains(&queued.message.id) {
                            self.queue.insert(queued);
                            restored += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping unparsable queue mirror");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to read queue mirror");
                }
            }
        }
        if restored > 0 {
            self.metrics
                .gauge_set("broker.queue.depth", &[], self.queue.len() as i64);
            tracing::info!(restored = restored, "restored persistent queue");
        }
        Ok(restored)
    }

    /// Spawn the retry sweep and the cluster listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let broker = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = broker.restore_queue().await {
                tracing::warn!(error = %e, "queue restoration failed");
            }
            let mut ticker = tokio::time::interval(broker.config.sweep_interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        broker.sweep_queue_once().await;
                    }
                    () = broker.cancel.cancelled() => break,
                }
            }
        }));

        let broker = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut rx = match broker
                .store
                .subscribe_by_pattern(&keys::message_channel_pattern())
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(error = %e, "failed to subscribe to message channels");
                    return;
                }
            };
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => broker.handle_cluster_message(&msg.payload).await,
                        None => break,
                    },
                    () = broker.cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Stop background tasks, then drain the queue with one final sweep so
    /// messages about to succeed are not lost.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.sweep_queue_once().await;
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sent: self.metrics.counter_get("broker.messages.sent", &[]),
            delivered: self.metrics.counter_get("broker.messages.delivered", &[]),
            failed: self.metrics.counter_get("broker.messages.failed", &[]),
            expired: self.metrics.counter_get("broker.messages.expired", &[]),
            queued: self.queue.len(),
            avg_delivery_latency_ms: self
                .metrics
                .histogram_summary("broker.delivery.latency_ms", &[])
                .mean,
        }
    }

    /// Fan a message out: local pattern subscribers first, then one
    /// transport call per routing target, then (unless the message arrived
    /// from a sibling) republication on the cluster channel. A failing
    /// target is recorded and the remaining targets still run; the error
    /// returned covers the whole set so guaranteed retries re-attempt every
    /// target.
    async fn deliver(&self, message: &Message, republish: bool) -> Result<(), BrokerError> {
        let started = Instant::now();
        self.subscribers.notify(message);

        let all = RoutingTarget::All;
        let mut targets: Vec<&RoutingTarget> = message.routing.targets.iter().collect();
        if message.routing.broadcast && !message.routing.targets.contains(&all) {
            targets.push(&all);
        }

        let mut failed: Vec<String> = Vec::new();
        for target in targets {
            if message.routing.exclude_sender {
                if let RoutingTarget::User { id } = target {
                    if *id == message.sender.id {
                        continue;
                    }
                }
            }
            let result = match target {
                RoutingTarget::User { id } => {
                    self.transport
                        .send_to_user(id, &message.event, &message.payload)
                        .await
                }
                RoutingTarget::Role { role } => {
                    self.transport
                        .send_to_role(role, &message.event, &message.payload)
                        .await
                }
                RoutingTarget::Room { id } => {
                    self.transport
                        .send_to_room(id, &message.event, &message.payload)
                        .await
                }
                RoutingTarget::All => {
                    self.transport
                        .send_to_all(&message.event, &message.payload)
                        .await
                }
            };
            if let Err(e) = result {
                tracing::warn!(
                    message_id = %message.id,
                    target = %target.describe(),
                    error = %e,
                    "target delivery failed"
                );
                failed.push(format!("{}: {e}", target.describe()));
            }
        }

        if republish {
            self.republish(message).await;
        }

        self.metrics.histogram_observe(
            "broker.delivery.latency_ms",
            &[],
            started.elapsed().as_secs_f64() * 1_000.0,
        );

        if failed.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Delivery {
                message_id: message.id.clone(),
                failed,
            })
        }
    }

    async fn enqueue(&self, message: Message) {
        let queued = QueuedMessage::new(message);
        self.mirror_queued(&queued).await;
        tracing::debug!(message_id = %queued.message.id, "message queued for guaranteed delivery");
        self.queue.insert(queued);
        self.metrics.counter_inc("broker.messages.queued", &[], 1);
        self.metrics
            .gauge_set("broker.queue.depth", &[], self.queue.len() as i64);
    }

    /// Cross-instance republication. Advisory: the local fan-out already
    /// happened, so a publish failure is logged, not returned.
    async fn republish(&self, message: &Message) {
        let envelope = ClusterEnvelope {
            origin: self.config.instance_id.clone(),
            message: message.clone(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "failed to encode cluster envelope");
                return;
            }
        };
        if let Err(e) = self
            .store
            .publish(&keys::message_channel(&message.kind), &payload)
            .await
        {
            tracing::warn!(message_id = %message.id, error = %e, "cluster republication failed");
        }
    }

    /// Deliver a sibling's message to local subscribers and connections.
    /// Best-effort: the origin instance owns the retry queue, so a local
    /// failure here is logged and dropped rather than double-queued.
    async fn handle_cluster_message(&self, payload: &str) {
        let envelope: ClusterEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparsable cluster envelope");
                return;
            }
        };
        if envelope.origin == self.config.instance_id {
            return;
        }
        self.metrics.counter_inc("broker.cluster.received", &[], 1);
        if let Err(e) = self.deliver(&envelope.message, false).await {
            tracing::warn!(
                message_id = %envelope.message.id,
                origin = %envelope.origin,
                error = %e,
                "cluster-received delivery failed locally"
            );
        }
    }

    async fn mirror_queued(&self, queued: &QueuedMessage) {
        if !queued.message.delivery.persistent {
            return;
        }
        let ttl = queued
            .message
            .delivery
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.queue_mirror_ttl);
        match serde_json::to_string(queued) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .set_with_ttl(&keys::queued_message(&queued.message.id), &json, ttl)
                    .await
                {
                    tracing::warn!(message_id = %queued.message.id, error = %e, "failed to mirror queued message");
                }
            }
            Err(e) => {
                tracing::warn!(message_id = %queued.message.id, error = %e, "failed to encode queued message");
            }
        }
    }

    async fn drop_mirror(&self, message: &Message) {
        if !message.delivery.persistent {
            return;
        }
        if let Err(e) = self.store.delete(&keys::queued_message(&message.id)).await {
            tracing::warn!(message_id = %message.id, error = %e, "failed to delete queue mirror");
        }
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &MessageQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::mock::{MockOutcome, MockTransport};
    use beacon_core::{BackoffStrategy, RetryPolicy, Sender};
    use beacon_store::MemoryStore;
    use serde_json::json;

    fn broker_with(
        store: Arc<dyn SharedStore>,
        transport: Arc<dyn Transport>,
        config: BrokerConfig,
    ) -> Arc<MessageBroker> {
        Arc::new(MessageBroker::new(
            store,
            transport,
            Arc::new(MetricsRecorder::new()),
            config,
        ))
    }

    fn broker(transport: Arc<dyn Transport>) -> Arc<MessageBroker> {
        broker_with(
            Arc::new(MemoryStore::new()),
            transport,
            BrokerConfig::default(),
        )
    }

    fn exponential_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }

    fn user_draft(user: &str) -> MessageDraft {
        MessageDraft::event("task.update", json!({"step": 1})).routing(Routing::to_user(user))
    }

    #[tokio::test]
    async fn best_effort_delivers_immediately() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone());

        broker.publish(user_draft("alice")).await.unwrap();

        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.calls()[0].target, "user:alice");
        assert!(broker.queue().is_empty());
        let stats = broker.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn best_effort_failure_never_queues() {
        let transport = Arc::new(MockTransport::failing_times(1));
        let broker = broker(transport.clone());

        let result = broker.publish(user_draft("alice")).await;
        assert!(matches!(result, Err(BrokerError::Delivery { .. })));
        assert!(broker.queue().is_empty());

        let stats = broker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn guaranteed_publish_queues_without_immediate_delivery() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone());

        let id = broker
            .publish(user_draft("alice").guaranteed())
            .await
            .unwrap();

        assert_eq!(transport.call_count(), 0);
        assert!(broker.queue().contains(&id));
        assert_eq!(broker.stats().queued, 1);
    }

    #[tokio::test]
    async fn guaranteed_retry_follows_backoff_until_success() {
        let transport = Arc::new(MockTransport::failing_times(2));
        let broker = broker(transport.clone());

        let id = broker
            .publish(
                user_draft("alice")
                    .guaranteed()
                    .retry_policy(exponential_policy()),
            )
            .await
            .unwrap();

        // Attempt 1 fails; next retry >= 1s out.
        let before = Utc::now();
        let stats = broker.sweep_queue_once().await;
        assert_eq!(stats.rescheduled, 1);
        let queued = broker.queue().get(&id).unwrap();
        assert_eq!(queued.attempts, 1);
        assert!(queued.next_retry >= before + chrono::Duration::milliseconds(1_000));

        // Attempt 2 fails; next retry >= 2s out.
        broker.queue().force_due(&id);
        let before = Utc::now();
        let stats = broker.sweep_queue_once().await;
        assert_eq!(stats.rescheduled, 1);
        let queued = broker.queue().get(&id).unwrap();
        assert_eq!(queued.attempts, 2);
        assert!(queued.next_retry >= before + chrono::Duration::milliseconds(2_000));

        // Attempt 3 succeeds and the message leaves the queue.
        broker.queue().force_due(&id);
        let mut events = broker.events();
        let stats = broker.sweep_queue_once().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(transport.call_count(), 3);
        assert!(broker.queue().is_empty());

        match events.recv().await.unwrap() {
            BrokerEvent::Delivered {
                message_id,
                attempts,
            } => {
                assert_eq!(message_id, id);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_permanently_with_last_error() {
        let transport = Arc::new(MockTransport::always_failing());
        let broker = broker(transport.clone());

        let id = broker
            .publish(
                user_draft("alice")
                    .guaranteed()
                    .retry_policy(exponential_policy()),
            )
            .await
            .unwrap();

        broker.sweep_queue_once().await;
        broker.queue().force_due(&id);
        broker.sweep_queue_once().await;
        broker.queue().force_due(&id);

        let mut events = broker.events();
        let stats = broker.sweep_queue_once().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(transport.call_count(), 3);
        assert!(broker.queue().is_empty());
        assert_eq!(broker.stats().failed, 1);

        match events.recv().await.unwrap() {
            BrokerEvent::Failed { message_id, error } => {
                assert_eq!(message_id, id);
                assert!(error.contains("scripted failure"), "got: {error}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_fanout_failure_requeues_all_targets() {
        let transport = Arc::new(MockTransport::new());
        // First target (user) fails, second (room) succeeds.
        transport.push_script(vec![MockOutcome::Fail("user offline".into()), MockOutcome::Ok]);
        let broker = broker(transport.clone());

        let routing = Routing {
            targets: vec![
                RoutingTarget::User { id: "alice".into() },
                RoutingTarget::Room { id: "lobby".into() },
            ],
            ..Routing::default()
        };
        let id = broker
            .publish(
                MessageDraft::event("task.update", json!({}))
                    .routing(routing)
                    .guaranteed(),
            )
            .await
            .unwrap();

        broker.sweep_queue_once().await;

        // Both targets were attempted despite the user failure.
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].target, "user:alice");
        assert_eq!(calls[1].target, "room:lobby");

        // The whole message was requeued; the retry re-attempts every
        // target, so the room sees a duplicate. That duplicate is the
        // at-least-once trade-off, pinned here on purpose.
        assert!(broker.queue().contains(&id));
        broker.queue().force_due(&id);
        broker.sweep_queue_once().await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2].target, "user:alice");
        assert_eq!(calls[3].target, "room:lobby");
        assert!(broker.queue().is_empty());
    }

    #[tokio::test]
    async fn queue_ttl_expires_before_delivery() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone());

        let id = broker
            .publish(
                user_draft("alice")
                    .guaranteed()
                    .ttl(Duration::ZERO),
            )
            .await
            .unwrap();

        let mut events = broker.events();
        let stats = broker.sweep_queue_once().await;
        assert_eq!(stats.expired, 1);
        assert_eq!(transport.call_count(), 0);
        assert!(broker.queue().is_empty());

        match events.recv().await.unwrap() {
            BrokerEvent::Expired { message_id } => assert_eq!(message_id, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_isolates_per_message_failures() {
        let transport = Arc::new(MockTransport::new());
        // First due message fails, second succeeds.
        transport.push_script(vec![MockOutcome::Fail("boom".into()), MockOutcome::Ok]);
        let broker = broker(transport.clone());

        broker
            .publish(user_draft("alice").priority(beacon_core::Priority::Urgent).guaranteed())
            .await
            .unwrap();
        broker
            .publish(user_draft("bob").guaranteed())
            .await
            .unwrap();

        let stats = broker.sweep_queue_once().await;
        assert_eq!(stats.rescheduled, 1);
        assert_eq!(stats.delivered, 1);
        // Urgent swept first, so the failure hit alice and bob still went out.
        assert_eq!(transport.calls()[0].target, "user:alice");
        assert_eq!(transport.calls()[1].target, "user:bob");
    }

    #[tokio::test]
    async fn routing_wrappers_prefill_targets() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone());

        broker
            .publish_to_user("bob", MessageDraft::event("e", json!(1)))
            .await
            .unwrap();
        broker
            .publish_to_role("ops", MessageDraft::event("e", json!(2)))
            .await
            .unwrap();
        broker
            .publish_to_room("lobby", MessageDraft::event("e", json!(3)))
            .await
            .unwrap();
        broker
            .broadcast(MessageDraft::event("e", json!(4)))
            .await
            .unwrap();

        let targets: Vec<String> = transport.calls().into_iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["user:bob", "role:ops", "room:lobby", "all"]);
    }

    #[tokio::test]
    async fn exclude_sender_skips_matching_user_target() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone());

        let routing = Routing {
            targets: vec![
                RoutingTarget::User { id: "alice".into() },
                RoutingTarget::User { id: "bob".into() },
            ],
            exclude_sender: true,
            ..Routing::default()
        };
        broker
            .publish(
                MessageDraft::event("e", json!(1))
                    .from_sender(Sender::user("alice"))
                    .routing(routing),
            )
            .await
            .unwrap();

        let targets: Vec<String> = transport.calls().into_iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["user:bob"]);
    }

    #[tokio::test]
    async fn subscribers_notified_on_delivery() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport);

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broker.subscribe(
            SubscriberPattern::Event("task.update".into()),
            Arc::new(move |message| {
                sink.lock().push(message.event.clone());
                Ok(())
            }),
        );

        broker.publish(user_draft("alice")).await.unwrap();
        assert_eq!(*seen.lock(), vec!["task.update"]);
    }

    #[tokio::test]
    async fn republishes_to_cluster_channel() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockTransport::new());
        let broker = broker_with(store.clone(), transport, BrokerConfig::default());

        let mut rx = store.subscribe_by_pattern("messages:*").await.unwrap();
        broker
            .publish(user_draft("alice").kind("task"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "messages:task");
        let envelope: serde_json::Value = serde_json::from_str(&received.payload).unwrap();
        assert_eq!(
            envelope["origin"].as_str(),
            Some(broker.config.instance_id.as_str())
        );
        assert_eq!(envelope["message"]["event"], json!("task.update"));
    }

    #[tokio::test]
    async fn sibling_delivers_cluster_received_messages() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let origin_transport = Arc::new(MockTransport::new());
        let sibling_transport = Arc::new(MockTransport::new());

        let origin = broker_with(
            store.clone(),
            origin_transport.clone(),
            BrokerConfig::default(),
        );
        let sibling = broker_with(
            store.clone(),
            sibling_transport.clone(),
            BrokerConfig::default(),
        );
        origin.start();
        sibling.start();

        origin.publish(user_draft("alice")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The sibling delivered locally; the origin did not re-deliver its
        // own envelope.
        assert_eq!(sibling_transport.call_count(), 1);
        assert_eq!(sibling_transport.calls()[0].target, "user:alice");
        assert_eq!(origin_transport.call_count(), 1);

        origin.shutdown().await;
        sibling.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_queue_survives_restart() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockTransport::new());

        let first = broker_with(store.clone(), transport.clone(), BrokerConfig::default());
        let id = first
            .publish(user_draft("alice").persistent())
            .await
            .unwrap();
        drop(first);

        let second = broker_with(store.clone(), transport.clone(), BrokerConfig::default());
        assert_eq!(second.restore_queue().await.unwrap(), 1);
        assert!(second.queue().contains(&id));

        // Restoration is idempotent.
        assert_eq!(second.restore_queue().await.unwrap(), 0);

        // And the restored message still delivers.
        let stats = second.sweep_queue_once().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(store.get(&keys::queued_message(&id)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_persistent_messages_leave_no_mirror() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockTransport::new());
        let broker = broker_with(store.clone(), transport, BrokerConfig::default());

        let id = broker
            .publish(user_draft("alice").guaranteed())
            .await
            .unwrap();
        assert_eq!(store.get(&keys::queued_message(&id)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_the_queue_once() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone());
        broker.start();

        broker
            .publish(user_draft("alice").guaranteed())
            .await
            .unwrap();
        broker.shutdown().await;

        assert!(broker.queue().is_empty());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn stats_reflect_lifecycle() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport);

        broker.publish(user_draft("alice")).await.unwrap();
        broker
            .publish(user_draft("bob").guaranteed())
            .await
            .unwrap();

        let stats = broker.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.queued, 1);
        assert!(stats.avg_delivery_latency_ms >= 0.0);
    }
}
