//! Recording transport with pre-programmed outcomes for deterministic tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::transport::{Transport, TransportError};

/// Outcome for one send call, consumed in order. An exhausted script means
/// every further call succeeds.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    Ok,
    Fail(String),
}

/// One recorded send, regardless of which primitive was used.
#[derive(Clone, Debug, PartialEq)]
pub struct SentCall {
    /// `user:<id>`, `role:<role>`, `room:<id>`, or `all`.
    pub target: String,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<SentCall>>,
    connection_counts: Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that fails the first `n` sends, then succeeds.
    pub fn failing_times(n: usize) -> Self {
        let transport = Self::new();
        transport.push_script(vec![MockOutcome::Fail("transport unavailable".into()); n]);
        transport
    }

    pub fn push_script(&self, outcomes: Vec<MockOutcome>) {
        self.script.lock().extend(outcomes);
    }

    /// Make every send fail until further notice (script of one failure,
    /// re-armed on each call).
    pub fn always_failing() -> AlwaysFailingTransport {
        AlwaysFailingTransport {
            inner: Self::new(),
        }
    }

    pub fn calls(&self) -> Vec<SentCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn set_connection_count(&self, user_id: &str, count: usize) {
        self.connection_counts.lock().insert(user_id.into(), count);
    }

    fn record(
        &self,
        target: String,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.calls.lock().push(SentCall {
            target,
            event: event.into(),
            payload: payload.clone(),
        });
        match self.script.lock().pop_front() {
            Some(MockOutcome::Fail(reason)) => Err(TransportError::SendFailed(reason)),
            Some(MockOutcome::Ok) | None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_to_user(
        &self,
        user_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.record(format!("user:{user_id}"), event, payload)
    }

    async fn send_to_role(
        &self,
        role: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.record(format!("role:{role}"), event, payload)
    }

    async fn send_to_room(
        &self,
        room_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.record(format!("room:{room_id}"), event, payload)
    }

    async fn send_to_all(
        &self,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.record("all".into(), event, payload)
    }

    fn connection_count(&self, user_id: &str) -> usize {
        self.connection_counts.lock().get(user_id).copied().unwrap_or(0)
    }
}

/// Transport where every send fails, forever.
#[derive(Default)]
pub struct AlwaysFailingTransport {
    inner: MockTransport,
}

impl AlwaysFailingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.inner.call_count()
    }

    pub fn calls(&self) -> Vec<SentCall> {
        self.inner.calls()
    }
}

#[async_trait]
impl Transport for AlwaysFailingTransport {
    async fn send_to_user(
        &self,
        user_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.inner.record(format!("user:{user_id}"), event, payload)?;
        Err(TransportError::SendFailed("scripted failure".into()))
    }

    async fn send_to_role(
        &self,
        role: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.inner.record(format!("role:{role}"), event, payload)?;
        Err(TransportError::SendFailed("scripted failure".into()))
    }

    async fn send_to_room(
        &self,
        room_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.inner.record(format!("room:{room_id}"), event, payload)?;
        Err(TransportError::SendFailed("scripted failure".into()))
    }

    async fn send_to_all(
        &self,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.inner.record("all".into(), event, payload)?;
        Err(TransportError::SendFailed("scripted failure".into()))
    }

    fn connection_count(&self, user_id: &str) -> usize {
        self.inner.connection_count(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let transport = MockTransport::new();
        transport
            .send_to_user("alice", "ping", &serde_json::json!(1))
            .await
            .unwrap();
        transport
            .send_to_room("lobby", "ping", &serde_json::json!(2))
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].target, "user:alice");
        assert_eq!(calls[1].target, "room:lobby");
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let transport = MockTransport::failing_times(2);
        assert!(transport.send_to_all("e", &serde_json::Value::Null).await.is_err());
        assert!(transport.send_to_all("e", &serde_json::Value::Null).await.is_err());
        assert!(transport.send_to_all("e", &serde_json::Value::Null).await.is_ok());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn always_failing_never_succeeds() {
        let transport = MockTransport::always_failing();
        for _ in 0..5 {
            assert!(transport
                .send_to_user("a", "e", &serde_json::Value::Null)
                .await
                .is_err());
        }
        assert_eq!(transport.call_count(), 5);
    }

    #[test]
    fn connection_counts() {
        let transport = MockTransport::new();
        assert_eq!(transport.connection_count("alice"), 0);
        transport.set_connection_count("alice", 3);
        assert_eq!(transport.connection_count("alice"), 3);
    }
}
