use async_trait::async_trait;

/// Errors surfaced by the transport layer. The broker treats every variant as
/// transient; the retry policy decides when to give up.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport closed")]
    Closed,
}

/// Low-level per-connection send primitives, implemented by the socket layer
/// that owns the actual connections. This core only ever calls it; attaching,
/// handshakes, and socket lifecycle live outside.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to_user(
        &self,
        user_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError>;

    async fn send_to_role(
        &self,
        role: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError>;

    async fn send_to_room(
        &self,
        room_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError>;

    async fn send_to_all(&self, event: &str, payload: &serde_json::Value)
        -> Result<(), TransportError>;

    /// Live connection count for a user, for connection-limit enforcement by
    /// callers.
    fn connection_count(&self, user_id: &str) -> usize;
}
