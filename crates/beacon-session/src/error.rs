use beacon_core::ids::SessionId;
use beacon_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Covers unknown, already-used, and expired tokens alike; callers get no
    /// signal about which, so a replayed token leaks nothing.
    #[error("reconnection token not found")]
    TokenNotFound,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
