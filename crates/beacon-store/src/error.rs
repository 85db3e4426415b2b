#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or answered abnormally. Distinct from
    /// absence: lookups that find nothing return `Ok(None)` / empty, never
    /// this.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("subscription error: {0}")]
    Subscription(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
