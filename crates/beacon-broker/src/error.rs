use beacon_core::ids::MessageId;
use beacon_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// One or more routing targets failed. Partial fan-out failure lands
    /// here too; `failed` lists only the targets that threw.
    #[error("delivery failed for {message_id}: {failed:?}")]
    Delivery {
        message_id: MessageId,
        failed: Vec<String>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
