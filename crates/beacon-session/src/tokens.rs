use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use beacon_core::ids::{SessionId, TokenId};

use crate::session::Session;

/// Snapshot of the session carried inside a token, for diagnostics and for
/// callers that want to pre-validate the reconnecting device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub device_id: Option<String>,
    pub platform: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// One-time capability to re-attach a new connection to an inactive session.
/// The token string is the only secret; possession is proof.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectionToken {
    pub token: TokenId,
    pub session_id: SessionId,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub metadata: TokenMetadata,
}

impl ReconnectionToken {
    pub fn mint(session: &Session, ttl: chrono::Duration) -> Self {
        Self {
            token: TokenId::new(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            expires_at: Utc::now() + ttl,
            metadata: TokenMetadata {
                device_id: session.device_id.clone(),
                platform: session.metadata.platform.clone(),
                last_activity: session.state.last_activity,
            },
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
