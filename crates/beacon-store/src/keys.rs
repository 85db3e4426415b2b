//! Key and channel naming for everything this core puts in the shared store.
//! Centralized so every instance in the cluster agrees on the layout.

use beacon_core::ids::{MessageId, SessionId, TokenId};

pub const SESSION_PREFIX: &str = "sessions:";
pub const USER_INDEX_PREFIX: &str = "user_sessions:";
pub const TOKEN_PREFIX: &str = "reconnect:";
pub const QUEUED_PREFIX: &str = "queued:";
pub const MESSAGE_CHANNEL_PREFIX: &str = "messages:";

/// Control channel carrying session lifecycle notices between instances.
pub const SESSION_UPDATES_CHANNEL: &str = "cluster:session_updates";

pub fn session(id: &SessionId) -> String {
    format!("{SESSION_PREFIX}{id}")
}

pub fn user_index(user_id: &str) -> String {
    format!("{USER_INDEX_PREFIX}{user_id}")
}

pub fn token(token: &TokenId) -> String {
    format!("{TOKEN_PREFIX}{token}")
}

pub fn queued_message(id: &MessageId) -> String {
    format!("{QUEUED_PREFIX}{id}")
}

/// Channel for cross-instance republication, one per message kind.
pub fn message_channel(kind: &str) -> String {
    format!("{MESSAGE_CHANNEL_PREFIX}{kind}")
}

/// Pattern matching every message channel.
pub fn message_channel_pattern() -> String {
    format!("{MESSAGE_CHANNEL_PREFIX}*")
}

/// Extract the session id from a `sessions:` key, if it is one.
pub fn session_id_from_key(key: &str) -> Option<SessionId> {
    key.strip_prefix(SESSION_PREFIX).map(SessionId::from_raw)
}
