use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use beacon_core::ids::{ConnectionId, SessionId};

/// Client details captured at attach time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
}

impl ClientMetadata {
    /// Overlay the fields the reconnecting client actually supplied; absent
    /// fields keep their previous value.
    pub fn merge_from(&mut self, other: ClientMetadata) {
        if other.user_agent.is_some() {
            self.user_agent = other.user_agent;
        }
        if other.ip.is_some() {
            self.ip = other.ip;
        }
        if other.platform.is_some() {
            self.platform = other.platform;
        }
        if other.version.is_some() {
            self.version = other.version;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
    pub reconnect_count: u32,
    /// Lifetime attach counter, never decremented.
    pub total_connections: u64,
}

/// One authenticated user's logical presence on a (user, device) pair,
/// independent of any single connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub device_id: Option<String>,
    /// Live connections in attach order.
    pub connections: Vec<ConnectionId>,
    pub metadata: ClientMetadata,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inputs for attaching one live connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub device_id: Option<String>,
    pub metadata: ClientMetadata,
}

impl ConnectionInfo {
    pub fn new(user_id: impl Into<String>, device_id: Option<&str>) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            user_id: user_id.into(),
            device_id: device_id.map(String::from),
            metadata: ClientMetadata::default(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::derive(&self.user_id, self.device_id.as_deref())
    }
}

impl Session {
    /// New session seeded with its first connection.
    pub fn open(info: &ConnectionInfo) -> Self {
        let now = Utc::now();
        Self {
            id: info.session_id(),
            user_id: info.user_id.clone(),
            device_id: info.device_id.clone(),
            connections: vec![info.connection_id.clone()],
            metadata: info.metadata.clone(),
            state: SessionState {
                is_active: true,
                last_activity: now,
                reconnect_count: 0,
                total_connections: 1,
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a connection, reactivating the session and bumping counters.
    pub fn attach_connection(&mut self, connection_id: ConnectionId) {
        if !self.connections.contains(&connection_id) {
            self.connections.push(connection_id);
            self.state.total_connections += 1;
        }
        self.state.is_active = true;
        self.touch();
    }

    /// Remove a connection. Returns false when the id was not a member. The
    /// session deactivates when its last connection leaves.
    pub fn detach_connection(&mut self, connection_id: &ConnectionId) -> bool {
        let Some(index) = self.connections.iter().position(|c| c == connection_id) else {
            return false;
        };
        self.connections.remove(index);
        if self.connections.is_empty() {
            self.state.is_active = false;
        }
        self.touch();
        true
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.state.last_activity = now;
        self.updated_at = now;
    }

    /// Whether an inactive session has exceeded its grace period at `now`.
    pub fn eligible_for_cleanup(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        !self.state.is_active && now - self.state.last_activity >= grace
    }
}
