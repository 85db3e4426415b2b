//! Session management for the beacon realtime core: tracks which live
//! connections belong to which logical (user, device) session, survives
//! connection loss through single-use reconnection tokens, and mirrors
//! session state to the shared store for cluster visibility.

mod error;
mod manager;
mod session;
mod tokens;

pub use error::SessionError;
pub use manager::{
    CleanupStats, NoticeKind, SessionConfig, SessionManager, SessionNotice, SessionStats,
};
pub use session::{ClientMetadata, ConnectionInfo, Session, SessionState};
pub use tokens::{ReconnectionToken, TokenMetadata};
