//! Session manager: owns the mapping from logical sessions to live
//! connections, mints reconnection tokens, and mirrors everything to the
//! shared store so sibling instances can see it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use beacon_core::ids::{ConnectionId, SessionId, TokenId};
use beacon_store::{keys, SharedStore};
use beacon_telemetry::MetricsRecorder;

use crate::error::SessionError;
use crate::session::{ClientMetadata, ConnectionInfo, Session};
use crate::tokens::ReconnectionToken;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Identifies this process on the cluster control channel.
    pub instance_id: String,
    /// Sliding TTL for mirrored session records.
    pub session_ttl: Duration,
    /// Lifetime of a reconnection token.
    pub token_ttl: Duration,
    /// How long an inactive session survives before the cleanup sweep
    /// deletes it.
    pub inactive_grace: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("inst_{}", uuid::Uuid::now_v7()),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            token_ttl: Duration::from_secs(5 * 60),
            inactive_grace: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    SessionUpdated,
    SessionRemoved,
}

/// Notice published on `cluster:session_updates` so sibling instances can
/// refresh their caches without polling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionNotice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub session_id: SessionId,
    pub user_id: String,
    pub origin: String,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub cached_sessions: usize,
    pub live_connections: usize,
    pub attaches: u64,
    pub reconnections: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub sessions_removed: usize,
    pub tokens_removed: usize,
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

pub struct SessionManager {
    store: Arc<dyn SharedStore>,
    metrics: Arc<MetricsRecorder>,
    config: SessionConfig,
    sessions: DashMap<SessionId, Session>,
    tokens: DashMap<TokenId, ReconnectionToken>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        metrics: Arc<MetricsRecorder>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a connection to its (user, device) session, creating the
    /// session on first contact. The updated session is mirrored to the
    /// store; a mirror failure propagates because local state has already
    /// advanced and the caller must know the store may be stale.
    #[instrument(skip(self, info), fields(user_id = %info.user_id, connection_id = %info.connection_id))]
    pub async fn attach(&self, info: ConnectionInfo) -> Result<Session, SessionError> {
        let session_id = info.session_id();
        let session = {
            let mut entry = self
                .sessions
                .entry(session_id)
                .or_insert_with(|| Session::open(&info));
            entry.attach_connection(info.connection_id.clone());
            entry.clone()
        };

        self.metrics.counter_inc("session.attach.total", &[], 1);
        self.refresh_gauges();
        tracing::debug!(session_id = %session.id, connections = session.connections.len(), "connection attached");

        self.mirror(&session).await?;
        self.notify_cluster(NoticeKind::SessionUpdated, &session.id, &session.user_id)
            .await;
        Ok(session)
    }

    /// Remove a connection from whichever local session holds it. Returns a
    /// freshly minted reconnection token when the session just went inactive.
    /// Unknown connections are a no-op, not an error.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn detach(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<ReconnectionToken>, SessionError> {
        // O(sessions) scan; session count is bounded by concurrent users.
        let mut found: Option<(Session, Option<ReconnectionToken>)> = None;
        for mut entry in self.sessions.iter_mut() {
            if entry.detach_connection(connection_id) {
                let token = if entry.connections.is_empty() {
                    Some(ReconnectionToken::mint(
                        &entry,
                        chrono_ttl(self.config.token_ttl),
                    ))
                } else {
                    None
                };
                found = Some((entry.clone(), token));
                break;
            }
        }

        let Some((session, token)) = found else {
            tracing::debug!("detach for connection not held by any local session");
            return Ok(None);
        };

        if let Some(token) = &token {
            self.tokens.insert(token.token.clone(), token.clone());
            self.store_token(token).await?;
            tracing::debug!(session_id = %session.id, token = %token.token, "session inactive, reconnection token minted");
        }

        self.refresh_gauges();
        self.mirror(&session).await?;
        self.notify_cluster(NoticeKind::SessionUpdated, &session.id, &session.user_id)
            .await;
        Ok(token)
    }

    /// Local cache first, then the shared store (caching on hit). Store
    /// unavailability degrades to not-found: the caller can retry, and a
    /// read miss never fabricates state.
    pub async fn get(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session.clone());
        }
        match self.store.get(&keys::session(session_id)).await {
            Ok(Some(json)) => {
                let session: Session = serde_json::from_str(&json)?;
                self.sessions.insert(session.id.clone(), session.clone());
                self.refresh_gauges();
                Ok(session)
            }
            Ok(None) => Err(SessionError::NotFound(session_id.clone())),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "store lookup failed, degrading to not-found");
                Err(SessionError::NotFound(session_id.clone()))
            }
        }
    }

    /// Every session for a user: locally cached ones plus any ids in the
    /// store's per-user index not yet cached (lazy hydration).
    pub async fn get_by_user(&self, user_id: &str) -> Vec<Session> {
        let mut found: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect();

        match self.store.set_members(&keys::user_index(user_id)).await {
            Ok(ids) => {
                for raw in ids {
                    let session_id = SessionId::from_raw(raw);
                    if found.iter().any(|s| s.id == session_id) {
                        continue;
                    }
                    if let Ok(session) = self.get(&session_id).await {
                        found.push(session);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "user index unavailable, returning local sessions only");
            }
        }

        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found
    }

    /// Stamp activity and re-mirror, sliding the store TTL forward.
    pub async fn touch(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let session = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
            entry.touch();
            entry.clone()
        };
        self.mirror(&session).await
    }

    /// Mint a token against an arbitrary session, outside the detach path.
    pub async fn issue_reconnection_token(
        &self,
        session: &Session,
    ) -> Result<ReconnectionToken, SessionError> {
        let token = ReconnectionToken::mint(session, chrono_ttl(self.config.token_ttl));
        self.tokens.insert(token.token.clone(), token.clone());
        self.store_token(&token).await?;
        Ok(token)
    }

    /// Look a token up without consuming it. Expired tokens fail closed and
    /// are deleted as a side effect.
    pub async fn validate_reconnection_token(
        &self,
        token_id: &TokenId,
    ) -> Result<ReconnectionToken, SessionError> {
        let now = Utc::now();
        if let Some(token) = self.tokens.get(token_id).map(|t| t.value().clone()) {
            if token.is_expired_at(now) {
                self.tokens.remove(token_id);
                let _ = self.store.delete(&keys::token(token_id)).await;
                return Err(SessionError::TokenNotFound);
            }
            return Ok(token);
        }
        match self.store.get(&keys::token(token_id)).await {
            Ok(Some(json)) => {
                let token: ReconnectionToken = serde_json::from_str(&json)?;
                if token.is_expired_at(now) {
                    let _ = self.store.delete(&keys::token(token_id)).await;
                    return Err(SessionError::TokenNotFound);
                }
                Ok(token)
            }
            Ok(None) => Err(SessionError::TokenNotFound),
            Err(e) => {
                tracing::warn!(token = %token_id, error = %e, "token lookup failed, degrading to not-found");
                Err(SessionError::TokenNotFound)
            }
        }
    }

    /// Consume a token and attach a new connection to its session. The token
    /// is removed before anything else happens, so of two concurrent
    /// attempts exactly one wins; the loser observes not-found.
    #[instrument(skip(self, metadata), fields(token = %token_id, connection_id = %connection_id))]
    pub async fn reconnect(
        &self,
        token_id: &TokenId,
        connection_id: ConnectionId,
        metadata: ClientMetadata,
    ) -> Result<Session, SessionError> {
        let now = Utc::now();
        let token = match self.tokens.remove(token_id) {
            Some((_, token)) => token,
            None => match self.store.get(&keys::token(token_id)).await {
                Ok(Some(json)) => serde_json::from_str::<ReconnectionToken>(&json)?,
                Ok(None) => return Err(SessionError::TokenNotFound),
                Err(e) => {
                    tracing::warn!(error = %e, "token lookup failed, degrading to not-found");
                    return Err(SessionError::TokenNotFound);
                }
            },
        };
        // Invalidate the mirror no matter how the rest goes: single use.
        let _ = self.store.delete(&keys::token(token_id)).await;

        if token.is_expired_at(now) {
            return Err(SessionError::TokenNotFound);
        }

        self.get(&token.session_id).await?;
        let session = {
            let mut entry = self
                .sessions
                .get_mut(&token.session_id)
                .ok_or_else(|| SessionError::NotFound(token.session_id.clone()))?;
            entry.attach_connection(connection_id);
            entry.state.reconnect_count += 1;
            entry.metadata.merge_from(metadata);
            entry.clone()
        };

        self.metrics.counter_inc("session.reconnect.total", &[], 1);
        self.refresh_gauges();
        tracing::info!(session_id = %session.id, reconnect_count = session.state.reconnect_count, "session resumed");

        self.mirror(&session).await?;
        self.notify_cluster(NoticeKind::SessionUpdated, &session.id, &session.user_id)
            .await;
        Ok(session)
    }

    /// Absorb sessions written by sibling instances: scan the store for
    /// session keys not cached locally and hydrate the active ones. Merges
    /// are last-write-wins by `updated_at`; a newer local copy is never
    /// clobbered. Returns how many sessions were hydrated.
    pub async fn sync_with_cluster(&self) -> Result<usize, SessionError> {
        let session_keys = self.store.keys_by_prefix(keys::SESSION_PREFIX).await?;
        let mut hydrated = 0;

        for key in session_keys {
            let Some(session_id) = keys::session_id_from_key(&key) else {
                continue;
            };
            if self.sessions.contains_key(&session_id) {
                continue;
            }
            match self.store.get(&key).await {
                Ok(Some(json)) => match serde_json::from_str::<Session>(&json) {
                    Ok(remote) if remote.state.is_active => match self.sessions.entry(session_id) {
                        Entry::Occupied(mut entry) => {
                            if remote.updated_at > entry.get().updated_at {
                                entry.insert(remote);
                            }
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(remote);
                            hydrated += 1;
                        }
                    },
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping unparsable session record");
                    }
                },
                // Expired between the scan and the read.
                Ok(None) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if hydrated > 0 {
            self.refresh_gauges();
            tracing::debug!(hydrated = hydrated, "cluster sync hydrated sessions");
        }
        Ok(hydrated)
    }

    /// One cleanup pass: evict expired tokens and inactive sessions past the
    /// grace period. The periodic sweep and tests both call this directly.
    pub async fn run_cleanup(&self) -> CleanupStats {
        let now = Utc::now();
        let grace = chrono_ttl(self.config.inactive_grace);

        let expired_tokens: Vec<TokenId> = self
            .tokens
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.token.clone())
            .collect();
        for token_id in &expired_tokens {
            self.tokens.remove(token_id);
            let _ = self.store.delete(&keys::token(token_id)).await;
        }

        let stale: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| entry.eligible_for_cleanup(now, grace))
            .map(|entry| entry.clone())
            .collect();
        for session in &stale {
            self.sessions.remove(&session.id);
            if let Err(e) = self.store.delete(&keys::session(&session.id)).await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to delete mirrored session");
            }
            if let Err(e) = self
                .store
                .remove_from_set(&keys::user_index(&session.user_id), session.id.as_str())
                .await
            {
                tracing::warn!(session_id = %session.id, error = %e, "failed to unindex session");
            }
            self.notify_cluster(NoticeKind::SessionRemoved, &session.id, &session.user_id)
                .await;
        }

        let stats = CleanupStats {
            sessions_removed: stale.len(),
            tokens_removed: expired_tokens.len(),
        };
        if stats.sessions_removed > 0 || stats.tokens_removed > 0 {
            self.metrics
                .counter_inc("session.cleanup.sessions", &[], stats.sessions_removed as u64);
            self.metrics
                .counter_inc("session.cleanup.tokens", &[], stats.tokens_removed as u64);
            self.refresh_gauges();
            tracing::info!(
                sessions = stats.sessions_removed,
                tokens = stats.tokens_removed,
                "cleanup sweep"
            );
        }
        stats
    }

    /// Spawn the periodic cleanup sweep and the cluster-notice listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.run_cleanup().await;
                    }
                    () = manager.cancel.cancelled() => break,
                }
            }
        }));

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut rx = match manager
                .store
                .subscribe_by_pattern(keys::SESSION_UPDATES_CHANNEL)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(error = %e, "failed to subscribe to session updates");
                    return;
                }
            };
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => manager.handle_notice(&msg.payload),
                        None => break,
                    },
                    () = manager.cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> SessionStats {
        let mut active = 0;
        let mut connections = 0;
        for entry in self.sessions.iter() {
            if entry.state.is_active {
                active += 1;
            }
            connections += entry.connections.len();
        }
        SessionStats {
            active_sessions: active,
            cached_sessions: self.sessions.len(),
            live_connections: connections,
            attaches: self.metrics.counter_get("session.attach.total", &[]),
            reconnections: self.metrics.counter_get("session.reconnect.total", &[]),
        }
    }

    /// Drop a sibling-updated session from the passive cache so the next
    /// lookup rehydrates. Sessions with live local connections are local
    /// truth and are never evicted by a remote hint.
    fn handle_notice(&self, payload: &str) {
        let notice: SessionNotice = match serde_json::from_str(payload) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparsable session notice");
                return;
            }
        };
        if notice.origin == self.config.instance_id {
            return;
        }
        let evicted = self
            .sessions
            .remove_if(&notice.session_id, |_, session| session.connections.is_empty());
        if evicted.is_some() {
            tracing::debug!(session_id = %notice.session_id, origin = %notice.origin, "evicted cached session on cluster notice");
            self.refresh_gauges();
        }
    }

    async fn mirror(&self, session: &Session) -> Result<(), SessionError> {
        let json = serde_json::to_string(session)?;
        self.store
            .set_with_ttl(&keys::session(&session.id), &json, self.config.session_ttl)
            .await?;
        self.store
            .add_to_set(&keys::user_index(&session.user_id), session.id.as_str())
            .await?;
        Ok(())
    }

    async fn store_token(&self, token: &ReconnectionToken) -> Result<(), SessionError> {
        let json = serde_json::to_string(token)?;
        self.store
            .set_with_ttl(&keys::token(&token.token), &json, self.config.token_ttl)
            .await?;
        Ok(())
    }

    /// Advisory; a publish failure must not fail the mutation that is
    /// already mirrored, so it is logged and swallowed.
    async fn notify_cluster(&self, kind: NoticeKind, session_id: &SessionId, user_id: &str) {
        let notice = SessionNotice {
            kind,
            session_id: session_id.clone(),
            user_id: user_id.into(),
            origin: self.config.instance_id.clone(),
            timestamp: Utc::now(),
        };
        let payload = match serde_json::to_string(&notice) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode session notice");
                return;
            }
        };
        if let Err(e) = self
            .store
            .publish(keys::SESSION_UPDATES_CHANNEL, &payload)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "failed to publish session notice");
        }
    }

    fn refresh_gauges(&self) {
        let mut active = 0i64;
        let mut connections = 0i64;
        for entry in self.sessions.iter() {
            if entry.state.is_active {
                active += 1;
            }
            connections += entry.connections.len() as i64;
        }
        self.metrics.gauge_set("session.active", &[], active);
        self.metrics.gauge_set("session.connections", &[], connections);
    }
}
