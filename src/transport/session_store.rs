//! Durable map from session id to session metadata (§3 "Session", §4.3
//! "Session store", §6 "Persistent state").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type SessionId = String;

/// Default session TTL (§6: "TTL in seconds (default 3600)").
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// `{sessionId, createdAt, lastActivity, protocolVersion}` (§3).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub protocol_version: String,
}

/// Storage for session records. A session id, once issued, is never
/// reissued; deletion is permanent (§3 invariant 4).
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn store_session(&self, record: SessionRecord);

    async fn get_session(&self, id: &SessionId) -> Option<SessionRecord>;

    /// Bump `lastActivity` and refresh the TTL. Failures here must not break
    /// the request path (§5: "Activity-refresh failures are logged and
    /// swallowed").
    async fn update_session_activity(&self, id: &SessionId);

    async fn delete_session(&self, id: &SessionId);

    async fn session_exists(&self, id: &SessionId) -> bool {
        self.get_session(id).await.is_some()
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every session whose `lastActivity` is older than `ttl`. Call
    /// periodically; the store itself does not run a background sweep.
    pub fn evict_expired(&self, ttl: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        self.sessions
            .lock()
            .unwrap()
            .retain(|_, record| record.last_activity >= cutoff);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn store_session(&self, record: SessionRecord) {
        self.sessions
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record);
    }

    async fn get_session(&self, id: &SessionId) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    async fn update_session_activity(&self, id: &SessionId) {
        if let Some(record) = self.sessions.lock().unwrap().get_mut(id) {
            record.last_activity = Utc::now();
        }
    }

    async fn delete_session(&self, id: &SessionId) {
        self.sessions.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deleted_session_id_is_never_reissued_implicitly() {
        let store = InMemorySessionStore::new();
        let record = SessionRecord {
            session_id: "s1".into(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            protocol_version: "2025-06-18".into(),
        };
        store.store_session(record).await;
        assert!(store.session_exists(&"s1".to_string()).await);
        store.delete_session(&"s1".to_string()).await;
        assert!(!store.session_exists(&"s1".to_string()).await);
    }
}
