//! Session collaborator consumed by the CSRF guard
//!
//! The guard only needs to look a session up by id and read/write string values
//! on it. [`InMemorySessionStore`] is a process-local implementation suitable for
//! tests and single-node deployments; production servers plug in their own store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use time::OffsetDateTime;

/// A server-side session record
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    fn value(&self, key: &str) -> Option<String>;

    fn set_value(&self, key: &str, value: &str);

    /// Expired sessions are treated as absent by the CSRF guard
    fn is_expired(&self) -> bool {
        false
    }
}

/// Lookup of sessions by identifier
pub trait SessionStore: Send + Sync {
    fn session_by_id(&self, id: &str) -> Option<Arc<dyn Session>>;
}

/// Session held in memory with an optional expiry
pub struct MemorySession {
    id: String,
    values: RwLock<HashMap<String, String>>,
    expires_at: Option<OffsetDateTime>,
}

impl MemorySession {
    fn new(id: String, expires_at: Option<OffsetDateTime>) -> Self {
        Self {
            id,
            values: RwLock::new(HashMap::new()),
            expires_at,
        }
    }

    fn expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map_or(false, |expires_at| now >= expires_at)
    }
}

impl fmt::Debug for MemorySession {
    // Values may hold secrets such as CSRF tokens
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn value(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_value(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn is_expired(&self) -> bool {
        self.expired_at(OffsetDateTime::now_utc())
    }
}

/// Process-local session store
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<MemorySession>>>,
    lifetime: Option<time::Duration>,
}

impl InMemorySessionStore {
    /// Store whose sessions never expire
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose sessions expire `lifetime` after creation
    pub fn with_lifetime(lifetime: time::Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            lifetime: Some(lifetime),
        }
    }

    /// Create a session with a random identifier
    pub fn create_session(&self) -> Arc<MemorySession> {
        self.create_session_with_id(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create (or replace) a session with a known identifier
    pub fn create_session_with_id<S: Into<String>>(&self, id: S) -> Arc<MemorySession> {
        let id = id.into();
        let expires_at = self
            .lifetime
            .map(|lifetime| OffsetDateTime::now_utc() + lifetime);
        let session = Arc::new(MemorySession::new(id.clone(), expires_at));

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&session));
        session
    }

    pub fn remove_session(&self, id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Drop every session that expired before now
    pub fn cleanup_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired_at(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn session_by_id(&self, id: &str) -> Option<Arc<dyn Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|session| Arc::clone(session) as Arc<dyn Session>)
    }
}
