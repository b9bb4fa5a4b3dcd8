//! Typed session state and the freshness gate for step-up actions.
//!
//! The session bag the source code used for this was loosely typed and
//! regenerated its id on every save regardless of whether the caller already
//! had one. Both are fixed here: `Session` is a fixed set of fields, and
//! `SessionStore::save` only mints a new id when the caller doesn't supply
//! one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user_id: Option<String>,
    pub challenge: Option<Vec<u8>>,
    pub last_uv_at: Option<Instant>,
}

/// In-memory session store. Sessions in this crate's scope are a core-side
/// convenience for the WebAuthn challenge/response round trip and the
/// freshness gate; transport-level cookie handling is the host's job.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save `session` under `id`, or mint a fresh id if `id` is `None`.
    /// Returns the id the session now lives under.
    pub async fn save(&self, id: Option<SessionId>, session: Session) -> SessionId {
        let id = id.unwrap_or_else(Uuid::new_v4);
        self.sessions.write().await.insert(id, session);
        id
    }

    pub async fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }
}

/// Gate used before export, key rotation, kill-switch toggling, and bulk
/// decryption: admits only if the session recorded a WebAuthn user
/// verification within the freshness window.
pub fn require_fresh_webauthn(session: &Session, freshness_window: Duration, now: Instant) -> bool {
    match session.last_uv_at {
        Some(last_uv_at) => now.saturating_duration_since(last_uv_at) <= freshness_window,
        None => false,
    }
}
