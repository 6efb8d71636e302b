//! Short-lived opaque session tokens.
//!
//! Tokens are 32 bytes of cryptographic random, base64url-encoded, unique
//! by construction. A session expires a fixed TTL after creation or last
//! refresh; refresh extends expiration without rotating the token. Expired
//! entries are evicted lazily on lookup and by a periodic reaper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use tracing::debug;

use crate::types::{PrincipalKind, ProviderId};

pub const REAPER_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub kind: PrincipalKind,
    pub channel: String,
    /// Provider keys captured at validate time; inherited by requests
    /// presenting this session token.
    pub provider_keys: HashMap<ProviderId, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl: chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.num_seconds() as u64
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Create and insert a new session, returning its token.
    pub fn create(
        &self,
        user_id: &str,
        kind: PrincipalKind,
        channel: &str,
        provider_keys: HashMap<ProviderId, String>,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            token: Self::generate_token(),
            user_id: user_id.to_string(),
            kind,
            channel: channel.to_string(),
            provider_keys,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.insert(session.token.clone(), session.clone());
        session
    }

    /// Look up a session; expired entries are evicted in the same
    /// critical section and reported as absent.
    pub fn lookup(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        match sessions.get(token) {
            Some(session) if session.expires_at > Utc::now() => Some(session.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    /// Extend a live session's expiration. The token is not rotated.
    pub fn refresh(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        match sessions.get_mut(token) {
            Some(session) if session.expires_at > Utc::now() => {
                session.expires_at = Utc::now() + self.ttl;
                true
            }
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .remove(token)
            .is_some()
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        let now = Utc::now();
        let expired = sessions.values().filter(|s| s.expires_at <= now).count();
        SessionStats {
            total: sessions.len(),
            active: sessions.len() - expired,
            expired,
        }
    }

    /// Remove entries whose expiration is in the past.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "session reaper swept expired sessions");
        }
        removed
    }

    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}
