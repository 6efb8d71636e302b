//! Authentication Service Module
//!
//! Resolves every request to a principal via a fixed credential
//! precedence (first match wins):
//! 1. `app-key` header — constant-time compare against the operator secret
//! 2. `Authorization: Bearer <token>` — HS256 signature against the
//!    signing secret; user id from the `id` or `sub` claim
//! 3. `session-token` header — opaque token looked up in the session store
//!
//! The platform-identity exchange (Sign in with Apple) lives in
//! `apple.rs` and only runs on its explicit exchange endpoint.
//!
//! Per-provider override keys (`user-<provider>-key`) are accepted on any
//! path and attached to the principal. Credentials are never logged; only
//! the principal id and a truncated prefix appear in the trace.

use std::collections::HashMap;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::session::SessionStore;
use crate::types::{Principal, PrincipalKind, ProviderId};

pub const APP_KEY_HEADER: &str = "app-key";
pub const SESSION_TOKEN_HEADER: &str = "session-token";
pub const CHANNEL_HEADER: &str = "model-channel";

/// Bearer token claims. The user id comes from `id` when present,
/// falling back to the standard `sub` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn user_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.sub.as_deref())
    }
}

/// Constant-time equality for secrets.
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// First few characters of a credential, safe to log.
pub fn credential_prefix(credential: &str) -> String {
    let prefix: String = credential.chars().take(6).collect();
    format!("{}…", prefix)
}

#[derive(Clone)]
pub struct Authenticator {
    config: std::sync::Arc<Config>,
    sessions: SessionStore,
}

impl Authenticator {
    pub fn new(config: std::sync::Arc<Config>, sessions: SessionStore) -> Self {
        Self { config, sessions }
    }

    /// Requested routing channel, defaulting to `stable`.
    pub fn channel(headers: &HeaderMap) -> String {
        headers
            .get(CHANNEL_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .unwrap_or("stable")
            .to_string()
    }

    /// Collect `user-<provider>-key` override headers.
    pub fn override_keys(headers: &HeaderMap) -> HashMap<ProviderId, String> {
        let mut keys = HashMap::new();
        for provider in ProviderId::all() {
            let header = format!("user-{}-key", provider.as_str());
            if let Some(value) = headers.get(&header).and_then(|v| v.to_str().ok()) {
                if !value.is_empty() {
                    keys.insert(provider, value.to_string());
                }
            }
        }
        keys
    }

    /// Resolve the request's principal, or reject.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, GatewayError> {
        let channel = Self::channel(headers);
        let mut provider_keys = Self::override_keys(headers);

        // 1. Operator app-key.
        if let Some(presented) = headers.get(APP_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            let expected = self
                .config
                .operator_key
                .as_deref()
                .ok_or(GatewayError::AuthMisconfigured)?;
            if !secrets_match(presented, expected) {
                warn!(prefix = %credential_prefix(presented), "app-key mismatch");
                return Err(GatewayError::AuthInvalid);
            }
            debug!("authenticated operator app-key");
            return Ok(Principal {
                user_id: "app".to_string(),
                kind: PrincipalKind::AppKey,
                channel,
                provider_keys,
            });
        }

        // 2. Signed bearer token.
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                let claims = self.verify_bearer(token)?;
                let user_id = claims
                    .user_id()
                    .ok_or(GatewayError::AuthInvalid)?
                    .to_string();
                debug!(user_id, "authenticated bearer token");
                return Ok(Principal {
                    user_id,
                    kind: PrincipalKind::User,
                    channel,
                    provider_keys,
                });
            }
        }

        // 3. Opaque session token.
        if let Some(token) = headers
            .get(SESSION_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let session = self
                .sessions
                .lookup(token)
                .ok_or(GatewayError::SessionExpired)?;
            debug!(user_id = %session.user_id, "authenticated session token");
            // Header overrides win over keys captured at validate time.
            for (provider, key) in session.provider_keys {
                provider_keys.entry(provider).or_insert(key);
            }
            return Ok(Principal {
                user_id: session.user_id,
                kind: session.kind,
                channel: if headers.contains_key(CHANNEL_HEADER) {
                    channel
                } else {
                    session.channel
                },
                provider_keys,
            });
        }

        Err(GatewayError::AuthRequired)
    }

    /// Verify an HS256 bearer token against the signing secret.
    pub fn verify_bearer(&self, token: &str) -> Result<Claims, GatewayError> {
        let secret = self
            .config
            .signing_secret
            .as_deref()
            .ok_or(GatewayError::AuthMisconfigured)?;

        let validation = Validation::default();
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| {
            warn!(prefix = %credential_prefix(token), "bearer verification failed: {}", err);
            GatewayError::AuthInvalid
        })
    }
}
