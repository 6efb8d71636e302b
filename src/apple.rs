//! Platform-identity exchange: Sign in with Apple.
//!
//! Verifies an Apple identity token (RS256) against Apple's published
//! JWKS, checks the issuer and — when an allow-list is configured — that
//! the audience is one of our bundle ids, then looks up or creates the
//! local user row keyed by the stable subject. Keys are cached for 24
//! hours and refreshed once when an unknown key id shows up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::credential_prefix;
use crate::error::GatewayError;

pub const APPLE_ISSUER: &str = "https://appleid.apple.com";
pub const APPLE_KEYS_URL: &str = "https://appleid.apple.com/auth/keys";
const KEY_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppleClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Verified identity ready for the user-table upsert.
#[derive(Debug, Clone)]
pub struct AppleIdentity {
    pub sub: String,
    pub email: Option<String>,
}

type KeyCache = Option<(HashMap<String, Jwk>, Instant)>;

#[derive(Clone)]
pub struct AppleVerifier {
    client: reqwest::Client,
    keys_url: String,
    allowed_bundles: Vec<String>,
    cache: Arc<Mutex<KeyCache>>,
}

impl AppleVerifier {
    pub fn new(client: reqwest::Client, allowed_bundles: Vec<String>) -> Self {
        Self {
            client,
            keys_url: APPLE_KEYS_URL.to_string(),
            allowed_bundles,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    #[cfg(test)]
    pub fn with_keys_url(mut self, url: &str) -> Self {
        self.keys_url = url.to_string();
        self
    }

    async fn fetch_keys(&self) -> Result<HashMap<String, Jwk>, GatewayError> {
        let response = self
            .client
            .get(&self.keys_url)
            .send()
            .await
            .map_err(|err| GatewayError::Internal(format!("identity key fetch failed: {}", err)))?;
        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Internal(format!("identity key parse failed: {}", err)))?;
        Ok(jwks.keys.into_iter().map(|k| (k.kid.clone(), k)).collect())
    }

    /// Key for `kid`, from cache when fresh; one refresh on miss.
    async fn key_for(&self, kid: &str) -> Result<Jwk, GatewayError> {
        {
            let cache = self.cache.lock().expect("apple key cache poisoned");
            if let Some((keys, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < KEY_CACHE_TTL {
                    if let Some(key) = keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        let keys = self.fetch_keys().await?;
        let found = keys.get(kid).cloned();
        *self.cache.lock().expect("apple key cache poisoned") = Some((keys, Instant::now()));

        found.ok_or_else(|| {
            warn!(kid, "unknown identity key id after refresh");
            GatewayError::AuthInvalid
        })
    }

    /// Verify an identity token and extract the stable subject.
    ///
    /// `app_id` narrows the audience check to one bundle when the client
    /// names itself; otherwise any allow-listed bundle passes.
    pub async fn verify(
        &self,
        identity_token: &str,
        app_id: Option<&str>,
    ) -> Result<AppleIdentity, GatewayError> {
        let header = decode_header(identity_token).map_err(|err| {
            warn!(
                prefix = %credential_prefix(identity_token),
                "identity token header parse failed: {}", err
            );
            GatewayError::AuthInvalid
        })?;
        let kid = header.kid.ok_or(GatewayError::AuthInvalid)?;

        // Named bundles outside the allow-list are rejected before any
        // key fetch.
        if let (Some(app), false) = (app_id, self.allowed_bundles.is_empty()) {
            if !self.allowed_bundles.iter().any(|b| b == app) {
                return Err(GatewayError::AuthUnauthorizedApp);
            }
        }

        let jwk = self.key_for(&kid).await?;
        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|err| GatewayError::Internal(format!("bad identity key material: {}", err)))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[APPLE_ISSUER]);

        match (app_id, self.allowed_bundles.is_empty()) {
            (Some(app), _) => validation.set_audience(&[app]),
            (None, false) => validation.set_audience(&self.allowed_bundles),
            (None, true) => {
                // No allow-list configured: accept any audience.
                validation.validate_aud = false;
            }
        }

        let data = decode::<AppleClaims>(identity_token, &decoding_key, &validation).map_err(
            |err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    GatewayError::AuthUnauthorizedApp
                }
                _ => {
                    warn!(
                        prefix = %credential_prefix(identity_token),
                        "identity token verification failed: {}", err
                    );
                    GatewayError::AuthInvalid
                }
            },
        )?;

        debug!(sub = %data.claims.sub, "platform identity verified");
        Ok(AppleIdentity {
            sub: data.claims.sub,
            email: data.claims.email,
        })
    }
}
