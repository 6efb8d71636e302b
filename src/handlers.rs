//! Health, session, identity-exchange, and catalog handlers, plus the
//! request-id middleware.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{Authenticator, SESSION_TOKEN_HEADER};
use crate::error::GatewayError;
use crate::state::AppState;
use crate::types::{PrincipalKind, ProviderId};

pub const REQUEST_ID_HEADER: &str = "request-id";

fn hex_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pass an inbound `request-id` through, or mint one; the id rides the
/// response headers either way.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(hex_request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// GET / and /health
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// POST /v1/validate — exchange an app-key or bearer credential for a
/// short-lived session token, capturing any per-provider override keys
/// into the session.
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let principal = state.auth.authenticate(&headers)?;
    // Only primary credentials mint sessions; a session token cannot
    // bootstrap another session.
    if principal.kind == PrincipalKind::Session {
        return Err(GatewayError::AuthInvalid);
    }

    let session = state.sessions.create(
        &principal.user_id,
        principal.kind,
        &principal.channel,
        principal.provider_keys,
    );
    info!(user_id = %session.user_id, "session created");

    Ok(Json(json!({
        "sessionToken": session.token,
        "expiresIn": state.sessions.ttl_secs(),
        "userId": session.user_id,
        "userType": session.kind.as_str(),
        "channel": session.channel,
    }))
    .into_response())
}

/// POST /v1/validate/refresh
pub async fn validate_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let token = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::AuthRequired)?;

    if !state.sessions.refresh(token) {
        return Err(GatewayError::SessionExpired);
    }
    Ok(Json(json!({
        "success": true,
        "expiresIn": state.sessions.ttl_secs(),
    }))
    .into_response())
}

/// POST /v1/validate/revoke
pub async fn validate_revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let token = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::AuthRequired)?;

    state.sessions.revoke(token);
    Ok(Json(json!({ "success": true })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AppleAuthRequest {
    #[serde(rename = "identityToken")]
    pub identity_token: String,
    #[serde(rename = "appId")]
    pub app_id: Option<String>,
}

/// POST /v1/auth/apple — platform-identity exchange. Verifies the
/// identity token, upserts the local user row, and mints a session.
pub async fn auth_apple(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AppleAuthRequest>,
) -> Result<Response, GatewayError> {
    if body.identity_token.is_empty() {
        return Err(GatewayError::Validation(
            "identityToken must not be empty".to_string(),
        ));
    }

    let identity = state
        .apple
        .verify(&body.identity_token, body.app_id.as_deref())
        .await?;

    let user = state
        .store
        .upsert_platform_user(&identity.sub, identity.email.as_deref())
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    info!(user_id = %user.id, is_new = user.is_new, "platform identity exchanged");

    let channel = Authenticator::channel(&headers);
    let provider_keys = Authenticator::override_keys(&headers);
    let session = state.sessions.create(
        &user.id,
        PrincipalKind::PlatformUser,
        &channel,
        provider_keys,
    );

    // Availability map only; key material never leaves the server.
    let api_keys: serde_json::Map<String, Value> = ProviderId::all()
        .into_iter()
        .filter(|p| state.config.provider_key(*p).is_some())
        .map(|p| (p.as_str().to_string(), json!(true)))
        .collect();

    Ok(Json(json!({
        "sessionToken": session.token,
        "expiresIn": state.sessions.ttl_secs(),
        "user": {
            "id": user.id,
            "email": user.email,
            "isNewUser": user.is_new,
        },
        "apiKeys": api_keys,
    }))
    .into_response())
}

/// GET /v1/models — the full catalog plus the caller's channel.
pub async fn models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let principal = state.auth.authenticate(&headers)?;
    Ok(Json(json!({
        "channel": principal.channel,
        "channels": state.catalog.snapshot(),
    }))
    .into_response())
}

/// Fallback for unknown routes.
pub async fn not_found() -> GatewayError {
    GatewayError::NotFound
}
