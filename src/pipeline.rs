//! Request pipeline for the forward endpoints.
//!
//! Every forward request runs the same gauntlet: authenticate, count
//! against the rate window, check the spend ceilings, validate the body,
//! resolve the model kind, pick a provider key, dispatch to the adapter,
//! compute cost from actual or estimated token counts, and record
//! exactly one usage entry — success or failure. The one-shot
//! [`UsageRecorder`] guards the log-once contract even when both a JSON
//! finalizer and a stream finalizer could fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use validator::Validate;

use crate::error::GatewayError;
use crate::pricing::{estimate_tokens, Metered};
use crate::providers::{AdapterRequest, ProviderAdapter};
use crate::state::AppState;
use crate::store::UsageLogEntry;
use crate::types::{
    ChatRequest, ImageRequest, MusicRequest, Principal, PrincipalKind, ProviderId, Usage,
    VoiceRequest,
};

pub const MAX_TEXT_LEN: usize = 5000;

/// One-shot usage recorder: whichever finalizer fires first wins, the
/// rest are no-ops. Cost is forced to zero for non-2xx outcomes.
#[derive(Clone)]
pub struct UsageRecorder {
    usage: crate::usage::UsageLog,
    logged: Arc<AtomicBool>,
    ts_ms: i64,
    start: Instant,
    user_id: String,
    app_id: Option<String>,
    endpoint: String,
    method: String,
}

impl UsageRecorder {
    pub fn new(state: &AppState, principal: &Principal, endpoint: &str, method: &str) -> Self {
        let app_id = (principal.kind == PrincipalKind::AppKey).then(|| "app".to_string());
        Self {
            usage: state.usage.clone(),
            logged: Arc::new(AtomicBool::new(false)),
            ts_ms: Utc::now().timestamp_millis(),
            start: Instant::now(),
            user_id: principal.user_id.clone(),
            app_id,
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    pub fn record(
        &self,
        provider: &str,
        model: &str,
        tokens: Usage,
        cost_cents: i64,
        status: u16,
        error: Option<String>,
    ) {
        if self.logged.swap(true, Ordering::SeqCst) {
            return;
        }
        let success = (200..400).contains(&status);
        self.usage.log(UsageLogEntry {
            id: None,
            ts_ms: self.ts_ms,
            user_id: self.user_id.clone(),
            app_id: self.app_id.clone(),
            endpoint: self.endpoint.clone(),
            method: self.method.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: tokens.prompt_tokens,
            output_tokens: tokens.completion_tokens,
            cost_cents: if success { cost_cents } else { 0 },
            duration_ms: self.start.elapsed().as_millis() as u64,
            status,
            error,
        });
    }
}

/// Drop guard that finalizes a streaming response's usage entry when
/// the stream ends or the client disconnects.
struct StreamFinalizer {
    recorder: UsageRecorder,
    provider: &'static str,
    model: String,
    cost_cents: i64,
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        self.recorder.record(
            self.provider,
            &self.model,
            Usage::default(),
            self.cost_cents,
            200,
            None,
        );
    }
}

/// Auth, rate window, and spend ceilings, in that order.
fn gate(state: &AppState, headers: &HeaderMap) -> Result<Principal, GatewayError> {
    let principal = state.auth.authenticate(headers)?;
    state.rate_limiter.check(&principal.user_id)?;
    state.cost_guard.check(&principal.user_id)?;
    Ok(principal)
}

/// Principal-attached key for the provider if present, else the server
/// default.
fn select_key(
    state: &AppState,
    principal: &Principal,
    provider: ProviderId,
) -> Result<String, GatewayError> {
    principal
        .provider_keys
        .get(&provider)
        .cloned()
        .or_else(|| state.config.provider_key(provider).map(str::to_string))
        .ok_or_else(|| GatewayError::NoApiKey(provider.as_str().to_string()))
}

fn resolve(
    state: &AppState,
    kind: &str,
    channel: &str,
) -> Result<crate::catalog::Resolved, GatewayError> {
    let resolved = state.catalog.resolve(kind, channel)?;
    if resolved.fell_back {
        info!(kind, channel, "channel missing kind, fell back to stable");
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// POST /v1/chat
// ---------------------------------------------------------------------------

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    let principal = gate(&state, &headers)?;

    if body.messages.is_empty() {
        return Err(GatewayError::Validation(
            "messages must be a non-empty array".to_string(),
        ));
    }
    body.options
        .validate()
        .map_err(|err| GatewayError::Validation(err.to_string()))?;

    let kind = body.kind.as_deref().unwrap_or("chat.default");
    let resolved = resolve(&state, kind, &principal.channel)?;
    let config = resolved.config;

    let recorder = UsageRecorder::new(&state, &principal, "/v1/chat", "POST");
    let key = select_key(&state, &principal, config.provider)?;
    let adapter = state
        .providers
        .chat_adapter(config.provider)
        .ok_or_else(|| GatewayError::Internal(format!(
            "no chat adapter for provider {}",
            config.provider.as_str()
        )))?;

    let request = AdapterRequest {
        model: config.model.clone(),
        messages: body.messages.clone(),
        options: body.options.clone(),
    };

    match adapter.complete(&request, &key).await {
        Ok(completion) => {
            // Prefer upstream counts; fall back to the coarse estimate.
            let tokens = if completion.usage.total_tokens > 0 {
                completion.usage
            } else {
                let input: u32 = body
                    .messages
                    .iter()
                    .map(|m| estimate_tokens(&m.content.text()))
                    .sum();
                Usage::new(input, estimate_tokens(completion.content()))
            };
            let cost_cents = state.pricing.cost_cents(
                config.provider,
                &config.model,
                Metered::Tokens(tokens),
            );
            recorder.record(
                config.provider.as_str(),
                &config.model,
                tokens,
                cost_cents,
                200,
                None,
            );
            Ok(Json(completion).into_response())
        }
        Err(err) => {
            let gateway_err: GatewayError = err.into();
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                0,
                gateway_err.status().as_u16(),
                Some(gateway_err.to_string()),
            );
            Err(gateway_err)
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/images, GET /v1/images/:id
// ---------------------------------------------------------------------------

pub async fn images(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ImageRequest>,
) -> Result<Response, GatewayError> {
    let principal = gate(&state, &headers)?;

    if body.prompt.trim().is_empty() {
        return Err(GatewayError::Validation("prompt must not be empty".to_string()));
    }
    if body.width == Some(0) || body.height == Some(0) {
        return Err(GatewayError::Validation(
            "width and height must be positive".to_string(),
        ));
    }
    let num_outputs = body.num_outputs.unwrap_or(1);
    if !(1..=10).contains(&num_outputs) {
        return Err(GatewayError::Validation(
            "num_outputs must be between 1 and 10".to_string(),
        ));
    }

    let kind = body.kind.as_deref().unwrap_or("image.default");
    let resolved = resolve(&state, kind, &principal.channel)?;
    let config = resolved.config;

    let recorder = UsageRecorder::new(&state, &principal, "/v1/images", "POST");
    let key = select_key(&state, &principal, config.provider)?;

    let mut input = json!({ "prompt": body.prompt, "num_outputs": num_outputs });
    if let Some(width) = body.width {
        input["width"] = json!(width);
    }
    if let Some(height) = body.height {
        input["height"] = json!(height);
    }

    let wait = body.wait.unwrap_or(true);
    match state
        .providers
        .replicate
        .generate(&config.model, input, &key, wait)
        .await
    {
        Ok(prediction) => {
            let succeeded = prediction.status == "succeeded";
            let cost_cents = if succeeded {
                state.pricing.cost_cents(
                    config.provider,
                    &config.model,
                    Metered::Images(num_outputs),
                )
            } else {
                0
            };
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                cost_cents,
                200,
                None,
            );

            let mut response = serde_json::to_value(&prediction)
                .map_err(|err| GatewayError::Internal(err.to_string()))?;
            if succeeded {
                match state.hosted.process(&principal.user_id, &prediction).await {
                    Some(hosted_url) => response["hosted_url"] = json!(hosted_url),
                    None if state.config.hosted_images.enabled => {
                        // Download failed: clients keep the upstream URL.
                        response["hosted_fallback"] = json!(true);
                    }
                    None => {}
                }
            }
            Ok(Json(response).into_response())
        }
        Err(err) => {
            let gateway_err: GatewayError = err.into();
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                0,
                gateway_err.status().as_u16(),
                Some(gateway_err.to_string()),
            );
            Err(gateway_err)
        }
    }
}

pub async fn image_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let principal = state.auth.authenticate(&headers)?;
    state.rate_limiter.check(&principal.user_id)?;

    let key = select_key(&state, &principal, ProviderId::Replicate)?;
    let prediction = state
        .providers
        .replicate
        .get_prediction(&id, &key)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(prediction).into_response())
}

// ---------------------------------------------------------------------------
// POST /v1/music
// ---------------------------------------------------------------------------

pub async fn music(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MusicRequest>,
) -> Result<Response, GatewayError> {
    let principal = gate(&state, &headers)?;

    if body.prompt.trim().is_empty() {
        return Err(GatewayError::Validation("prompt must not be empty".to_string()));
    }
    let duration = body.duration.unwrap_or(30);
    if !(1..=300).contains(&duration) {
        return Err(GatewayError::Validation(
            "duration must be between 1 and 300 seconds".to_string(),
        ));
    }

    let kind = body.kind.as_deref().unwrap_or("music.default");
    let resolved = resolve(&state, kind, &principal.channel)?;
    let config = resolved.config;

    let recorder = UsageRecorder::new(&state, &principal, "/v1/music", "POST");
    let key = select_key(&state, &principal, config.provider)?;

    match state
        .providers
        .elevenlabs
        .generate_music(&body.prompt, duration, &key)
        .await
    {
        Ok(response) => {
            let cost_cents = state.pricing.cost_cents(
                config.provider,
                &config.model,
                Metered::AudioSeconds(duration),
            );
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                cost_cents,
                200,
                None,
            );
            Ok(Json(response).into_response())
        }
        Err(err) => {
            let gateway_err: GatewayError = err.into();
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                0,
                gateway_err.status().as_u16(),
                Some(gateway_err.to_string()),
            );
            Err(gateway_err)
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/voice
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    #[serde(default)]
    pub stream: Option<bool>,
}

pub async fn voice(
    State(state): State<AppState>,
    Query(query): Query<VoiceQuery>,
    headers: HeaderMap,
    Json(body): Json<VoiceRequest>,
) -> Result<Response, GatewayError> {
    let principal = gate(&state, &headers)?;

    if body.text.trim().is_empty() {
        return Err(GatewayError::Validation("text must not be empty".to_string()));
    }
    if body.text.chars().count() > MAX_TEXT_LEN {
        return Err(GatewayError::Validation(format!(
            "text must be at most {} characters",
            MAX_TEXT_LEN
        )));
    }

    let kind = body.kind.as_deref().unwrap_or("voice.default");
    let resolved = resolve(&state, kind, &principal.channel)?;
    let config = resolved.config;

    let recorder = UsageRecorder::new(&state, &principal, "/v1/voice", "POST");
    let key = select_key(&state, &principal, config.provider)?;

    let voice_id = body
        .voice_id
        .or(body.voice)
        .unwrap_or_else(|| state.config.elevenlabs.default_voice.clone());
    let characters = body.text.chars().count() as u32;
    let cost_cents =
        state
            .pricing
            .cost_cents(config.provider, &config.model, Metered::Characters(characters));

    if query.stream.unwrap_or(false) {
        match state
            .providers
            .elevenlabs
            .tts_stream(&body.text, &voice_id, &config.model, &key)
            .await
        {
            Ok(upstream) => {
                let finalizer = StreamFinalizer {
                    recorder,
                    provider: config.provider.as_str(),
                    model: config.model.clone(),
                    cost_cents,
                };
                // The finalizer rides the stream closure; it fires once
                // the body is fully sent or the client goes away.
                let stream = upstream.bytes_stream().inspect(move |_| {
                    let _keep_alive = &finalizer;
                });
                let body = Body::from_stream(stream);
                Ok(([(header::CONTENT_TYPE, "audio/mpeg")], body).into_response())
            }
            Err(err) => {
                let gateway_err: GatewayError = err.into();
                recorder.record(
                    config.provider.as_str(),
                    &config.model,
                    Usage::default(),
                    0,
                    gateway_err.status().as_u16(),
                    Some(gateway_err.to_string()),
                );
                Err(gateway_err)
            }
        }
    } else {
        match state
            .providers
            .elevenlabs
            .tts(&body.text, &voice_id, &config.model, &key)
            .await
        {
            Ok(audio) => {
                recorder.record(
                    config.provider.as_str(),
                    &config.model,
                    Usage::default(),
                    cost_cents,
                    200,
                    None,
                );
                Ok(Json(json!({
                    "audio_base64": BASE64_STANDARD.encode(&audio),
                    "content_type": "audio/mpeg",
                    "characters": characters,
                }))
                .into_response())
            }
            Err(err) => {
                let gateway_err: GatewayError = err.into();
                recorder.record(
                    config.provider.as_str(),
                    &config.model,
                    Usage::default(),
                    0,
                    gateway_err.status().as_u16(),
                    Some(gateway_err.to_string()),
                );
                Err(gateway_err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/ephemeral
// ---------------------------------------------------------------------------

pub async fn ephemeral(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let principal = gate(&state, &headers)?;

    let resolved = resolve(&state, "realtime.default", &principal.channel)?;
    let config = resolved.config;

    let recorder = UsageRecorder::new(&state, &principal, "/v1/ephemeral", "GET");
    let key = select_key(&state, &principal, config.provider)?;

    match state
        .providers
        .openai()
        .create_realtime_session(&config.model, &key)
        .await
    {
        Ok(descriptor) => {
            // Session creation itself is not billed; usage accrues on
            // the realtime connection, which the gateway never sees.
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                0,
                200,
                None,
            );
            Ok(Json(descriptor).into_response())
        }
        Err(err) => {
            let gateway_err: GatewayError = err.into();
            recorder.record(
                config.provider.as_str(),
                &config.model,
                Usage::default(),
                0,
                gateway_err.status().as_u16(),
                Some(gateway_err.to_string()),
            );
            Err(gateway_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    fn test_state() -> AppState {
        let mut config = crate::config::Config::from_env();
        config.operator_key = Some("op-secret".to_string());
        config.database_path = ":memory:".to_string();
        AppState::for_tests(config)
    }

    fn app_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("app-key", "op-secret".parse().unwrap());
        headers
    }

    #[test]
    fn test_gate_orders_auth_before_limits() {
        let state = test_state();
        // No credentials: auth fails before any counter moves.
        let err = gate(&state, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, GatewayError::AuthRequired));
        assert_eq!(state.rate_limiter.remaining("app"), 120);
    }

    #[test]
    fn test_gate_counts_requests() {
        let state = test_state();
        gate(&state, &app_headers()).unwrap();
        gate(&state, &app_headers()).unwrap();
        assert_eq!(state.rate_limiter.remaining("app"), 118);
    }

    #[test]
    fn test_select_key_prefers_principal_key() {
        let mut config = crate::config::Config::from_env();
        config.operator_key = Some("op-secret".to_string());
        config.database_path = ":memory:".to_string();
        config.openai.api_key = "sk-server".to_string();
        let state = AppState::for_tests(config);
        let mut principal = Principal::anonymous("stable");
        principal
            .provider_keys
            .insert(ProviderId::OpenAi, "sk-user".to_string());

        assert_eq!(
            select_key(&state, &principal, ProviderId::OpenAi).unwrap(),
            "sk-user"
        );

        principal.provider_keys.clear();
        assert_eq!(
            select_key(&state, &principal, ProviderId::OpenAi).unwrap(),
            "sk-server"
        );
    }

    #[test]
    fn test_select_key_missing_is_no_api_key() {
        let mut config = crate::config::Config::from_env();
        config.database_path = ":memory:".to_string();
        config.replicate.api_key = String::new();
        let state = AppState::for_tests(config);
        let principal = Principal::anonymous("stable");
        let err = select_key(&state, &principal, ProviderId::Replicate).unwrap_err();
        assert!(matches!(err, GatewayError::NoApiKey(_)));
    }

    #[test]
    fn test_recorder_logs_exactly_once() {
        let state = test_state();
        let principal = Principal {
            user_id: "u1".to_string(),
            kind: PrincipalKind::User,
            channel: "stable".to_string(),
            provider_keys: Default::default(),
        };
        let recorder = UsageRecorder::new(&state, &principal, "/v1/chat", "POST");

        recorder.record("openai", "gpt-4o-mini", Usage::new(10, 5), 3, 200, None);
        // Second finalizer firing is a no-op.
        recorder.record("openai", "gpt-4o-mini", Usage::new(99, 99), 99, 500, None);

        state.usage.flush();
        let entries = state
            .usage
            .query(&crate::store::UsageFilter {
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cost_cents, 3);
        assert_eq!(entries[0].status, 200);
    }

    #[test]
    fn test_recorder_zeroes_cost_on_failure() {
        let state = test_state();
        let principal = Principal {
            user_id: "u2".to_string(),
            kind: PrincipalKind::User,
            channel: "stable".to_string(),
            provider_keys: Default::default(),
        };
        let recorder = UsageRecorder::new(&state, &principal, "/v1/chat", "POST");
        recorder.record(
            "openai",
            "gpt-4o-mini",
            Usage::new(10, 0),
            55,
            502,
            Some("upstream broke".to_string()),
        );

        state.usage.flush();
        let entries = state
            .usage
            .query(&crate::store::UsageFilter {
                user_id: Some("u2".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries[0].cost_cents, 0);
        assert_eq!(entries[0].status, 502);
        assert_eq!(entries[0].error.as_deref(), Some("upstream broke"));
    }

    #[test]
    fn test_app_key_principal_sets_app_id() {
        let state = test_state();
        let principal = Principal {
            user_id: "app".to_string(),
            kind: PrincipalKind::AppKey,
            channel: "stable".to_string(),
            provider_keys: Default::default(),
        };
        let recorder = UsageRecorder::new(&state, &principal, "/v1/chat", "POST");
        recorder.record("openai", "gpt-4o-mini", Usage::default(), 0, 200, None);

        state.usage.flush();
        let entries = state
            .usage
            .query(&crate::store::UsageFilter {
                app_id: Some("app".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
    }
}
