//! Gateway entry point.
//!
//! Wires every service into the shared [`AppState`], builds the axum
//! router with its middleware stack, starts the background maintenance
//! tasks (session reaper, rate-limit sweep, usage flusher, tower sweep,
//! hosted-image cull), and serves until a termination signal arrives.
//! On shutdown in-flight requests drain and the usage buffer gets a
//! final flush.

mod analytics;
mod anthropic;
mod apple;
mod auth;
mod catalog;
mod config;
mod cost_guard;
mod elevenlabs;
mod error;
mod handlers;
mod hosted;
mod openai;
mod pipeline;
mod pricing;
mod providers;
mod rate_limit;
mod replicate;
mod session;
mod state;
mod store;
mod tower;
mod types;
mod usage;

use ::tower::ServiceBuilder;
use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::AppState;

fn create_router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let v1 = Router::new()
        // Sessions and identity
        .route("/validate", post(handlers::validate))
        .route("/validate/refresh", post(handlers::validate_refresh))
        .route("/validate/revoke", post(handlers::validate_revoke))
        .route("/auth/apple", post(handlers::auth_apple))
        // Catalog
        .route("/models", get(handlers::models))
        // Forward endpoints
        .route("/chat", post(pipeline::chat))
        .route("/images", post(pipeline::images))
        .route("/images/hosted/:user_id/:id", get(hosted::serve_hosted_image))
        .route("/images/:id", get(pipeline::image_snapshot))
        .route("/music", post(pipeline::music))
        .route("/voice", post(pipeline::voice))
        .route("/ephemeral", get(pipeline::ephemeral))
        // Analytics (app-key gated)
        .route("/analytics/usage", get(analytics::usage))
        .route("/analytics/costs", get(analytics::costs))
        .route("/analytics/apps", get(analytics::apps))
        .route("/analytics/stats", get(analytics::usage_stats))
        .route("/analytics/dashboard", get(analytics::dashboard))
        .route("/analytics/timeseries", get(analytics::timeseries))
        .route("/analytics/health", get(analytics::health))
        .route("/analytics/cost-status", get(analytics::cost_status))
        // Agent sandbox
        .route("/tower/request", post(tower::tower_request))
        .route("/tower/status", get(tower::tower_status))
        .route("/tower/audit", get(tower::tower_audit));

    Router::new()
        .route("/", get(handlers::health_check))
        .route("/health", get(handlers::health_check))
        .nest("/v1", v1)
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(handlers::request_id_middleware))
                .layer(cors),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    info!("starting gateway on {}", config.bind_address);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .context("invalid bind address")?;

    let state = AppState::new(config)?;
    state.spawn_background_tasks();

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain whatever the flusher has not yet persisted.
    state.usage.flush();
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};
    use axum_test::TestServer;
    use serde_json::{json, Value};

    fn test_state(mutate: impl FnOnce(&mut Config)) -> AppState {
        let mut config = Config::from_env();
        config.database_path = ":memory:".to_string();
        config.operator_key = Some("op-secret".to_string());
        config.signing_secret = Some("sign-secret".to_string());
        // No provider keys unless a test sets one, so dispatch failures
        // are deterministic.
        config.openai.api_key = String::new();
        config.anthropic.api_key = String::new();
        config.xai.api_key = String::new();
        config.replicate.api_key = String::new();
        config.elevenlabs.api_key = String::new();
        config.tower.admin_key = String::new();
        config.tower.agents_path = String::new();
        mutate(&mut config);
        AppState::for_tests(config)
    }

    fn server(state: AppState) -> TestServer {
        TestServer::new(create_router(state).into_make_service()).expect("test server")
    }

    fn app_key() -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("app-key"),
            HeaderValue::from_static("op-secret"),
        )
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let server = server(test_state(|_| {}));
        for path in ["/", "/health"] {
            let response = server.get(path).await;
            response.assert_status_ok();
            let body: Value = response.json();
            assert_eq!(body["status"], "ok");
            assert!(body["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_envelope() {
        let server = server(test_state(|_| {}));
        let response = server.get("/v1/definitely-not-a-route").await;
        response.assert_status(axum::http::StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let server = server(test_state(|_| {}));
        let (name, value) = app_key();

        // Exchange the app key for a session token.
        let response = server.post("/v1/validate").add_header(name, value).await;
        response.assert_status_ok();
        let body: Value = response.json();
        let token = body["sessionToken"].as_str().unwrap().to_string();
        assert_eq!(body["expiresIn"], 900);
        assert_eq!(body["userId"], "app");
        assert_eq!(body["userType"], "app-key");
        assert_eq!(body["channel"], "stable");
        assert_eq!(token.len(), 43);

        let session_header = HeaderName::from_static("session-token");
        let token_value = HeaderValue::from_str(&token).unwrap();

        // The session token authenticates other endpoints.
        let response = server
            .get("/v1/models")
            .add_header(session_header.clone(), token_value.clone())
            .await;
        response.assert_status_ok();

        // Refresh extends, revoke kills.
        let response = server
            .post("/v1/validate/refresh")
            .add_header(session_header.clone(), token_value.clone())
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["expiresIn"], 900);

        let response = server
            .post("/v1/validate/revoke")
            .add_header(session_header.clone(), token_value.clone())
            .await;
        response.assert_status_ok();

        let response = server
            .post("/v1/validate/refresh")
            .add_header(session_header, token_value)
            .await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"], "Invalid or expired session token");
    }

    #[tokio::test]
    async fn test_chat_requires_credentials() {
        let server = server(test_state(|_| {}));
        let response = server
            .post("/v1/chat")
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["code"], "auth_required");
    }

    #[tokio::test]
    async fn test_chat_validation_and_kind_errors() {
        let server = server(test_state(|_| {}));
        let (name, value) = app_key();

        let response = server
            .post("/v1/chat")
            .add_header(name.clone(), value.clone())
            .json(&json!({"messages": []}))
            .await;
        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "validation_failed");

        let response = server
            .post("/v1/chat")
            .add_header(name, value)
            .json(&json!({
                "messages": [{"role": "user", "content": "hi"}],
                "kind": "chat.nonexistent"
            }))
            .await;
        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "kind_not_found");
    }

    #[tokio::test]
    async fn test_chat_without_provider_key_is_500() {
        let server = server(test_state(|_| {}));
        let (name, value) = app_key();

        let response = server
            .post("/v1/chat")
            .add_header(name, value)
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await;
        response.assert_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json();
        assert_eq!(body["code"], "no_api_key");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_with_reset() {
        let server = server(test_state(|config| {
            config.rate_limit.max_requests = 2;
        }));
        let (name, value) = app_key();

        for _ in 0..2 {
            let response = server
                .post("/v1/chat")
                .add_header(name.clone(), value.clone())
                .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
                .await;
            // Fails on the missing provider key, not the window.
            response.assert_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        }

        let response = server
            .post("/v1/chat")
            .add_header(name, value)
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await;
        response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
        let body: Value = response.json();
        assert_eq!(body["code"], "rate_limited");
        let reset = body["resetInSeconds"].as_u64().unwrap();
        assert!((1..=60).contains(&reset));
    }

    #[tokio::test]
    async fn test_cost_cap_rejects_after_spend() {
        let state = test_state(|config| {
            config.cost_limits.daily_usd = 0.01;
        });
        // One recorded cent of spend for the app principal.
        state.usage.log(crate::store::UsageLogEntry {
            id: None,
            ts_ms: chrono::Utc::now().timestamp_millis(),
            user_id: "app".to_string(),
            app_id: Some("app".to_string()),
            endpoint: "/v1/chat".to_string(),
            method: "POST".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            input_tokens: 100,
            output_tokens: 100,
            cost_cents: 1,
            duration_ms: 5,
            status: 200,
            error: None,
        });
        let server = server(state);
        let (name, value) = app_key();

        let response = server
            .post("/v1/chat")
            .add_header(name, value)
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await;
        response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
        let body: Value = response.json();
        assert_eq!(body["code"], "spend_cap_exceeded");
        assert_eq!(body["period"], "daily");
        assert_eq!(body["limit"], 0.01);
        assert!(body["current"].as_f64().unwrap() >= 0.01);
        assert!(body["resetInfo"].as_str().unwrap().contains("resets at"));
    }

    #[tokio::test]
    async fn test_tower_capability_denied_and_audit() {
        let agents_path = std::env::temp_dir().join(format!(
            "aigate-agents-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(
            &agents_path,
            json!([{
                "name": "lucid",
                "key": "lucid-key",
                "capabilities": {"allow": ["claude_api"], "deny": []}
            }])
            .to_string(),
        )
        .unwrap();

        let server = server(test_state(|config| {
            config.tower.agents_path = agents_path.to_string_lossy().to_string();
        }));
        let tower_key = HeaderName::from_static("tower-key");
        let lucid = HeaderValue::from_static("lucid-key");

        let response = server
            .post("/v1/tower/request")
            .add_header(tower_key.clone(), lucid.clone())
            .json(&json!({"capability": "file_write", "payload": {}}))
            .await;
        response.assert_status(axum::http::StatusCode::FORBIDDEN);
        let body: Value = response.json();
        assert_eq!(body["code"], "capability_denied");

        // The denial is visible in the agent's own audit trail.
        let response = server
            .get("/v1/tower/audit")
            .add_header(tower_key.clone(), lucid.clone())
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries[0]["capability"], "file_write");
        assert_eq!(entries[0]["success"], false);

        // Status only shows the caller's own row for non-admin agents.
        let response = server
            .get("/v1/tower/status")
            .add_header(tower_key, lucid)
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        let agents = body["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["name"], "lucid");

        std::fs::remove_file(&agents_path).ok();
    }

    #[tokio::test]
    async fn test_tower_requires_key() {
        let server = server(test_state(|_| {}));
        let response = server
            .post("/v1/tower/request")
            .json(&json!({"capability": "claude_api", "payload": {}}))
            .await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_analytics_gated_by_app_key() {
        let server = server(test_state(|_| {}));

        let response = server.get("/v1/analytics/health").await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);

        let (name, value) = app_key();
        let response = server
            .get("/v1/analytics/health")
            .add_header(name, value)
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["log_entries"], 0);
    }

    #[tokio::test]
    async fn test_channel_fallback_reaches_provider_selection() {
        // beta lacks image kinds; the stable entry resolves and the
        // request proceeds to key selection.
        let server = server(test_state(|_| {}));
        let (name, value) = app_key();

        let response = server
            .post("/v1/images")
            .add_header(name, value)
            .add_header(
                HeaderName::from_static("model-channel"),
                HeaderValue::from_static("beta"),
            )
            .json(&json!({"prompt": "a lighthouse at dusk"}))
            .await;
        response.assert_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json();
        assert_eq!(body["code"], "no_api_key");
    }

    #[tokio::test]
    async fn test_request_id_header_roundtrip() {
        let server = server(test_state(|_| {}));

        let response = server
            .get("/health")
            .add_header(
                HeaderName::from_static("request-id"),
                HeaderValue::from_static("abc123"),
            )
            .await;
        assert_eq!(response.header("request-id"), "abc123");

        let response = server.get("/health").await;
        let minted = response.header("request-id");
        assert_eq!(minted.to_str().unwrap().len(), 32);
    }
}
