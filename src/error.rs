//! Gateway Error Taxonomy
//!
//! Every failure a request can hit is represented here and mapped to a
//! stable machine-readable `code` plus an HTTP status. Handlers return
//! `Result<_, GatewayError>` and axum renders the JSON envelope through
//! the `IntoResponse` impl, so the response schema is uniform across
//! the whole surface:
//!
//! ```json
//! { "error": "Rate limit exceeded", "code": "rate_limited", "resetInSeconds": 17 }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Spend-cap period that tripped a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl SpendPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpendPeriod::Daily => "daily",
            SpendPeriod::Weekly => "weekly",
            SpendPeriod::Monthly => "monthly",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Invalid credentials")]
    AuthInvalid,

    #[error("Invalid or expired session token")]
    SessionExpired,

    #[error("Server authentication secret not configured")]
    AuthMisconfigured,

    /// Platform identity token presented for an app outside the allow-list.
    #[error("Application not authorized for identity exchange")]
    AuthUnauthorizedApp,

    #[error("Rate limit exceeded")]
    RateLimited { reset_in_seconds: u64 },

    #[error("Spend cap exceeded")]
    SpendCapExceeded {
        period: SpendPeriod,
        /// Configured ceiling in USD.
        limit: f64,
        /// Current spend in USD.
        current: f64,
        /// Human-readable description of the next window boundary.
        reset_info: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error("Unknown model kind: {0}")]
    KindNotFound(String),

    #[error("No API key configured for provider: {0}")]
    NoApiKey(String),

    #[error("Provider returned status {status}")]
    Provider { status: u16, body: String },

    #[error("Provider request timed out")]
    ProviderTimeout,

    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable error code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthRequired => "auth_required",
            GatewayError::AuthInvalid | GatewayError::SessionExpired => "auth_invalid",
            GatewayError::AuthMisconfigured => "auth_misconfigured",
            GatewayError::AuthUnauthorizedApp => "auth_unauthorized_app",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::SpendCapExceeded { .. } => "spend_cap_exceeded",
            GatewayError::Validation(_) => "validation_failed",
            GatewayError::KindNotFound(_) => "kind_not_found",
            GatewayError::NoApiKey(_) => "no_api_key",
            GatewayError::Provider { .. } => "provider_error",
            GatewayError::ProviderTimeout => "provider_timeout",
            GatewayError::CapabilityDenied(_) => "capability_denied",
            GatewayError::NotFound => "not_found",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthRequired
            | GatewayError::AuthInvalid
            | GatewayError::SessionExpired
            | GatewayError::AuthUnauthorizedApp => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } | GatewayError::SpendCapExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Validation(_) | GatewayError::KindNotFound(_) => StatusCode::BAD_REQUEST,
            GatewayError::CapabilityDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::AuthMisconfigured
            | GatewayError::NoApiKey(_)
            | GatewayError::Provider { .. }
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });

        // Variant-specific payload fields per the error contract.
        match &self {
            GatewayError::RateLimited { reset_in_seconds } => {
                body["resetInSeconds"] = json!(reset_in_seconds);
            }
            GatewayError::SpendCapExceeded {
                period,
                limit,
                current,
                reset_info,
            } => {
                body["period"] = json!(period.as_str());
                body["limit"] = json!(limit);
                body["current"] = json!(current);
                body["resetInfo"] = json!(reset_info);
            }
            GatewayError::Provider {
                status: upstream, ..
            } => {
                body["upstreamStatus"] = json!(upstream);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
