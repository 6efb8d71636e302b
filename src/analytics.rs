//! Read-only analytics surface over the usage log.
//!
//! Every endpoint is gated by the operator app-key. Queries run against
//! the durable log (after a flush) and aggregate with the same stats
//! machinery the usage subsystem exposes; nothing here mutates state.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Local, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{secrets_match, APP_KEY_HEADER};
use crate::cost_guard::{day_start_ms, month_start_ms, week_start_ms};
use crate::error::GatewayError;
use crate::state::AppState;
use crate::store::UsageFilter;
use crate::usage::stats;

/// Admin gate: analytics requires the operator app-key.
fn require_app_key(state: &AppState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let presented = headers
        .get(APP_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::AuthRequired)?;
    let expected = state
        .config
        .operator_key
        .as_deref()
        .ok_or(GatewayError::AuthMisconfigured)?;
    if !secrets_match(presented, expected) {
        return Err(GatewayError::AuthInvalid);
    }
    Ok(())
}

/// GET /v1/analytics/usage — raw entries matching the filter.
pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<UsageFilter>,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;
    let entries = state
        .usage
        .query(&filter)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    let count = entries.len();
    Ok(Json(json!({ "entries": entries, "count": count })).into_response())
}

/// GET /v1/analytics/stats — aggregation over the filtered entries.
pub async fn usage_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut filter): Query<UsageFilter>,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;
    filter.limit = filter.limit.or(Some(10_000));
    let entries = state
        .usage
        .query(&filter)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    Ok(Json(json!(stats(&entries))).into_response())
}

/// GET /v1/analytics/costs — summed cost per provider and per model.
pub async fn costs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut filter): Query<UsageFilter>,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;
    filter.limit = filter.limit.or(Some(10_000));
    let entries = state
        .usage
        .query(&filter)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    let aggregated = stats(&entries);
    Ok(Json(json!({
        "total_cost_usd": aggregated.total_cost_usd,
        "by_provider": aggregated.by_provider,
        "by_model": aggregated.by_model,
    }))
    .into_response())
}

/// GET /v1/analytics/apps — per-app request and cost breakdown.
pub async fn apps(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut filter): Query<UsageFilter>,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;
    filter.limit = filter.limit.or(Some(10_000));
    let entries = state
        .usage
        .query(&filter)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    Ok(Json(json!({ "apps": stats(&entries).by_app })).into_response())
}

/// GET /v1/analytics/dashboard — today/week/month totals plus top
/// breakdowns, the single-call overview.
pub async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;

    let now_local = Local::now();
    let now_ms = Utc::now().timestamp_millis() + 1;
    let mut windows = serde_json::Map::new();
    for (label, start) in [
        ("today", day_start_ms(now_local)),
        ("week", week_start_ms(now_local)),
        ("month", month_start_ms(now_local)),
    ] {
        let entries = state
            .usage
            .query(&UsageFilter {
                start: Some(start),
                end: Some(now_ms),
                limit: Some(100_000),
                ..Default::default()
            })
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        windows.insert(label.to_string(), json!(stats(&entries)));
    }

    Ok(Json(json!({
        "windows": windows,
        "sessions": state.sessions.stats(),
        "log_entries": state.usage.count().map_err(|e| GatewayError::Internal(e.to_string()))?,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub user_id: Option<String>,
    pub provider: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// "hour" (default) or "day".
    pub bucket: Option<String>,
}

/// GET /v1/analytics/timeseries — request/cost counts bucketed by hour
/// or day over the filter window.
pub async fn timeseries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TimeseriesQuery>,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;

    let bucket_ms: i64 = match query.bucket.as_deref() {
        None | Some("hour") => 3600 * 1000,
        Some("day") => 24 * 3600 * 1000,
        Some(other) => {
            return Err(GatewayError::Validation(format!(
                "unknown bucket: {} (expected hour or day)",
                other
            )))
        }
    };

    let filter = UsageFilter {
        user_id: query.user_id,
        provider: query.provider,
        start: query.start,
        end: query.end,
        limit: Some(100_000),
        ..Default::default()
    };
    let entries = state
        .usage
        .query(&filter)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

    let mut buckets: BTreeMap<i64, (u64, f64)> = BTreeMap::new();
    for entry in &entries {
        let slot = buckets.entry(entry.ts_ms - entry.ts_ms.rem_euclid(bucket_ms)).or_default();
        slot.0 += 1;
        slot.1 += entry.cost_cents as f64 / 100.0;
    }

    let points: Vec<_> = buckets
        .into_iter()
        .map(|(ts_ms, (requests, cost_usd))| {
            json!({ "ts_ms": ts_ms, "requests": requests, "cost_usd": cost_usd })
        })
        .collect();
    Ok(Json(json!({ "points": points })).into_response())
}

/// GET /v1/analytics/health — log liveness counters.
pub async fn health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;
    Ok(Json(json!({
        "status": "ok",
        "log_entries": state.usage.count().map_err(|e| GatewayError::Internal(e.to_string()))?,
        "buffered": state.usage.buffered(),
        "sessions": state.sessions.stats(),
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CostStatusQuery {
    pub user_id: String,
}

/// GET /v1/analytics/cost-status — one user's spend against the
/// configured ceilings.
pub async fn cost_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CostStatusQuery>,
) -> Result<Response, GatewayError> {
    require_app_key(&state, &headers)?;

    let (daily, weekly, monthly) = state
        .cost_guard
        .current_spend_cents(&query.user_id)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    let limits = state.cost_guard.limits();

    Ok(Json(json!({
        "user_id": query.user_id,
        "daily":   { "spent_usd": daily as f64 / 100.0,   "limit_usd": limits.daily_usd },
        "weekly":  { "spent_usd": weekly as f64 / 100.0,  "limit_usd": limits.weekly_usd },
        "monthly": { "spent_usd": monthly as f64 / 100.0, "limit_usd": limits.monthly_usd },
    }))
    .into_response())
}
