//! Agent sandbox ("tower"): a capability-scoped variant of the pipeline
//! for automated agents.
//!
//! Agents authenticate with a per-agent secret, are gated by allow/deny
//! capability lists, hourly/daily request windows, and a daily spend
//! ceiling with a soft-cap projection, and every request lands in a
//! bounded audit ring (newest first). The `claude_api` capability runs
//! Anthropic chat through the shared adapter; the remaining capabilities
//! are declared but return a `not_implemented` envelope without
//! accruing cost.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::secrets_match;
use crate::config::Config;
use crate::error::{GatewayError, SpendPeriod};
use crate::pricing::{estimate_tokens, Metered};
use crate::providers::{AdapterRequest, ProviderAdapter};
use crate::state::AppState;
use crate::store::UsageLogEntry;
use crate::types::{ChatMessage, GenerationOptions, ProviderId, Usage};

pub const AUDIT_CAPACITY: usize = 1000;
pub const TOWER_KEY_HEADER: &str = "tower-key";
/// Accepted as an alias for clients that predate the rename.
pub const AGENT_KEY_HEADER: &str = "agent-key";
/// Projected-cost tolerance over the daily cap.
pub const SOFT_CAP_FACTOR: f64 = 1.10;
const IDLE_SWEEP_AFTER_DAYS: i64 = 7;
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(3600);

/// Capabilities declared but not yet wired to a handler.
pub const STUB_CAPABILITIES: [&str; 6] = [
    "claude_code",
    "image_gen",
    "web_search",
    "web_fetch",
    "file_read",
    "file_write",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentLimits {
    pub daily_spend_usd: f64,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub max_tokens_per_request: u32,
    pub max_concurrent_sessions: u32,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            daily_spend_usd: 5.0,
            requests_per_hour: 60,
            requests_per_day: 500,
            max_tokens_per_request: 4096,
            max_concurrent_sessions: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Agent secret; never serialized back out.
    pub key: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub limits: AgentLimits,
}

/// Deny wins; `"*"` in allow grants anything not denied; otherwise the
/// capability must be listed.
pub fn has_capability(allow: &[String], deny: &[String], capability: &str) -> bool {
    if deny.iter().any(|c| c == capability) {
        return false;
    }
    allow.iter().any(|c| c == "*" || c == capability)
}

/// Per-agent fixed-window counters and spend accumulator.
#[derive(Debug, Clone)]
pub struct AgentSpend {
    pub spend_today_usd: f64,
    pub requests_today: u32,
    pub requests_this_hour: u32,
    pub last_active: DateTime<Utc>,
    pub hour_reset: DateTime<Utc>,
    pub day_reset: DateTime<Utc>,
}

impl AgentSpend {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            spend_today_usd: 0.0,
            requests_today: 0,
            requests_this_hour: 0,
            last_active: now,
            hour_reset: now + Duration::hours(1),
            day_reset: now + Duration::days(1),
        }
    }

    /// Zero any counter whose reset instant has passed, advancing the
    /// instant one window at a time.
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        while now >= self.hour_reset {
            self.hour_reset += Duration::hours(1);
            self.requests_this_hour = 0;
        }
        while now >= self.day_reset {
            self.day_reset += Duration::days(1);
            self.requests_today = 0;
            self.spend_today_usd = 0.0;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub ts_ms: i64,
    pub agent: String,
    pub capability: String,
    pub summary: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

#[derive(Clone)]
pub struct TowerState {
    agents: Arc<HashMap<String, AgentProfile>>,
    tracking: Arc<Mutex<HashMap<String, AgentSpend>>>,
    audit: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl TowerState {
    pub fn new(agents: Vec<AgentProfile>) -> Self {
        Self {
            agents: Arc::new(agents.into_iter().map(|a| (a.name.clone(), a)).collect()),
            tracking: Arc::new(Mutex::new(HashMap::new())),
            audit: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Agents from the profile file plus the built-in wildcard admin.
    pub fn from_config(config: &Config) -> Self {
        let mut agents = Vec::new();

        if !config.tower.agents_path.is_empty() {
            match std::fs::read_to_string(&config.tower.agents_path) {
                Ok(raw) => match serde_json::from_str::<Vec<AgentProfile>>(&raw) {
                    Ok(parsed) => agents = parsed,
                    Err(err) => warn!("agent profile file parse failed: {}", err),
                },
                Err(err) => warn!(
                    path = %config.tower.agents_path,
                    "agent profile file unreadable: {}", err
                ),
            }
        }

        if !config.tower.admin_key.is_empty() {
            agents.push(AgentProfile {
                name: "admin".to_string(),
                display_name: Some("Administrator".to_string()),
                key: config.tower.admin_key.clone(),
                capabilities: CapabilitySet {
                    allow: vec!["*".to_string()],
                    deny: vec![],
                },
                limits: AgentLimits {
                    daily_spend_usd: 100.0,
                    requests_per_hour: 600,
                    requests_per_day: 5000,
                    ..AgentLimits::default()
                },
            });
        }

        info!(agents = agents.len(), "tower agents loaded");
        Self::new(agents)
    }

    /// Resolve the agent behind a `tower-key` (or legacy `agent-key`)
    /// header by constant-time comparison against every agent secret.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<&AgentProfile, GatewayError> {
        let presented = headers
            .get(TOWER_KEY_HEADER)
            .or_else(|| headers.get(AGENT_KEY_HEADER))
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::AuthRequired)?;

        self.agents
            .values()
            .find(|agent| secrets_match(presented, &agent.key))
            .ok_or(GatewayError::AuthInvalid)
    }

    pub fn is_admin(agent: &AgentProfile) -> bool {
        agent.name == "admin"
    }

    /// Count one request against the agent's hourly and daily windows.
    pub fn check_request_windows(&self, agent: &AgentProfile) -> Result<(), GatewayError> {
        let now = Utc::now();
        let mut tracking = self.tracking.lock().expect("tower tracking poisoned");
        let spend = tracking
            .entry(agent.name.clone())
            .or_insert_with(|| AgentSpend::fresh(now));
        spend.roll_windows(now);

        spend.requests_this_hour += 1;
        spend.requests_today += 1;
        spend.last_active = now;

        if spend.requests_this_hour > agent.limits.requests_per_hour {
            let reset = ((spend.hour_reset - now).num_milliseconds() as f64 / 1000.0).ceil();
            return Err(GatewayError::RateLimited {
                reset_in_seconds: (reset as u64).max(1),
            });
        }
        if spend.requests_today > agent.limits.requests_per_day {
            let reset = ((spend.day_reset - now).num_milliseconds() as f64 / 1000.0).ceil();
            return Err(GatewayError::RateLimited {
                reset_in_seconds: (reset as u64).max(1),
            });
        }
        Ok(())
    }

    /// Daily spend ceiling plus the soft-cap projection: a projected
    /// total beyond `cap × 1.10` rejects only when today's spend is
    /// already non-zero, so the first request of the day always runs.
    pub fn check_affordability(
        &self,
        agent: &AgentProfile,
        projected_cost_usd: f64,
    ) -> Result<(), GatewayError> {
        let now = Utc::now();
        let cap = agent.limits.daily_spend_usd;
        let mut tracking = self.tracking.lock().expect("tower tracking poisoned");
        let spend = tracking
            .entry(agent.name.clone())
            .or_insert_with(|| AgentSpend::fresh(now));
        spend.roll_windows(now);

        let reset_info = format!("resets at {}", spend.day_reset.to_rfc3339());
        if spend.spend_today_usd >= cap {
            return Err(GatewayError::SpendCapExceeded {
                period: SpendPeriod::Daily,
                limit: cap,
                current: spend.spend_today_usd,
                reset_info,
            });
        }
        if spend.spend_today_usd > 0.0
            && spend.spend_today_usd + projected_cost_usd > cap * SOFT_CAP_FACTOR
        {
            return Err(GatewayError::SpendCapExceeded {
                period: SpendPeriod::Daily,
                limit: cap,
                current: spend.spend_today_usd,
                reset_info,
            });
        }
        Ok(())
    }

    /// Add an accounted cost to today's accumulator; returns the new
    /// total and the remaining headroom.
    pub fn record_spend(&self, agent: &AgentProfile, cost_usd: f64) -> (f64, f64) {
        let now = Utc::now();
        let mut tracking = self.tracking.lock().expect("tower tracking poisoned");
        let spend = tracking
            .entry(agent.name.clone())
            .or_insert_with(|| AgentSpend::fresh(now));
        spend.roll_windows(now);
        spend.spend_today_usd += cost_usd;
        spend.last_active = now;
        let total = spend.spend_today_usd;
        (total, (agent.limits.daily_spend_usd - total).max(0.0))
    }

    pub fn spend_snapshot(&self, name: &str) -> Option<AgentSpend> {
        let mut tracking = self.tracking.lock().expect("tower tracking poisoned");
        tracking.get_mut(name).map(|spend| {
            spend.roll_windows(Utc::now());
            spend.clone()
        })
    }

    pub fn push_audit(&self, entry: AuditEntry) {
        let mut audit = self.audit.lock().expect("tower audit poisoned");
        audit.push_front(entry);
        audit.truncate(AUDIT_CAPACITY);
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .expect("tower audit poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentProfile> {
        self.agents.values()
    }

    /// Drop tracking records idle for more than a week.
    pub fn sweep_idle(&self) -> usize {
        let cutoff = Utc::now() - Duration::days(IDLE_SWEEP_AFTER_DAYS);
        let mut tracking = self.tracking.lock().expect("tower tracking poisoned");
        let before = tracking.len();
        tracking.retain(|_, spend| spend.last_active > cutoff);
        before - tracking.len()
    }

    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let tower = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tower.sweep_idle();
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TowerRequestBody {
    pub capability: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeApiPayload {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
}

/// POST /v1/tower/request
pub async fn tower_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TowerRequestBody>,
) -> Result<Response, GatewayError> {
    let agent = state.tower.authenticate(&headers)?.clone();
    let start = Instant::now();
    let ts_ms = Utc::now().timestamp_millis();

    state.tower.check_request_windows(&agent)?;

    if !has_capability(
        &agent.capabilities.allow,
        &agent.capabilities.deny,
        &body.capability,
    ) {
        state.tower.push_audit(AuditEntry {
            id: Uuid::new_v4().to_string(),
            ts_ms,
            agent: agent.name.clone(),
            capability: body.capability.clone(),
            summary: "capability denied".to_string(),
            cost_usd: 0.0,
            duration_ms: start.elapsed().as_millis() as u64,
            success: false,
            error: Some("capability_denied".to_string()),
            session_id: body.session_id.clone(),
            tokens: None,
        });
        return Err(GatewayError::CapabilityDenied(body.capability));
    }

    if body.capability != "claude_api" {
        // Declared-but-stubbed capabilities: no dispatch, no cost.
        let status = if STUB_CAPABILITIES.contains(&body.capability.as_str()) {
            "not_implemented"
        } else {
            "unknown_capability"
        };
        state.tower.push_audit(AuditEntry {
            id: Uuid::new_v4().to_string(),
            ts_ms,
            agent: agent.name.clone(),
            capability: body.capability.clone(),
            summary: status.replace('_', " "),
            cost_usd: 0.0,
            duration_ms: start.elapsed().as_millis() as u64,
            success: true,
            error: None,
            session_id: body.session_id,
            tokens: None,
        });
        return Ok(Json(json!({
            "status": status,
            "capability": body.capability,
            "result": Value::Null,
        }))
        .into_response());
    }

    let payload: ClaudeApiPayload = serde_json::from_value(body.payload)
        .map_err(|err| GatewayError::Validation(format!("invalid claude_api payload: {}", err)))?;
    if payload.messages.is_empty() {
        return Err(GatewayError::Validation(
            "messages must be a non-empty array".to_string(),
        ));
    }

    let model = payload
        .model
        .unwrap_or_else(|| state.config.tower.default_model.clone());
    let max_tokens = payload
        .max_tokens
        .unwrap_or(agent.limits.max_tokens_per_request)
        .min(agent.limits.max_tokens_per_request);

    // Worst-case projection: estimated input plus the full output budget.
    let input_estimate: u32 = payload
        .messages
        .iter()
        .map(|m| estimate_tokens(&m.content.text()))
        .sum();
    let projected_usd = state.pricing.cost_usd(
        ProviderId::Anthropic,
        &model,
        Metered::Tokens(Usage::new(input_estimate, max_tokens)),
    );
    state.tower.check_affordability(&agent, projected_usd)?;

    let key = state
        .config
        .provider_key(ProviderId::Anthropic)
        .ok_or_else(|| GatewayError::NoApiKey(ProviderId::Anthropic.as_str().to_string()))?
        .to_string();

    let request = AdapterRequest {
        model: model.clone(),
        messages: payload.messages,
        options: GenerationOptions {
            temperature: payload.temperature,
            max_tokens: Some(max_tokens),
        },
    };

    match state.providers.anthropic().complete(&request, &key).await {
        Ok(completion) => {
            let tokens = completion.usage;
            let cost_usd = state.pricing.cost_usd(
                ProviderId::Anthropic,
                &model,
                Metered::Tokens(tokens),
            );
            let (spend_total, spend_remaining) = state.tower.record_spend(&agent, cost_usd);

            state.usage.log(UsageLogEntry {
                id: None,
                ts_ms,
                user_id: format!("agent:{}", agent.name),
                app_id: None,
                endpoint: "/v1/tower/request".to_string(),
                method: "POST".to_string(),
                provider: ProviderId::Anthropic.as_str().to_string(),
                model: model.clone(),
                input_tokens: tokens.prompt_tokens,
                output_tokens: tokens.completion_tokens,
                cost_cents: (cost_usd * 100.0).round() as i64,
                duration_ms: start.elapsed().as_millis() as u64,
                status: 200,
                error: None,
            });
            state.tower.push_audit(AuditEntry {
                id: Uuid::new_v4().to_string(),
                ts_ms,
                agent: agent.name.clone(),
                capability: "claude_api".to_string(),
                summary: format!("{} tokens via {}", tokens.total_tokens, model),
                cost_usd,
                duration_ms: start.elapsed().as_millis() as u64,
                success: true,
                error: None,
                session_id: body.session_id,
                tokens: Some(tokens.total_tokens),
            });

            Ok(Json(json!({
                "status": "ok",
                "result": completion,
                "meta": {
                    "tokens_used": tokens.total_tokens,
                    "cost_estimate": cost_usd,
                    "daily_spend_total": spend_total,
                    "daily_spend_remaining": spend_remaining,
                }
            }))
            .into_response())
        }
        Err(err) => {
            let gateway_err: GatewayError = err.into();
            state.usage.log(UsageLogEntry {
                id: None,
                ts_ms,
                user_id: format!("agent:{}", agent.name),
                app_id: None,
                endpoint: "/v1/tower/request".to_string(),
                method: "POST".to_string(),
                provider: ProviderId::Anthropic.as_str().to_string(),
                model: model.clone(),
                input_tokens: 0,
                output_tokens: 0,
                cost_cents: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                status: gateway_err.status().as_u16(),
                error: Some(gateway_err.to_string()),
            });
            state.tower.push_audit(AuditEntry {
                id: Uuid::new_v4().to_string(),
                ts_ms,
                agent: agent.name.clone(),
                capability: "claude_api".to_string(),
                summary: "upstream failure".to_string(),
                cost_usd: 0.0,
                duration_ms: start.elapsed().as_millis() as u64,
                success: false,
                error: Some(gateway_err.to_string()),
                session_id: body.session_id,
                tokens: None,
            });
            Err(gateway_err)
        }
    }
}

fn agent_status_json(state: &AppState, agent: &AgentProfile) -> Value {
    let spend = state.tower.spend_snapshot(&agent.name);
    let (spend_today, requests_today, requests_this_hour, last_active) = match &spend {
        Some(s) => (
            s.spend_today_usd,
            s.requests_today,
            s.requests_this_hour,
            Some(s.last_active.to_rfc3339()),
        ),
        None => (0.0, 0, 0, None),
    };
    json!({
        "name": agent.name,
        "display_name": agent.display_name,
        "capabilities": agent.capabilities,
        "limits": agent.limits,
        "spend_today": spend_today,
        "spend_remaining": (agent.limits.daily_spend_usd - spend_today).max(0.0),
        "requests_today": requests_today,
        "requests_this_hour": requests_this_hour,
        "last_active": last_active,
    })
}

/// GET /v1/tower/status — admin sees every agent, others only themselves.
pub async fn tower_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let agent = state.tower.authenticate(&headers)?.clone();

    let agents: Vec<Value> = if TowerState::is_admin(&agent) {
        state
            .tower
            .agents()
            .map(|a| agent_status_json(&state, a))
            .collect()
    } else {
        vec![agent_status_json(&state, &agent)]
    };

    Ok(Json(json!({ "agents": agents })).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub agent: Option<String>,
    pub capability: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

/// GET /v1/tower/audit — filtered entries plus a one-hour summary and
/// today's per-agent stats.
pub async fn tower_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Response, GatewayError> {
    let agent = state.tower.authenticate(&headers)?.clone();
    let is_admin = TowerState::is_admin(&agent);

    // Non-admin agents only ever see their own trail.
    let agent_filter = if is_admin {
        query.agent
    } else {
        Some(agent.name.clone())
    };

    let entries = state.tower.audit_entries();
    let hour_ago = (Utc::now() - Duration::hours(1)).timestamp_millis();

    let mut hour_requests = 0u64;
    let mut hour_cost = 0.0f64;
    let mut hour_errors = 0u64;
    for entry in &entries {
        let visible = agent_filter
            .as_deref()
            .map_or(true, |name| entry.agent == name);
        if visible && entry.ts_ms >= hour_ago {
            hour_requests += 1;
            hour_cost += entry.cost_usd;
            if !entry.success {
                hour_errors += 1;
            }
        }
    }

    let filtered: Vec<&AuditEntry> = entries
        .iter()
        .filter(|e| agent_filter.as_deref().map_or(true, |name| e.agent == name))
        .filter(|e| {
            query
                .capability
                .as_deref()
                .map_or(true, |cap| e.capability == cap)
        })
        .filter(|e| query.success.map_or(true, |s| e.success == s))
        .take(query.limit.unwrap_or(100).min(AUDIT_CAPACITY))
        .collect();

    let today = state.tower.spend_snapshot(&agent.name);
    Ok(Json(json!({
        "entries": filtered,
        "summary": {
            "last_hour": {
                "requests": hour_requests,
                "cost_usd": hour_cost,
                "errors": hour_errors,
            }
        },
        "today": {
            "requests": today.as_ref().map(|s| s.requests_today).unwrap_or(0),
            "spend_usd": today.as_ref().map(|s| s.spend_today_usd).unwrap_or(0.0),
        }
    }))
    .into_response())
}
