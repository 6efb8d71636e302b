//! AI-provider gateway library.
//!
//! A single HTTP server that authenticates callers, resolves a logical
//! model kind to a concrete upstream provider and model, forwards the
//! request, and records the outcome for usage analytics and spend
//! enforcement. The library surface exists for the binary and for
//! integration tests; the modules mirror the request path:
//!
//! - `auth`, `apple`, `session` — who is calling
//! - `rate_limit`, `cost_guard` — whether they may call
//! - `catalog`, `pricing` — where the call routes and what it costs
//! - `providers` + per-upstream adapters — the call itself
//! - `usage`, `store`, `analytics` — what happened
//! - `tower` — the capability-scoped agent variant of all of the above

pub mod analytics;
pub mod anthropic;
pub mod apple;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod cost_guard;
pub mod elevenlabs;
pub mod error;
pub mod handlers;
pub mod hosted;
pub mod openai;
pub mod pipeline;
pub mod pricing;
pub mod providers;
pub mod rate_limit;
pub mod replicate;
pub mod session;
pub mod state;
pub mod store;
pub mod tower;
pub mod types;
pub mod usage;

/// Smoke test: the core services initialize and cooperate.
#[test]
fn test_basic_wiring() {
    use crate::catalog::Catalog;
    use crate::pricing::{estimate_tokens, Metered, PricingTable};
    use crate::types::{ProviderId, Usage};

    let catalog = Catalog::default_catalog();
    let resolved = catalog.resolve("chat.default", "stable").unwrap();
    assert_eq!(resolved.config.provider, ProviderId::OpenAi);

    // Pricing covers every default catalog entry with a non-default rate
    // path for chat models.
    let pricing = PricingTable::default_table();
    let cost = pricing.cost_cents(
        resolved.config.provider,
        &resolved.config.model,
        Metered::Tokens(Usage::new(1_000_000, 0)),
    );
    assert!(cost > 0);

    assert_eq!(estimate_tokens("twelve chars"), 3);
}

#[test]
fn test_state_construction() {
    let mut config = crate::config::Config::from_env();
    config.database_path = ":memory:".to_string();
    config.operator_key = Some("op".to_string());

    let state = crate::state::AppState::for_tests(config);
    assert_eq!(state.sessions.stats().total, 0);
    assert_eq!(state.usage.buffered(), 0);
    assert!(state.catalog.resolve("voice.default", "stable").is_ok());
}
