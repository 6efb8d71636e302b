//! Configuration Management Module
//!
//! This module handles loading and parsing of all application configuration
//! from environment variables. It provides:
//! - Type-safe configuration structures for all services
//! - Environment variable parsing with defaults
//! - Support for boolean, numeric, and CSV parsing
//!
//! Configuration is loaded once at startup and shared across all services.

use serde::{Deserialize, Serialize};
use std::env;

use crate::types::ProviderId;

/// Get environment variable value or fallback to default.
pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// Parse boolean values from environment variables.
///
/// True: "1", "true", "TRUE". False: "0", "false", "FALSE".
/// Invalid/missing values use the fallback.
pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

/// Parse comma-separated values from environment variables.
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn num_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

/// OpenAI service configuration
///
/// Serves chat completions and the realtime ephemeral-session exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Server-default API key (empty when unset)
    pub api_key: String,
    /// Base URL for OpenAI API (allows for compatible services)
    pub base_url: String,
}

/// xAI (Grok) service configuration
///
/// OpenAI-compatible chat API; shares the pass-through adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XaiConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Anthropic (Claude) service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    /// API version string (Anthropic uses versioned APIs)
    pub version: String,
}

/// Replicate service configuration (image predictions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateConfig {
    pub api_key: String,
    pub base_url: String,
}

/// ElevenLabs service configuration (music generation and TTS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    pub base_url: String,
    /// Default voice id used when the request names none
    pub default_voice: String,
}

/// Per-principal spend ceilings in USD, derived from the usage log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostLimits {
    pub daily_usd: f64,
    pub weekly_usd: f64,
    pub monthly_usd: f64,
}

/// Fixed-window rate limit knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

/// Hosted-image registry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedImageConfig {
    pub enabled: bool,
    /// Directory files are written under, keyed `user-id/image-id`
    pub dir: String,
    /// Per-user image count ceiling
    pub max_per_user: u32,
    /// Age-based cull threshold in hours
    pub max_age_hours: u32,
}

/// Agent-sandbox (tower) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TowerConfig {
    /// Secret for the built-in wildcard `admin` agent (empty disables it)
    pub admin_key: String,
    /// Path to the JSON agent-profile file (empty = no file-defined agents)
    pub agents_path: String,
    /// Model used by the `claude_api` capability when the payload names none
    pub default_model: String,
}

/// Main application configuration structure
///
/// Contains everything needed to run the gateway: HTTP server settings,
/// authentication secrets, per-provider credentials, spend ceilings,
/// rate limits, session TTL, and the durable-log path. Loaded once at
/// startup from environment variables and shared across all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server bind address (host:port)
    pub bind_address: String,
    /// List of allowed CORS origins for cross-origin requests
    pub allowed_origins: Vec<String>,
    /// Operator app-shared secret (`app-key` header)
    pub operator_key: Option<String>,
    /// Secret key for bearer-token signing and verification
    pub signing_secret: Option<String>,
    /// Session TTL in seconds (default 900 = 15 minutes)
    pub session_ttl_secs: u64,
    /// Allowed bundle ids for platform-identity exchange (empty = any)
    pub apple_bundle_ids: Vec<String>,
    /// Path to the durable usage-log database (":memory:" for tests)
    pub database_path: String,
    /// Reject requests when the spend-ceiling query fails, instead of
    /// the default admit-and-warn behavior
    pub cost_fail_closed: bool,

    pub cost_limits: CostLimits,
    pub rate_limit: RateLimitConfig,
    pub hosted_images: HostedImageConfig,
    pub tower: TowerConfig,

    // Upstream provider configurations
    pub openai: OpenAiConfig,
    pub xai: XaiConfig,
    pub anthropic: AnthropicConfig,
    pub replicate: ReplicateConfig,
    pub elevenlabs: ElevenLabsConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads a `.env` file when present, then reads every knob with a
    /// sensible default. Never panics; authenticated paths fail at
    /// request time with `auth_misconfigured` when no secret is set.
    ///
    /// # Environment Variables
    ///
    /// ## Server
    /// - `BIND_ADDRESS`: bind address (default "127.0.0.1:8080")
    /// - `ALLOWED_ORIGINS`: comma-separated CORS origins
    /// - `DATABASE_PATH`: durable log path (default "aigate.db")
    ///
    /// ## Authentication
    /// - `OPERATOR_KEY`: app-shared secret for the `app-key` header
    /// - `SIGNING_SECRET`: HS256 secret for bearer tokens
    /// - `SESSION_TTL_SECS`: session lifetime (default 900)
    /// - `APPLE_BUNDLE_IDS`: allow-listed bundle ids for identity exchange
    ///
    /// ## Quotas
    /// - `DAILY_COST_LIMIT` / `WEEKLY_COST_LIMIT` / `MONTHLY_COST_LIMIT`:
    ///   spend ceilings in USD (defaults 10 / 50 / 200)
    /// - `RATE_LIMIT_WINDOW_SECS` / `RATE_LIMIT_MAX`: fixed window knobs
    ///   (defaults 60 / 120)
    /// - `COST_FAIL_CLOSED`: reject on accounting errors (default off)
    ///
    /// ## Providers
    /// - `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `XAI_API_KEY`,
    ///   `REPLICATE_API_KEY`, `ELEVENLABS_API_KEY` plus the matching
    ///   `*_BASE_URL` overrides
    ///
    /// ## Tower
    /// - `TOWER_ADMIN_KEY`: secret for the built-in wildcard admin agent
    /// - `TOWER_AGENTS_PATH`: JSON agent-profile file
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let allowed_origins_str = env::var("ALLOWED_ORIGINS").ok();
        let apple_bundles_str = env::var("APPLE_BUNDLE_IDS").ok();

        Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1:8080"),
            allowed_origins: parse_csv(allowed_origins_str.as_deref()),
            operator_key: env::var("OPERATOR_KEY").ok(),
            signing_secret: env::var("SIGNING_SECRET").ok(),
            session_ttl_secs: num_env("SESSION_TTL_SECS", 900),
            apple_bundle_ids: parse_csv(apple_bundles_str.as_deref()),
            database_path: env_or("DATABASE_PATH", "aigate.db"),
            cost_fail_closed: bool_env("COST_FAIL_CLOSED", false),

            cost_limits: CostLimits {
                daily_usd: num_env("DAILY_COST_LIMIT", 10.0),
                weekly_usd: num_env("WEEKLY_COST_LIMIT", 50.0),
                monthly_usd: num_env("MONTHLY_COST_LIMIT", 200.0),
            },
            rate_limit: RateLimitConfig {
                window_secs: num_env("RATE_LIMIT_WINDOW_SECS", 60),
                max_requests: num_env("RATE_LIMIT_MAX", 120),
            },
            hosted_images: HostedImageConfig {
                enabled: bool_env("HOSTED_IMAGES_ENABLED", false),
                dir: env_or("HOSTED_IMAGES_DIR", "hosted-images"),
                max_per_user: num_env("HOSTED_IMAGES_MAX_PER_USER", 100),
                max_age_hours: num_env("HOSTED_IMAGES_MAX_AGE_HOURS", 24 * 30),
            },
            tower: TowerConfig {
                admin_key: env_or("TOWER_ADMIN_KEY", ""),
                agents_path: env_or("TOWER_AGENTS_PATH", ""),
                default_model: env_or("TOWER_DEFAULT_MODEL", "claude-3-5-sonnet-20241022"),
            },

            openai: OpenAiConfig {
                api_key: env_or("OPENAI_API_KEY", ""),
                base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com"),
            },
            xai: XaiConfig {
                api_key: env_or("XAI_API_KEY", ""),
                base_url: env_or("XAI_BASE_URL", "https://api.x.ai"),
            },
            anthropic: AnthropicConfig {
                api_key: env_or("ANTHROPIC_API_KEY", ""),
                base_url: env_or("ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
                version: env_or("ANTHROPIC_VERSION", "2023-06-01"),
            },
            replicate: ReplicateConfig {
                api_key: env_or("REPLICATE_API_KEY", ""),
                base_url: env_or("REPLICATE_BASE_URL", "https://api.replicate.com"),
            },
            elevenlabs: ElevenLabsConfig {
                api_key: env_or("ELEVENLABS_API_KEY", ""),
                base_url: env_or("ELEVENLABS_BASE_URL", "https://api.elevenlabs.io"),
                default_voice: env_or("ELEVENLABS_DEFAULT_VOICE", "21m00Tcm4TlvDq8ikWAM"),
            },
        }
    }

    /// Server-default key for a provider, `None` when unconfigured.
    pub fn provider_key(&self, provider: ProviderId) -> Option<&str> {
        let key = match provider {
            ProviderId::OpenAi => &self.openai.api_key,
            ProviderId::Xai => &self.xai.api_key,
            ProviderId::Anthropic => &self.anthropic.api_key,
            ProviderId::Replicate => &self.replicate.api_key,
            ProviderId::ElevenLabs => &self.elevenlabs.api_key,
        };
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv() {
        assert_eq!(
            parse_csv(Some("a.example.com, b.example.com, ")),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
        assert!(parse_csv(None).is_empty());
        assert!(parse_csv(Some("  ,  , ")).is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env();
        assert!(!config.bind_address.is_empty());
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.max_requests, 120);
        assert_eq!(config.session_ttl_secs, 900);
        assert_eq!(config.cost_limits.daily_usd, 10.0);
        assert_eq!(config.cost_limits.weekly_usd, 50.0);
        assert_eq!(config.cost_limits.monthly_usd, 200.0);
    }

    #[test]
    fn test_provider_key_lookup() {
        let mut config = Config::from_env();
        config.openai.api_key = "sk-test".to_string();
        config.anthropic.api_key = String::new();

        assert_eq!(config.provider_key(ProviderId::OpenAi), Some("sk-test"));
        assert_eq!(config.provider_key(ProviderId::Anthropic), None);
    }
}
