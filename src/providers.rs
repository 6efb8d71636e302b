//! Provider adapter seam.
//!
//! Every chat-capable upstream implements [`ProviderAdapter`]: one method
//! turning a normalized request plus an API key into a normalized
//! completion. The pipeline selects the adapter by [`ProviderId`] tag
//! through the registry; adding a provider is a single registry entry.
//!
//! All adapters share one keep-alive connection pool and carry explicit
//! per-call timeouts (chat 30 s, image 120 s).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::{ChatMessage, GenerationOptions, NormalizedCompletion, ProviderId};

pub const CHAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const IMAGE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_IDLE_PER_HOST: usize = 8;

/// Normalized request handed to every chat adapter.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
}

/// Adapter-level failure; the pipeline maps these onto the gateway
/// error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected upstream payload: {0}")]
    Malformed(String),
}

impl From<AdapterError> for GatewayError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Upstream { status, body } => GatewayError::Provider { status, body },
            AdapterError::Timeout => GatewayError::ProviderTimeout,
            AdapterError::Transport(msg) | AdapterError::Malformed(msg) => {
                GatewayError::Internal(msg)
            }
        }
    }
}

impl AdapterError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else {
            AdapterError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(
        &self,
        request: &AdapterRequest,
        key: &str,
    ) -> Result<NormalizedCompletion, AdapterError>;
}

/// Shared keep-alive client used by every adapter. Per-call deadlines
/// are applied with `tokio::time::timeout`, not here.
pub fn shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}

pub struct ProviderRegistry {
    openai: crate::openai::OpenAiCompatAdapter,
    xai: crate::openai::OpenAiCompatAdapter,
    anthropic: crate::anthropic::AnthropicAdapter,
    pub replicate: crate::replicate::ReplicateClient,
    pub elevenlabs: crate::elevenlabs::ElevenLabsClient,
}

impl ProviderRegistry {
    pub fn new(config: &crate::config::Config) -> Self {
        let client = shared_client();
        Self {
            openai: crate::openai::OpenAiCompatAdapter::new(
                client.clone(),
                &config.openai.base_url,
                "openai",
            ),
            xai: crate::openai::OpenAiCompatAdapter::new(client.clone(), &config.xai.base_url, "xai"),
            anthropic: crate::anthropic::AnthropicAdapter::new(
                client.clone(),
                &config.anthropic.base_url,
                &config.anthropic.version,
            ),
            replicate: crate::replicate::ReplicateClient::new(
                client.clone(),
                &config.replicate.base_url,
            ),
            elevenlabs: crate::elevenlabs::ElevenLabsClient::new(
                client,
                &config.elevenlabs.base_url,
            ),
        }
    }

    /// Chat adapter for a provider tag; image/audio providers have no
    /// chat surface.
    pub fn chat_adapter(&self, provider: ProviderId) -> Option<&dyn ProviderAdapter> {
        match provider {
            ProviderId::OpenAi => Some(&self.openai),
            ProviderId::Xai => Some(&self.xai),
            ProviderId::Anthropic => Some(&self.anthropic),
            ProviderId::Replicate | ProviderId::ElevenLabs => None,
        }
    }

    pub fn openai(&self) -> &crate::openai::OpenAiCompatAdapter {
        &self.openai
    }

    pub fn anthropic(&self) -> &crate::anthropic::AnthropicAdapter {
        &self.anthropic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_registry_covers_chat_providers() {
        let registry = ProviderRegistry::new(&Config::from_env());
        assert!(registry.chat_adapter(ProviderId::OpenAi).is_some());
        assert!(registry.chat_adapter(ProviderId::Xai).is_some());
        assert!(registry.chat_adapter(ProviderId::Anthropic).is_some());
        assert!(registry.chat_adapter(ProviderId::Replicate).is_none());
        assert!(registry.chat_adapter(ProviderId::ElevenLabs).is_none());
    }

    #[test]
    fn test_adapter_error_mapping() {
        let err: GatewayError = AdapterError::Timeout.into();
        assert!(matches!(err, GatewayError::ProviderTimeout));

        let err: GatewayError = AdapterError::Upstream {
            status: 429,
            body: "overloaded".to_string(),
        }
        .into();
        match err {
            GatewayError::Provider { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected {:?}", other.code()),
        }
    }
}
