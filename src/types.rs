//! Type Definitions and Data Structures
//!
//! Shared types used across the gateway:
//! - Chat message and normalized completion shapes
//! - Principal (authenticated identity) variants
//! - Provider identifiers and model routing targets
//! - Request bodies for the forward endpoints, with validation
//!
//! The normalized completion mirrors the OpenAI chat-completions shape so
//! clients receive the same JSON regardless of which upstream served the
//! request.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Message roles in chat conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System messages (prompts, instructions)
    System,
    /// User messages (human input)
    User,
    /// Assistant messages (AI responses)
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Message content: either plain text or an array of multimodal parts
/// (OpenAI-style `{type: "text" | "image_url", ...}` objects).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

impl MessageContent {
    /// Concatenated text of the message, ignoring non-text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

/// AI provider enumeration
///
/// Tags every implemented upstream. The request pipeline selects the
/// adapter by this tag; adding a provider is a registry entry, not a
/// string comparison scattered through handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// OpenAI (GPT models, realtime sessions)
    OpenAi,
    /// Anthropic (Claude models)
    Anthropic,
    /// xAI (Grok models, OpenAI-compatible API)
    Xai,
    /// Replicate (image generation predictions)
    Replicate,
    /// ElevenLabs (music generation and TTS)
    ElevenLabs,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Xai => "xai",
            ProviderId::Replicate => "replicate",
            ProviderId::ElevenLabs => "elevenlabs",
        }
    }

    pub fn parse(s: &str) -> Option<ProviderId> {
        match s.to_lowercase().as_str() {
            "openai" => Some(ProviderId::OpenAi),
            "anthropic" => Some(ProviderId::Anthropic),
            "xai" | "grok" => Some(ProviderId::Xai),
            "replicate" => Some(ProviderId::Replicate),
            "elevenlabs" => Some(ProviderId::ElevenLabs),
            _ => None,
        }
    }

    /// All implemented providers, used for key-override header scanning
    /// and the `/auth/apple` availability map.
    pub fn all() -> [ProviderId; 5] {
        [
            ProviderId::OpenAi,
            ProviderId::Anthropic,
            ProviderId::Xai,
            ProviderId::Replicate,
            ProviderId::ElevenLabs,
        ]
    }
}

/// Resolved routing target: one concrete model at one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderId,
    pub model: String,
}

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalKind {
    /// Operator app-shared secret; user id is the literal `"app"`.
    AppKey,
    /// Signed bearer token carrying a stable user id.
    User,
    /// Platform-identity exchange (Sign in with Apple).
    PlatformUser,
    /// Opaque short-lived session token.
    Session,
    /// Agent-key caller bound to a tower profile.
    Agent,
    /// Un-authenticated paths (health, hosted image reads).
    Anonymous,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::AppKey => "app-key",
            PrincipalKind::User => "user",
            PrincipalKind::PlatformUser => "platform-user",
            PrincipalKind::Session => "session",
            PrincipalKind::Agent => "agent",
            PrincipalKind::Anonymous => "anonymous",
        }
    }
}

/// Authenticated identity attached to a request, together with its
/// routing channel and any per-provider override keys the caller
/// supplied (or that were captured into its session).
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub kind: PrincipalKind,
    pub channel: String,
    pub provider_keys: HashMap<ProviderId, String>,
}

impl Principal {
    pub fn anonymous(channel: &str) -> Self {
        Self {
            user_id: "anonymous".to_string(),
            kind: PrincipalKind::Anonymous,
            channel: channel.to_string(),
            provider_keys: HashMap::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == PrincipalKind::Anonymous
    }
}

/// Generation options forwarded to the upstream model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct GenerationOptions {
    /// Temperature for response randomness (0.0 = deterministic)
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate in the response
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,
}

/// Token accounting reported with every normalized completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

/// The OpenAI-chat-completions-shaped JSON returned uniformly to clients
/// regardless of which upstream produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    /// Absent from some compatible upstreams; zeroes trigger the
    /// pipeline's coarse estimate instead.
    #[serde(default)]
    pub usage: Usage,
}

impl NormalizedCompletion {
    pub fn new(
        id: String,
        model: String,
        content: String,
        finish_reason: Option<String>,
        usage: Usage,
    ) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![Choice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason,
            }],
            usage,
        }
    }

    /// Text of the first choice, empty when there are no choices.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Forward-endpoint request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Logical routing token, e.g. `chat.default`.
    pub kind: Option<String>,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub kind: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub num_outputs: Option<u32>,
    /// Block until the prediction reaches a terminal status.
    pub wait: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MusicRequest {
    pub prompt: String,
    pub kind: Option<String>,
    /// Requested duration in seconds, 1..=300.
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceRequest {
    pub text: String,
    pub voice: Option<String>,
    /// ElevenLabs-style voice id; wins over `voice` when both are set.
    pub voice_id: Option<String>,
    pub kind: Option<String>,
}
