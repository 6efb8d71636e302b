//! OpenAI-style chat adapter, shared by OpenAI and xAI.
//!
//! Both upstreams speak the chat-completions dialect, so the request
//! body passes through mostly verbatim and the response already *is*
//! the normalized shape. Also hosts the realtime ephemeral-session
//! exchange, which returns the upstream descriptor untouched.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::debug;

use crate::providers::{AdapterError, AdapterRequest, ProviderAdapter, CHAT_TIMEOUT};
use crate::types::NormalizedCompletion;

pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    base_url: String,
    /// Label used in traces ("openai" or "xai").
    name: &'static str,
}

impl OpenAiCompatAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, name: &'static str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            name,
        }
    }

    fn chat_body(request: &AdapterRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Create a realtime session and return the ephemeral descriptor
    /// verbatim; it carries a client token the caller uses directly.
    pub async fn create_realtime_session(
        &self,
        model: &str,
        key: &str,
    ) -> Result<Value, AdapterError> {
        let response = timeout(
            CHAT_TIMEOUT,
            self.client
                .post(format!("{}/v1/realtime/sessions", self.base_url))
                .bearer_auth(key)
                .json(&json!({ "model": model }))
                .send(),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|err| AdapterError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    async fn complete(
        &self,
        request: &AdapterRequest,
        key: &str,
    ) -> Result<NormalizedCompletion, AdapterError> {
        debug!(provider = self.name, model = %request.model, "dispatching chat completion");

        let response = timeout(
            CHAT_TIMEOUT,
            self.client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(key)
                .json(&Self::chat_body(request))
                .send(),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<NormalizedCompletion>()
            .await
            .map_err(|err| AdapterError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, GenerationOptions, MessageContent, MessageRole};

    fn request() -> AdapterRequest {
        AdapterRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            options: GenerationOptions {
                temperature: Some(0.5),
                max_tokens: Some(100),
            },
        }
    }

    #[test]
    fn test_chat_body_passes_through() {
        let body = OpenAiCompatAdapter::chat_body(&request());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn test_chat_body_omits_unset_options() {
        let mut req = request();
        req.options = GenerationOptions::default();
        let body = OpenAiCompatAdapter::chat_body(&req);
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_completion_parses_upstream_shape() {
        // The upstream response is already the normalized shape.
        let upstream = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        });
        let completion: NormalizedCompletion = serde_json::from_value(upstream).unwrap();
        assert_eq!(completion.content(), "hello");
        assert_eq!(completion.usage.prompt_tokens, 3);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_transport_error() {
        let adapter =
            OpenAiCompatAdapter::new(reqwest::Client::new(), "http://127.0.0.1:1", "openai");
        let err = adapter.complete(&request(), "sk-test").await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Transport(_) | AdapterError::Timeout
        ));
    }
}
