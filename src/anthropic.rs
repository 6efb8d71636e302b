//! Anthropic chat adapter.
//!
//! The messages API differs from the chat-completions dialect in three
//! ways this adapter bridges:
//! - system messages move into a top-level `system` field
//! - message content is an array of typed blocks; OpenAI-style image
//!   parts are rewritten into Anthropic `source` blocks (`data:` URLs
//!   become base64 sources, remote URLs become url sources)
//! - the response's content blocks are flattened back into one string,
//!   with `input_tokens`/`output_tokens` mapped onto the normalized
//!   usage fields

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::debug;

use crate::providers::{AdapterError, AdapterRequest, ProviderAdapter, CHAT_TIMEOUT};
use crate::types::{MessageContent, MessageRole, NormalizedCompletion, Usage};

const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Rewrite one OpenAI-style image part into an Anthropic source block.
fn rewrite_image_part(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }
            });
        }
    }
    json!({
        "type": "image",
        "source": { "type": "url", "url": url }
    })
}

fn rewrite_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                Some(json!({ "type": "text", "text": text }))
            }
            Some("image_url") => part
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(|u| u.as_str())
                .map(rewrite_image_part),
            _ => None,
        })
        .collect()
}

/// Recursively extract `.text` from response content blocks and join.
fn flatten_content(blocks: &[Value]) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(obj) => {
                if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                    out.push(text.to_string());
                }
                if let Some(content) = obj.get("content") {
                    walk(content, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    blocks.iter().for_each(|b| walk(b, &mut out));
    out.join("")
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, version: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            version: version.to_string(),
        }
    }

    /// Reshape a normalized request into the messages-API body.
    fn messages_body(request: &AdapterRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for message in &request.messages {
            if message.role == MessageRole::System {
                system_parts.push(message.content.text());
                continue;
            }

            let content = match &message.content {
                MessageContent::Text(text) => json!([{ "type": "text", "text": text }]),
                MessageContent::Parts(parts) => json!(rewrite_parts(parts)),
            };
            messages.push(json!({
                "role": message.role.as_str(),
                "content": content,
            }));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn normalize(response: AnthropicResponse) -> NormalizedCompletion {
        NormalizedCompletion::new(
            response.id,
            response.model,
            flatten_content(&response.content),
            response.stop_reason,
            Usage::new(response.usage.input_tokens, response.usage.output_tokens),
        )
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn complete(
        &self,
        request: &AdapterRequest,
        key: &str,
    ) -> Result<NormalizedCompletion, AdapterError> {
        debug!(model = %request.model, "dispatching anthropic completion");

        let response = timeout(
            CHAT_TIMEOUT,
            self.client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", key)
                .header("anthropic-version", &self.version)
                .json(&Self::messages_body(request))
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

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::Malformed(err.to_string()))?;
        Ok(Self::normalize(parsed))
    }
}
