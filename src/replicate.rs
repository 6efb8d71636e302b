//! Replicate image-prediction client.
//!
//! Two dispatch styles: a canonical `owner/name` model reference is
//! resolved to its pinned version id through a lookup call (cached in
//! memory for the process lifetime), while a bare version hash (no
//! slash, 30+ chars) is used directly. Predictions are created with
//! `Prefer: wait`; if the upstream still returns a non-terminal status
//! the client polls once a second for up to a minute and returns the
//! last snapshot either way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::providers::{AdapterError, IMAGE_TIMEOUT};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLLS: u32 = 60;

/// Prediction snapshot as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub urls: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Prediction {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }

    /// First output URL, when the prediction produced any.
    pub fn first_output_url(&self) -> Option<String> {
        match &self.output {
            Some(Value::String(url)) => Some(url.clone()),
            Some(Value::Array(items)) => items
                .iter()
                .find_map(|v| v.as_str().map(str::to_string)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelDetail {
    latest_version: Option<VersionDetail>,
}

#[derive(Debug, Deserialize)]
struct VersionDetail {
    id: String,
}

/// A bare version hash: no slash, long enough to not be a model name.
pub fn looks_like_version_hash(model: &str) -> bool {
    !model.contains('/') && model.len() >= 30
}

#[derive(Clone)]
pub struct ReplicateClient {
    client: reqwest::Client,
    base_url: String,
    /// `owner/name` → pinned version id, resolved once per process.
    versions: Arc<Mutex<HashMap<String, String>>>,
}

impl ReplicateClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            versions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, AdapterError> {
        let response = timeout(IMAGE_TIMEOUT, builder.send())
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

    /// Resolve `owner/name` to its pinned latest version id.
    pub async fn resolve_version(&self, model: &str, key: &str) -> Result<String, AdapterError> {
        if let Some(version) = self
            .versions
            .lock()
            .expect("version cache poisoned")
            .get(model)
        {
            return Ok(version.clone());
        }

        debug!(model, "resolving replicate model version");
        let detail: ModelDetail = self
            .request_json(
                self.client
                    .get(format!("{}/v1/models/{}", self.base_url, model))
                    .bearer_auth(key),
            )
            .await?;

        let version = detail
            .latest_version
            .map(|v| v.id)
            .ok_or_else(|| AdapterError::Malformed(format!("model {} has no version", model)))?;

        self.versions
            .lock()
            .expect("version cache poisoned")
            .insert(model.to_string(), version.clone());
        Ok(version)
    }

    /// Create a prediction and wait for a terminal status (bounded).
    pub async fn generate(
        &self,
        model: &str,
        input: Value,
        key: &str,
        wait: bool,
    ) -> Result<Prediction, AdapterError> {
        let version = if looks_like_version_hash(model) {
            model.to_string()
        } else {
            self.resolve_version(model, key).await?
        };

        let mut prediction: Prediction = self
            .request_json(
                self.client
                    .post(format!("{}/v1/predictions", self.base_url))
                    .bearer_auth(key)
                    .header("Prefer", "wait")
                    .json(&serde_json::json!({
                        "version": version,
                        "input": input,
                    })),
            )
            .await?;

        if !wait || prediction.is_terminal() {
            return Ok(prediction);
        }

        // `Prefer: wait` returned early; poll to the deadline and hand
        // back the last snapshot regardless of status.
        for _ in 0..MAX_POLLS {
            tokio::time::sleep(POLL_INTERVAL).await;
            prediction = self.get_prediction(&prediction.id, key).await?;
            if prediction.is_terminal() {
                return Ok(prediction);
            }
        }
        warn!(id = %prediction.id, status = %prediction.status, "prediction still pending after poll budget");
        Ok(prediction)
    }

    pub async fn get_prediction(&self, id: &str, key: &str) -> Result<Prediction, AdapterError> {
        self.request_json(
            self.client
                .get(format!("{}/v1/predictions/{}", self.base_url, id))
                .bearer_auth(key),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_hash_detection() {
        assert!(looks_like_version_hash(
            "5c7d5dc6dd8bf75c1acaa8565735e7986bc5b66206b55cca93cb72c9bf15ccaa"
        ));
        assert!(!looks_like_version_hash("black-forest-labs/flux-schnell"));
        // Short slashless strings are model names, not hashes.
        assert!(!looks_like_version_hash("flux"));
    }

    #[test]
    fn test_terminal_statuses() {
        for status in ["succeeded", "failed", "canceled"] {
            let p = Prediction {
                id: "p1".to_string(),
                status: status.to_string(),
                output: None,
                urls: None,
                error: None,
            };
            assert!(p.is_terminal(), "{} should be terminal", status);
        }
        for status in ["starting", "processing"] {
            let p = Prediction {
                id: "p1".to_string(),
                status: status.to_string(),
                output: None,
                urls: None,
                error: None,
            };
            assert!(!p.is_terminal(), "{} should not be terminal", status);
        }
    }

    #[test]
    fn test_first_output_url_shapes() {
        let single = Prediction {
            id: "p".to_string(),
            status: "succeeded".to_string(),
            output: Some(json!("https://x/one.png")),
            urls: None,
            error: None,
        };
        assert_eq!(single.first_output_url().as_deref(), Some("https://x/one.png"));

        let list = Prediction {
            id: "p".to_string(),
            status: "succeeded".to_string(),
            output: Some(json!(["https://x/a.png", "https://x/b.png"])),
            urls: None,
            error: None,
        };
        assert_eq!(list.first_output_url().as_deref(), Some("https://x/a.png"));

        let none = Prediction {
            id: "p".to_string(),
            status: "failed".to_string(),
            output: None,
            urls: None,
            error: None,
        };
        assert!(none.first_output_url().is_none());
    }

    #[test]
    fn test_prediction_deserializes_with_missing_fields() {
        let p: Prediction =
            serde_json::from_value(json!({"id": "p1", "status": "starting"})).unwrap();
        assert_eq!(p.status, "starting");
        assert!(p.output.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_errors() {
        let client = ReplicateClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let err = client
            .get_prediction("p1", "r8_test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Transport(_) | AdapterError::Timeout
        ));
    }
}
