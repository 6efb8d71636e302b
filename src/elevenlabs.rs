//! ElevenLabs client: music generation and text-to-speech.
//!
//! Music generation returns a JSON envelope carrying either a hosted
//! audio URL or inline base64 audio. TTS returns raw MP3 bytes, either
//! fully buffered or as a streaming response the pipeline pipes to the
//! client.

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::providers::{AdapterError, IMAGE_TIMEOUT};

/// Music generation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicResponse {
    pub generation_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MusicUpstream {
    #[serde(default)]
    generation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    audio_base64: Option<String>,
}

#[derive(Clone)]
pub struct ElevenLabsClient {
    client: reqwest::Client,
    base_url: String,
}

impl ElevenLabsClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Generate a music clip of roughly `duration_secs` seconds.
    pub async fn generate_music(
        &self,
        prompt: &str,
        duration_secs: u32,
        key: &str,
    ) -> Result<MusicResponse, AdapterError> {
        debug!(duration_secs, "dispatching music generation");

        let response = timeout(
            IMAGE_TIMEOUT,
            self.client
                .post(format!("{}/v1/music", self.base_url))
                .header("xi-api-key", key)
                .json(&serde_json::json!({
                    "prompt": prompt,
                    "music_length_ms": duration_secs * 1000,
                }))
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

        let upstream: MusicUpstream = response
            .json()
            .await
            .map_err(|err| AdapterError::Malformed(err.to_string()))?;
        Ok(MusicResponse {
            generation_id: upstream
                .generation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            status: upstream.status.unwrap_or_else(|| "completed".to_string()),
            audio_url: upstream.audio_url,
            audio_base64: upstream.audio_base64,
        })
    }

    fn tts_request(
        &self,
        text: &str,
        voice_id: &str,
        model: &str,
        key: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .post(format!(
                "{}/v1/text-to-speech/{}",
                self.base_url, voice_id
            ))
            .header("xi-api-key", key)
            .header("accept", "audio/mpeg")
            .json(&serde_json::json!({
                "text": text,
                "model_id": model,
            }))
    }

    /// Synthesize speech and buffer the full MP3.
    pub async fn tts(
        &self,
        text: &str,
        voice_id: &str,
        model: &str,
        key: &str,
    ) -> Result<Vec<u8>, AdapterError> {
        let response = timeout(
            IMAGE_TIMEOUT,
            self.tts_request(text, voice_id, model, key).send(),
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
        let bytes = response
            .bytes()
            .await
            .map_err(AdapterError::from_reqwest)?;
        Ok(bytes.to_vec())
    }

    /// Synthesize speech and return the upstream response for piping
    /// its byte stream straight to the client.
    pub async fn tts_stream(
        &self,
        text: &str,
        voice_id: &str,
        model: &str,
        key: &str,
    ) -> Result<reqwest::Response, AdapterError> {
        let response = timeout(
            IMAGE_TIMEOUT,
            self.tts_request(text, voice_id, model, key).send(),
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
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_music_response_serialization_omits_empty() {
        let response = MusicResponse {
            generation_id: "gen1".to_string(),
            status: "completed".to_string(),
            audio_url: Some("https://x/a.mp3".to_string()),
            audio_base64: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["audio_url"], "https://x/a.mp3");
        assert!(json.get("audio_base64").is_none());
    }

    #[test]
    fn test_music_upstream_defaults() {
        let upstream: MusicUpstream = serde_json::from_str("{}").unwrap();
        assert!(upstream.generation_id.is_none());
        assert!(upstream.status.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_errors() {
        let client = ElevenLabsClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let err = client
            .tts("hello", "voice1", "eleven_multilingual_v2", "xi-test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Transport(_) | AdapterError::Timeout
        ));

        let err = client
            .generate_music("calm piano", 30, "xi-test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Transport(_) | AdapterError::Timeout
        ));
    }
}
