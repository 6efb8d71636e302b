//! Hosted-image registry.
//!
//! Optional post-processing after a successful image generation: the
//! upstream output is downloaded, written under `dir/user-id/image-id`,
//! registered in the durable store, and exposed through a stable local
//! URL. Download failures fall back to the upstream URL (the pipeline
//! flags the response). A periodic cull enforces the per-user count
//! ceiling and the age limit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HostedImageConfig;
use crate::error::GatewayError;
use crate::replicate::Prediction;
use crate::state::AppState;
use crate::store::{HostedImageRow, Store};

pub const CULL_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct HostedImages {
    store: Store,
    client: reqwest::Client,
    config: HostedImageConfig,
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

impl HostedImages {
    pub fn new(store: Store, client: reqwest::Client, config: HostedImageConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    fn file_path(&self, user_id: &str, image_id: &str, ext: &str) -> PathBuf {
        Path::new(&self.config.dir)
            .join(user_id)
            .join(format!("{}.{}", image_id, ext))
    }

    /// Download and register a prediction's first output. Returns the
    /// stable local URL, or `None` when disabled or on any failure (the
    /// caller then keeps the upstream URL).
    pub async fn process(&self, user_id: &str, prediction: &Prediction) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let upstream_url = prediction.first_output_url()?;

        match self.fetch_and_store(user_id, &prediction.id, &upstream_url).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(user_id, "hosted image persist failed, falling back to upstream: {}", err);
                None
            }
        }
    }

    async fn fetch_and_store(
        &self,
        user_id: &str,
        prediction_id: &str,
        url: &str,
    ) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response.bytes().await?;

        let image_id = Uuid::new_v4().simple().to_string();
        let path = self.file_path(user_id, &image_id, extension_for(&content_type));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        self.store.insert_hosted_image(&HostedImageRow {
            id: image_id.clone(),
            user_id: user_id.to_string(),
            prediction_id: prediction_id.to_string(),
            path: path.to_string_lossy().to_string(),
            size: bytes.len() as u64,
            content_type,
            created_ms: Utc::now().timestamp_millis(),
            accessed_ms: None,
            expires_ms: None,
        })?;

        debug!(user_id, image_id, size = bytes.len(), "hosted image persisted");
        Ok(format!("/v1/images/hosted/{}/{}", user_id, image_id))
    }

    /// Remove over-count and over-age rows plus their files.
    pub async fn cull(&self) {
        let max_age_ms = self.config.max_age_hours as i64 * 3600 * 1000;
        let paths = match self.store.cull_hosted_images(self.config.max_per_user, max_age_ms) {
            Ok(paths) => paths,
            Err(err) => {
                warn!("hosted image cull query failed: {}", err);
                return;
            }
        };
        for path in paths {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path, "hosted image file removal failed: {}", err);
            }
        }
    }

    pub fn spawn_culler(&self) -> tokio::task::JoinHandle<()> {
        let hosted = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CULL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                hosted.cull().await;
            }
        })
    }
}

/// GET /v1/images/hosted/:user_id/:id — serve a registered image and
/// touch its access time.
pub async fn serve_hosted_image(
    State(state): State<AppState>,
    UrlPath((user_id, id)): UrlPath<(String, String)>,
) -> Result<Response, GatewayError> {
    let row = state
        .store
        .get_hosted_image(&user_id, &id)
        .map_err(|err| GatewayError::Internal(err.to_string()))?
        .ok_or(GatewayError::NotFound)?;

    let bytes = tokio::fs::read(&row.path)
        .await
        .map_err(|_| GatewayError::NotFound)?;
    if let Err(err) = state.store.touch_hosted_image(&id) {
        warn!(id, "hosted image touch failed: {}", err);
    }

    Ok(([(header::CONTENT_TYPE, row.content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hosted(enabled: bool, dir: &str) -> HostedImages {
        HostedImages::new(
            Store::open_in_memory().unwrap(),
            reqwest::Client::new(),
            HostedImageConfig {
                enabled,
                dir: dir.to_string(),
                max_per_user: 10,
                max_age_hours: 1,
            },
        )
    }

    fn prediction(output: serde_json::Value) -> Prediction {
        serde_json::from_value(json!({
            "id": "pred-1",
            "status": "succeeded",
            "output": output,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_registry_is_inert() {
        let hosted = hosted(false, "/tmp/unused");
        let result = hosted
            .process("u1", &prediction(json!("https://x/a.png")))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_download_falls_back() {
        let hosted = hosted(true, std::env::temp_dir().join("aigate-test").to_str().unwrap());
        let result = hosted
            .process("u1", &prediction(json!("http://127.0.0.1:1/a.png")))
            .await;
        assert!(result.is_none());
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/webp"), "webp");
        assert_eq!(extension_for("application/octet-stream"), "png");
    }

    #[test]
    fn test_file_path_layout() {
        let hosted = hosted(true, "/data/images");
        let path = hosted.file_path("user-1", "img-9", "png");
        assert_eq!(path, PathBuf::from("/data/images/user-1/img-9.png"));
    }
}
