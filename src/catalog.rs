//! Model catalog: channelled routing from a logical kind to a provider/model pair.
//!
//! The catalog is a nested string-keyed map `channel -> kind -> ModelConfig`,
//! loaded once at startup. Resolution falls back to the `stable` channel when
//! the requested channel lacks the kind, so experimental channels only need
//! to list their overrides.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::GatewayError;
use crate::types::{ModelConfig, ProviderId};

pub const STABLE_CHANNEL: &str = "stable";

type ChannelTable = HashMap<String, HashMap<String, ModelConfig>>;

pub struct Catalog {
    channels: RwLock<ChannelTable>,
}

/// Outcome of a resolve, noting whether the stable fallback was taken
/// so the pipeline can make it observable in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub config: ModelConfig,
    pub fell_back: bool,
}

impl Catalog {
    pub fn new(channels: ChannelTable) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }

    /// The built-in routing table.
    pub fn default_catalog() -> Self {
        let mut stable = HashMap::new();
        stable.insert(
            "chat.default".to_string(),
            ModelConfig {
                provider: ProviderId::OpenAi,
                model: "gpt-4o-mini".to_string(),
            },
        );
        stable.insert(
            "chat.pro".to_string(),
            ModelConfig {
                provider: ProviderId::Anthropic,
                model: "claude-3-5-sonnet-20241022".to_string(),
            },
        );
        stable.insert(
            "chat.grok".to_string(),
            ModelConfig {
                provider: ProviderId::Xai,
                model: "grok-2-latest".to_string(),
            },
        );
        stable.insert(
            "image.default".to_string(),
            ModelConfig {
                provider: ProviderId::Replicate,
                model: "black-forest-labs/flux-schnell".to_string(),
            },
        );
        stable.insert(
            "image.pro".to_string(),
            ModelConfig {
                provider: ProviderId::Replicate,
                model: "black-forest-labs/flux-1.1-pro".to_string(),
            },
        );
        stable.insert(
            "music.default".to_string(),
            ModelConfig {
                provider: ProviderId::ElevenLabs,
                model: "music_v1".to_string(),
            },
        );
        stable.insert(
            "voice.default".to_string(),
            ModelConfig {
                provider: ProviderId::ElevenLabs,
                model: "eleven_multilingual_v2".to_string(),
            },
        );
        stable.insert(
            "realtime.default".to_string(),
            ModelConfig {
                provider: ProviderId::OpenAi,
                model: "gpt-4o-realtime-preview".to_string(),
            },
        );

        let mut beta = HashMap::new();
        beta.insert(
            "chat.default".to_string(),
            ModelConfig {
                provider: ProviderId::Anthropic,
                model: "claude-3-5-haiku-20241022".to_string(),
            },
        );

        let mut channels = HashMap::new();
        channels.insert(STABLE_CHANNEL.to_string(), stable);
        channels.insert("beta".to_string(), beta);
        Catalog::new(channels)
    }

    /// Resolve `kind` on `channel`, falling back to `stable` before
    /// reporting absence.
    pub fn resolve(&self, kind: &str, channel: &str) -> Result<Resolved, GatewayError> {
        let channels = self.channels.read().expect("catalog lock poisoned");

        if let Some(config) = channels.get(channel).and_then(|c| c.get(kind)) {
            return Ok(Resolved {
                config: config.clone(),
                fell_back: false,
            });
        }

        if channel != STABLE_CHANNEL {
            if let Some(config) = channels.get(STABLE_CHANNEL).and_then(|c| c.get(kind)) {
                return Ok(Resolved {
                    config: config.clone(),
                    fell_back: true,
                });
            }
        }

        Err(GatewayError::KindNotFound(kind.to_string()))
    }

    /// Full table snapshot for the `/models` endpoint.
    pub fn snapshot(&self) -> ChannelTable {
        self.channels.read().expect("catalog lock poisoned").clone()
    }

    /// Replace the whole table. Exposed for hot-reload; unused in the
    /// steady state.
    pub fn reload(&self, channels: ChannelTable) {
        *self.channels.write().expect("catalog lock poisoned") = channels;
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::default_catalog()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_direct() {
        let catalog = Catalog::default_catalog();
        let resolved = catalog.resolve("chat.default", "stable").unwrap();
        assert!(!resolved.fell_back);
        assert_eq!(resolved.config.provider, ProviderId::OpenAi);
    }

    #[test]
    fn test_resolve_channel_override() {
        let catalog = Catalog::default_catalog();
        let resolved = catalog.resolve("chat.default", "beta").unwrap();
        assert!(!resolved.fell_back);
        assert_eq!(resolved.config.provider, ProviderId::Anthropic);
        assert_eq!(resolved.config.model, "claude-3-5-haiku-20241022");
    }

    #[test]
    fn test_resolve_stable_fallback() {
        let catalog = Catalog::default_catalog();
        // beta has no image entries, so the stable one wins.
        let resolved = catalog.resolve("image.pro", "beta").unwrap();
        assert!(resolved.fell_back);
        assert_eq!(resolved.config.provider, ProviderId::Replicate);
    }

    #[test]
    fn test_fallback_matches_stable() {
        let catalog = Catalog::default_catalog();
        let via_beta = catalog.resolve("voice.default", "beta").unwrap();
        let via_stable = catalog.resolve("voice.default", "stable").unwrap();
        assert_eq!(via_beta.config, via_stable.config);
    }

    #[test]
    fn test_resolve_unknown_kind() {
        let catalog = Catalog::default_catalog();
        let err = catalog.resolve("chat.turbo", "stable").unwrap_err();
        assert!(matches!(err, GatewayError::KindNotFound(_)));
    }

    #[test]
    fn test_resolve_unknown_channel_falls_back() {
        let catalog = Catalog::default_catalog();
        let resolved = catalog.resolve("chat.default", "does-not-exist").unwrap();
        assert!(resolved.fell_back);
        assert_eq!(resolved.config.provider, ProviderId::OpenAi);
    }

    #[test]
    fn test_reload_replaces_table() {
        let catalog = Catalog::default_catalog();
        catalog.reload(HashMap::new());
        assert!(catalog.resolve("chat.default", "stable").is_err());
    }

    #[test]
    fn test_every_entry_names_an_implemented_provider() {
        // The invariant from the data model: every catalog entry must
        // reference a provider with an adapter behind it.
        let catalog = Catalog::default_catalog();
        for (_, kinds) in catalog.snapshot() {
            for (_, config) in kinds {
                assert!(ProviderId::parse(config.provider.as_str()).is_some());
            }
        }
    }
}
