//! Pricing table and cost computation.
//!
//! Maps every `(provider, model)` the catalog can resolve to a billing
//! rate. Rates come in four shapes: per-token (chat), per-image
//! (predictions), per-audio-second (music), and per-character (TTS).
//! Costs are computed in USD and stored as integer cents; failed
//! requests cost zero by contract.

use std::collections::HashMap;

use crate::types::{ProviderId, Usage};

/// Coarse tokenizer used when the upstream reports no counts:
/// roughly four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Billing rate for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// USD per million input/output tokens.
    PerTokens {
        input_per_1m: f64,
        output_per_1m: f64,
    },
    /// USD per generated image.
    PerImage(f64),
    /// USD per second of generated audio.
    PerAudioSecond(f64),
    /// USD per input character (TTS).
    PerCharacter(f64),
}

/// Billable quantity of a completed request.
#[derive(Debug, Clone, Copy)]
pub enum Metered {
    Tokens(Usage),
    Images(u32),
    AudioSeconds(u32),
    Characters(u32),
}

pub struct PricingTable {
    rates: HashMap<(ProviderId, String), Rate>,
    /// Applied when a model is missing from the table, so unknown
    /// models are never billed at zero.
    default_token_rate: Rate,
}

impl PricingTable {
    /// Built-in rates for the default catalog (approximate list prices).
    pub fn default_table() -> Self {
        let mut rates = HashMap::new();

        rates.insert(
            (ProviderId::OpenAi, "gpt-4o-mini".to_string()),
            Rate::PerTokens {
                input_per_1m: 0.15,
                output_per_1m: 0.60,
            },
        );
        rates.insert(
            (ProviderId::OpenAi, "gpt-4o".to_string()),
            Rate::PerTokens {
                input_per_1m: 2.50,
                output_per_1m: 10.0,
            },
        );
        rates.insert(
            (ProviderId::OpenAi, "gpt-4o-realtime-preview".to_string()),
            Rate::PerTokens {
                input_per_1m: 5.0,
                output_per_1m: 20.0,
            },
        );
        rates.insert(
            (ProviderId::Anthropic, "claude-3-5-sonnet-20241022".to_string()),
            Rate::PerTokens {
                input_per_1m: 3.0,
                output_per_1m: 15.0,
            },
        );
        rates.insert(
            (ProviderId::Anthropic, "claude-3-5-haiku-20241022".to_string()),
            Rate::PerTokens {
                input_per_1m: 0.80,
                output_per_1m: 4.0,
            },
        );
        rates.insert(
            (ProviderId::Xai, "grok-2-latest".to_string()),
            Rate::PerTokens {
                input_per_1m: 2.0,
                output_per_1m: 10.0,
            },
        );
        rates.insert(
            (ProviderId::Replicate, "black-forest-labs/flux-schnell".to_string()),
            Rate::PerImage(0.003),
        );
        rates.insert(
            (ProviderId::Replicate, "black-forest-labs/flux-1.1-pro".to_string()),
            Rate::PerImage(0.04),
        );
        rates.insert(
            (ProviderId::ElevenLabs, "music_v1".to_string()),
            Rate::PerAudioSecond(0.002),
        );
        rates.insert(
            (ProviderId::ElevenLabs, "eleven_multilingual_v2".to_string()),
            Rate::PerCharacter(0.00003),
        );

        Self {
            rates,
            default_token_rate: Rate::PerTokens {
                input_per_1m: 3.0,
                output_per_1m: 15.0,
            },
        }
    }

    pub fn rate(&self, provider: ProviderId, model: &str) -> Rate {
        self.rates
            .get(&(provider, model.to_string()))
            .copied()
            .unwrap_or(self.default_token_rate)
    }

    /// Estimated cost in USD for a metered quantity.
    pub fn cost_usd(&self, provider: ProviderId, model: &str, metered: Metered) -> f64 {
        match (self.rate(provider, model), metered) {
            (
                Rate::PerTokens {
                    input_per_1m,
                    output_per_1m,
                },
                Metered::Tokens(usage),
            ) => {
                (usage.prompt_tokens as f64 / 1_000_000.0) * input_per_1m
                    + (usage.completion_tokens as f64 / 1_000_000.0) * output_per_1m
            }
            (Rate::PerImage(usd), Metered::Images(n)) => usd * n as f64,
            (Rate::PerAudioSecond(usd), Metered::AudioSeconds(secs)) => usd * secs as f64,
            (Rate::PerCharacter(usd), Metered::Characters(n)) => usd * n as f64,
            // Rate/meter mismatch: bill token-shaped usage at the
            // default token rate, everything else at zero.
            (_, Metered::Tokens(usage)) => {
                let Rate::PerTokens {
                    input_per_1m,
                    output_per_1m,
                } = self.default_token_rate
                else {
                    return 0.0;
                };
                (usage.prompt_tokens as f64 / 1_000_000.0) * input_per_1m
                    + (usage.completion_tokens as f64 / 1_000_000.0) * output_per_1m
            }
            _ => 0.0,
        }
    }

    /// Estimated cost in integer cents, the unit the usage log stores.
    pub fn cost_cents(&self, provider: ProviderId, model: &str, metered: Metered) -> i64 {
        (self.cost_usd(provider, model, metered) * 100.0).round() as i64
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::default_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_token_cost() {
        let table = PricingTable::default_table();
        // 1M input + 1M output of gpt-4o-mini = $0.15 + $0.60.
        let usage = Usage::new(1_000_000, 1_000_000);
        let usd = table.cost_usd(ProviderId::OpenAi, "gpt-4o-mini", Metered::Tokens(usage));
        assert!((usd - 0.75).abs() < 1e-9);
        assert_eq!(
            table.cost_cents(ProviderId::OpenAi, "gpt-4o-mini", Metered::Tokens(usage)),
            75
        );
    }

    #[test]
    fn test_zero_usage_costs_zero() {
        let table = PricingTable::default_table();
        let usage = Usage::new(0, 0);
        assert_eq!(
            table.cost_cents(ProviderId::OpenAi, "gpt-4o-mini", Metered::Tokens(usage)),
            0
        );
    }

    #[test]
    fn test_image_cost() {
        let table = PricingTable::default_table();
        assert_eq!(
            table.cost_cents(
                ProviderId::Replicate,
                "black-forest-labs/flux-1.1-pro",
                Metered::Images(2)
            ),
            8
        );
    }

    #[test]
    fn test_audio_cost() {
        let table = PricingTable::default_table();
        // 30 seconds at $0.002/s = $0.06 = 6 cents.
        assert_eq!(
            table.cost_cents(ProviderId::ElevenLabs, "music_v1", Metered::AudioSeconds(30)),
            6
        );
    }

    #[test]
    fn test_character_cost() {
        let table = PricingTable::default_table();
        // 1000 chars at $0.00003 = $0.03 = 3 cents.
        assert_eq!(
            table.cost_cents(
                ProviderId::ElevenLabs,
                "eleven_multilingual_v2",
                Metered::Characters(1000)
            ),
            3
        );
    }

    #[test]
    fn test_unknown_model_uses_default_rate() {
        let table = PricingTable::default_table();
        let usage = Usage::new(1_000_000, 0);
        let usd = table.cost_usd(ProviderId::OpenAi, "gpt-99", Metered::Tokens(usage));
        assert!(usd > 0.0);
    }
}
