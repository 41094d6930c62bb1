//! Model pricing catalog.
//!
//! Resolution order for a model's pricing is channel override, then the
//! adaptor's provider defaults, then the global fallback table. The resolved
//! config is a deep clone so callers can mutate it per request.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Quota units for one million prompt tokens priced at 1 USD per 1M tokens.
pub fn milli_tokens_usd(quota_per_usd: i64) -> f64 {
    quota_per_usd as f64 / 1_000_000.0
}

/// Round a USD amount up into integer quota units.
pub fn usd_to_quota(usd: f64, quota_per_usd: i64) -> i64 {
    (usd * quota_per_usd as f64).ceil() as i64
}

/// Per-tool billing. A channel-local `quota_per_call` always wins over a
/// USD price, at both the channel and the provider layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolPrice {
    pub usd_per_call: Option<f64>,
    pub quota_per_call: Option<i64>,
}

impl ToolPrice {
    pub fn quota(&self, quota_per_usd: i64) -> Option<i64> {
        if let Some(q) = self.quota_per_call {
            return Some(q);
        }
        self.usd_per_call.map(|usd| usd_to_quota(usd, quota_per_usd))
    }

    pub fn is_priced(&self) -> bool {
        self.quota_per_call.is_some() || self.usd_per_call.is_some()
    }

    /// Overlay `other` on top of self; `other`'s fields win when present.
    pub fn overlay(&self, other: &ToolPrice) -> ToolPrice {
        ToolPrice {
            usd_per_call: other.usd_per_call.or(self.usd_per_call),
            quota_per_call: other.quota_per_call.or(self.quota_per_call),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImagePrice {
    pub usd_per_image: f64,
    /// Multiplier per size string, e.g. "1024x1024".
    pub size_multipliers: HashMap<String, f64>,
    /// Multiplier per "quality:size" key, e.g. "hd:1024x1792".
    pub quality_size_multipliers: HashMap<String, f64>,
    pub max_prompt_len: usize,
    pub min_images: u32,
    pub max_images: u32,
    /// Token-bucket rates in USD per 1M tokens for models that also bill
    /// text/image tokens on image calls (gpt-image-1 style).
    pub text_token_usd_per_m: Option<f64>,
    pub cached_text_token_usd_per_m: Option<f64>,
    pub image_token_usd_per_m: Option<f64>,
    pub cached_image_token_usd_per_m: Option<f64>,
    pub output_image_token_usd_per_m: Option<f64>,
}

impl Default for ImagePrice {
    fn default() -> Self {
        Self {
            usd_per_image: 0.0,
            size_multipliers: HashMap::new(),
            quality_size_multipliers: HashMap::new(),
            max_prompt_len: 4000,
            min_images: 1,
            max_images: 10,
            text_token_usd_per_m: None,
            cached_text_token_usd_per_m: None,
            image_token_usd_per_m: None,
            cached_image_token_usd_per_m: None,
            output_image_token_usd_per_m: None,
        }
    }
}

impl ImagePrice {
    /// Tier multiplier for a size/quality combination. Quality-size entries
    /// win over plain size entries; unknown combinations bill at 1.0.
    pub fn tier(&self, size: &str, quality: Option<&str>) -> f64 {
        if let Some(q) = quality {
            let key = format!("{}:{}", q, size);
            if let Some(m) = self.quality_size_multipliers.get(&key) {
                return *m;
            }
        }
        self.size_multipliers.get(size).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoPrice {
    pub usd_per_second: f64,
    /// Multiplier per resolution string, e.g. "1080p".
    pub resolution_multipliers: HashMap<String, f64>,
}

impl VideoPrice {
    pub fn tier(&self, resolution: Option<&str>) -> f64 {
        resolution
            .and_then(|r| self.resolution_multipliers.get(r))
            .copied()
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioPrice {
    /// Multiplier over the model ratio for audio prompt tokens.
    pub prompt_ratio: f64,
    /// Multiplier over the model ratio for audio completion tokens.
    pub completion_ratio: f64,
    /// Conversion rate for duration-billed audio endpoints.
    pub tokens_per_second: f64,
}

impl Default for AudioPrice {
    fn default() -> Self {
        Self {
            prompt_ratio: 1.0,
            completion_ratio: 1.0,
            tokens_per_second: 50.0,
        }
    }
}

/// Channel- or provider-level built-in tool policy, independent of any
/// single model entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolingConfig {
    /// Allowed built-in tool names; None means "inherit / any priced tool".
    pub whitelist: Option<Vec<String>>,
    /// Tool prices keyed by canonical (lower-cased, trimmed) name.
    pub pricing: HashMap<String, ToolPrice>,
}

/// Resolved pricing for one model on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPricing {
    /// Quota units per prompt token.
    pub ratio: f64,
    /// Multiplier over `ratio` for cached prompt tokens.
    pub cached_input_ratio: f64,
    /// Multiplier over `ratio` for completion tokens.
    pub completion_ratio: f64,
    /// Flat quota per call; when set it replaces token math entirely.
    pub quota_per_call: Option<i64>,
    /// Flat USD per call; used only when `quota_per_call` is unset.
    pub usd_per_call: Option<f64>,
    pub image: Option<ImagePrice>,
    pub video: Option<VideoPrice>,
    pub audio: Option<AudioPrice>,
    /// Built-in tool whitelist; None means "inherit".
    pub tool_whitelist: Option<Vec<String>>,
    /// Built-in tool prices keyed by canonical tool name.
    pub tool_pricing: HashMap<String, ToolPrice>,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            cached_input_ratio: 1.0,
            completion_ratio: 1.0,
            quota_per_call: None,
            usd_per_call: None,
            image: None,
            video: None,
            audio: None,
            tool_whitelist: None,
            tool_pricing: HashMap::new(),
        }
    }
}

impl ModelPricing {
    /// Flat per-call quota, deriving from USD when only USD is declared.
    pub fn per_call_quota(&self, quota_per_usd: i64) -> Option<i64> {
        if let Some(q) = self.quota_per_call {
            return Some(q);
        }
        self.usd_per_call.map(|usd| usd_to_quota(usd, quota_per_usd))
    }
}

/// Partial pricing as stored per channel; unset fields fall through to the
/// next resolution layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPricingOverride {
    pub ratio: Option<f64>,
    pub cached_input_ratio: Option<f64>,
    pub completion_ratio: Option<f64>,
    pub quota_per_call: Option<i64>,
    pub usd_per_call: Option<f64>,
    pub image: Option<ImagePrice>,
    pub video: Option<VideoPrice>,
    pub audio: Option<AudioPrice>,
    pub tool_whitelist: Option<Vec<String>>,
    pub tool_pricing: HashMap<String, ToolPrice>,
}

impl ModelPricingOverride {
    fn apply(&self, base: &mut ModelPricing) {
        if let Some(v) = self.ratio {
            base.ratio = v;
        }
        if let Some(v) = self.cached_input_ratio {
            base.cached_input_ratio = v;
        }
        if let Some(v) = self.completion_ratio {
            base.completion_ratio = v;
        }
        if self.quota_per_call.is_some() {
            base.quota_per_call = self.quota_per_call;
        }
        if self.usd_per_call.is_some() {
            base.usd_per_call = self.usd_per_call;
        }
        if let Some(v) = &self.image {
            base.image = Some(v.clone());
        }
        if let Some(v) = &self.video {
            base.video = Some(v.clone());
        }
        if let Some(v) = &self.audio {
            base.audio = Some(v.clone());
        }
        if let Some(v) = &self.tool_whitelist {
            base.tool_whitelist = Some(v.clone());
        }
        for (name, price) in &self.tool_pricing {
            let merged = base
                .tool_pricing
                .get(name)
                .map(|p| p.overlay(price))
                .unwrap_or_else(|| price.clone());
            base.tool_pricing.insert(name.clone(), merged);
        }
    }
}

/// The catalog built at startup. Tests construct their own.
#[derive(Debug, Clone, Default)]
pub struct PricingCatalog {
    /// Gateway-level per-model defaults, consulted after provider defaults.
    global: HashMap<String, ModelPricing>,
    /// Last-resort pricing for models nobody declared.
    fallback: ModelPricing,
    /// Per-user-group multipliers applied to every billed quota.
    group_ratios: HashMap<String, f64>,
}

impl PricingCatalog {
    pub fn new() -> Self {
        Self {
            global: builtin_global_table(),
            fallback: ModelPricing {
                // 2.5 USD per 1M prompt tokens at the default quota scale.
                ratio: 1.25,
                completion_ratio: 3.0,
                ..ModelPricing::default()
            },
            group_ratios: HashMap::new(),
        }
    }

    pub fn with_group_ratio(mut self, group: &str, ratio: f64) -> Self {
        self.group_ratios.insert(group.to_string(), ratio);
        self
    }

    /// Multiplier for a user group; unconfigured groups bill at 1.0.
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }

    pub fn with_global(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.global.insert(model.to_string(), pricing);
        self
    }

    pub fn with_fallback(mut self, pricing: ModelPricing) -> Self {
        self.fallback = pricing;
        self
    }

    /// Resolve pricing for `model`: channel override first, then the
    /// adaptor's defaults, then the global table, then the fallback. The
    /// override layer is applied on top of whichever base layer matched so
    /// a partial override still inherits the rest.
    pub fn resolve(
        &self,
        model: &str,
        channel_overrides: Option<&HashMap<String, ModelPricingOverride>>,
        provider_defaults: &HashMap<String, ModelPricing>,
    ) -> ModelPricing {
        let mut base = provider_defaults
            .get(model)
            .or_else(|| self.global.get(model))
            .unwrap_or(&self.fallback)
            .clone();

        if let Some(overrides) = channel_overrides {
            if let Some(o) = overrides.get(model) {
                o.apply(&mut base);
            }
        }
        base
    }
}

fn builtin_global_table() -> HashMap<String, ModelPricing> {
    let mut t = HashMap::new();
    // Prices as quota-per-token at 500k quota/USD; i.e. USD-per-1M / 2.
    t.insert(
        "gpt-4o".to_string(),
        ModelPricing {
            ratio: 1.25,
            cached_input_ratio: 0.5,
            completion_ratio: 4.0,
            ..ModelPricing::default()
        },
    );
    t.insert(
        "gpt-4o-mini".to_string(),
        ModelPricing {
            ratio: 0.075,
            cached_input_ratio: 0.5,
            completion_ratio: 4.0,
            ..ModelPricing::default()
        },
    );
    t.insert(
        "claude-3-5-sonnet".to_string(),
        ModelPricing {
            ratio: 1.5,
            cached_input_ratio: 0.1,
            completion_ratio: 5.0,
            ..ModelPricing::default()
        },
    );
    t.insert(
        "gemini-2.0-flash".to_string(),
        ModelPricing {
            ratio: 0.05,
            cached_input_ratio: 0.25,
            completion_ratio: 4.0,
            ..ModelPricing::default()
        },
    );
    t.insert(
        "text-embedding-3-small".to_string(),
        ModelPricing {
            ratio: 0.01,
            completion_ratio: 0.0,
            ..ModelPricing::default()
        },
    );
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usd_rounds_up() {
        assert_eq!(usd_to_quota(0.000001, 500_000), 1);
        assert_eq!(usd_to_quota(1.0, 500_000), 500_000);
        assert_eq!(usd_to_quota(0.0, 500_000), 0);
    }

    #[test]
    fn resolve_precedence() {
        let catalog = PricingCatalog::new();
        let mut provider = HashMap::new();
        provider.insert(
            "gpt-4o".to_string(),
            ModelPricing {
                ratio: 2.0,
                ..ModelPricing::default()
            },
        );

        // Provider default beats global.
        let resolved = catalog.resolve("gpt-4o", None, &provider);
        assert_eq!(resolved.ratio, 2.0);

        // Channel override beats provider default, partially.
        let mut overrides = HashMap::new();
        overrides.insert(
            "gpt-4o".to_string(),
            ModelPricingOverride {
                completion_ratio: Some(9.0),
                ..ModelPricingOverride::default()
            },
        );
        let resolved = catalog.resolve("gpt-4o", Some(&overrides), &provider);
        assert_eq!(resolved.ratio, 2.0);
        assert_eq!(resolved.completion_ratio, 9.0);

        // Unknown model falls back.
        let resolved = catalog.resolve("no-such-model", None, &provider);
        assert_eq!(resolved.ratio, catalog.fallback.ratio);
    }

    #[test]
    fn resolved_config_is_a_clone() {
        let catalog = PricingCatalog::new();
        let provider = HashMap::new();
        let mut a = catalog.resolve("gpt-4o", None, &provider);
        a.ratio = 99.0;
        let b = catalog.resolve("gpt-4o", None, &provider);
        assert_ne!(a.ratio, b.ratio);
    }

    #[test]
    fn channel_quota_per_call_wins_over_usd() {
        let price = ModelPricing {
            quota_per_call: Some(42),
            usd_per_call: Some(10.0),
            ..ModelPricing::default()
        };
        assert_eq!(price.per_call_quota(500_000), Some(42));

        let usd_only = ModelPricing {
            usd_per_call: Some(0.01),
            ..ModelPricing::default()
        };
        assert_eq!(usd_only.per_call_quota(500_000), Some(5_000));
    }

    #[test]
    fn image_tier_quality_beats_size() {
        let mut price = ImagePrice::default();
        price.size_multipliers.insert("1024x1024".into(), 2.0);
        price
            .quality_size_multipliers
            .insert("hd:1024x1024".into(), 3.0);
        assert_eq!(price.tier("1024x1024", None), 2.0);
        assert_eq!(price.tier("1024x1024", Some("hd")), 3.0);
        assert_eq!(price.tier("512x512", Some("hd")), 1.0);
    }

    #[test]
    fn tool_price_overlay() {
        let provider = ToolPrice {
            usd_per_call: Some(0.03),
            quota_per_call: None,
        };
        let channel = ToolPrice {
            usd_per_call: None,
            quota_per_call: Some(7),
        };
        let merged = provider.overlay(&channel);
        assert_eq!(merged.quota(500_000), Some(7));
        assert_eq!(provider.quota(500_000), Some(15_000));
    }
}
