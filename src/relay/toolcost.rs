//! Built-in tool policy and pricing.
//!
//! Provider-hosted tools (web search, code interpreter, file search,
//! grounding) are billed per invocation. The effective policy merges the
//! channel override with the adaptor defaults; a whitelist entry without a
//! price is rejected rather than given away.

use std::collections::HashMap;

use serde_json::Value;

use super::detect::PayloadFormat;
use super::error::{RelayError, RelayResult};
use crate::pricing::{ModelPricing, ToolPrice, ToolingConfig};

/// Tool names treated as provider-hosted when a request declares them.
const BUILTIN_TOOL_TYPES: &[&str] = &[
    "web_search",
    "web_search_preview",
    "code_interpreter",
    "file_search",
    "computer_use",
    "grounding",
    "google_search",
];

pub fn canonical_tool_name(name: &str) -> String {
    let trimmed = name.trim().to_ascii_lowercase();
    // Claude web search tools arrive as versioned types, e.g.
    // "web_search_20250305".
    for known in BUILTIN_TOOL_TYPES {
        if trimmed == *known || trimmed.starts_with(&format!("{}_2", known)) {
            return (*known).to_string();
        }
    }
    trimmed
}

/// Fully merged tool policy for one (channel, model) pair.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    /// None means any priced tool is allowed.
    pub whitelist: Option<Vec<String>>,
    pub pricing: HashMap<String, ToolPrice>,
}

impl ToolPolicy {
    /// Channel whitelist wins over provider's; model-level entries (which
    /// come from the channel's per-model config) win over both. Prices are
    /// provider first with channel and model layers overlaid.
    pub fn merge(
        channel: Option<&ToolingConfig>,
        provider: &ToolingConfig,
        model: &ModelPricing,
    ) -> Self {
        let whitelist = model
            .tool_whitelist
            .clone()
            .or_else(|| channel.and_then(|c| c.whitelist.clone()))
            .or_else(|| provider.whitelist.clone())
            .map(|list| list.iter().map(|n| canonical_tool_name(n)).collect());

        let mut pricing: HashMap<String, ToolPrice> = HashMap::new();
        for (name, price) in &provider.pricing {
            pricing.insert(canonical_tool_name(name), price.clone());
        }
        let overlay_layers = [
            channel.map(|c| &c.pricing),
            Some(&model.tool_pricing),
        ];
        for layer in overlay_layers.into_iter().flatten() {
            for (name, price) in layer {
                let key = canonical_tool_name(name);
                let merged = pricing
                    .get(&key)
                    .map(|base| base.overlay(price))
                    .unwrap_or_else(|| price.clone());
                pricing.insert(key, merged);
            }
        }

        Self { whitelist, pricing }
    }

    pub fn price(&self, tool: &str) -> Option<&ToolPrice> {
        self.pricing
            .get(&canonical_tool_name(tool))
            .filter(|p| p.is_priced())
    }

    /// Whether the policy admits this tool. Fail-closed: with a whitelist in
    /// force a tool must be listed *and* priced; without one any priced tool
    /// passes.
    pub fn allows(&self, tool: &str) -> bool {
        let name = canonical_tool_name(tool);
        let priced = self.price(&name).is_some();
        match &self.whitelist {
            Some(list) => list.iter().any(|t| *t == name) && priced,
            None => priced,
        }
    }

    /// Validate every built-in tool a request declares.
    pub fn validate(&self, tools: &[String]) -> RelayResult<()> {
        for tool in tools {
            if !self.allows(tool) {
                return Err(RelayError::ToolNotAllowed(format!(
                    "built-in tool '{}' is not enabled on this channel",
                    canonical_tool_name(tool)
                )));
            }
        }
        Ok(())
    }
}

/// Pull the built-in tool names out of a request body. Function tools are
/// user-defined and never billed here.
pub fn builtin_tools_in_request(payload: &Value, format: PayloadFormat) -> Vec<String> {
    let Some(tools) = payload.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for tool in tools {
        let type_name = tool.get("type").and_then(Value::as_str);
        match format {
            PayloadFormat::Claude => {
                // Claude built-ins carry a versioned `type`; plain
                // name+input_schema entries are user functions.
                if let Some(t) = type_name {
                    let canon = canonical_tool_name(t);
                    if BUILTIN_TOOL_TYPES.contains(&canon.as_str()) {
                        out.push(canon);
                    }
                }
            }
            _ => {
                match type_name {
                    Some("function") | None => {}
                    Some(t) => {
                        let canon = canonical_tool_name(t);
                        if BUILTIN_TOOL_TYPES.contains(&canon.as_str()) {
                            out.push(canon);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Billing summary attached to the request state for the log row.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ToolCostSummary {
    pub counts: HashMap<String, i64>,
    pub cost_by_tool: HashMap<String, i64>,
    pub total_cost: i64,
}

/// Price the observed invocation counts. Unpriced tools cost zero here;
/// validation already refused tools the policy does not admit.
pub fn reconcile_tool_costs(
    policy: &ToolPolicy,
    counts: &HashMap<String, i64>,
    quota_per_usd: i64,
) -> ToolCostSummary {
    let mut summary = ToolCostSummary::default();
    for (name, count) in counts {
        if *count <= 0 {
            continue;
        }
        let canon = canonical_tool_name(name);
        summary.counts.insert(canon.clone(), *count);
        if let Some(per_call) = policy.price(&canon).and_then(|p| p.quota(quota_per_usd)) {
            let cost = per_call * count;
            summary.total_cost += cost;
            summary.cost_by_tool.insert(canon, cost);
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn priced(usd: f64) -> ToolPrice {
        ToolPrice {
            usd_per_call: Some(usd),
            quota_per_call: None,
        }
    }

    #[test]
    fn canonicalization() {
        assert_eq!(canonical_tool_name(" Web_Search "), "web_search");
        assert_eq!(canonical_tool_name("web_search_20250305"), "web_search");
        assert_eq!(canonical_tool_name("code_interpreter"), "code_interpreter");
    }

    #[test]
    fn channel_whitelist_wins() {
        let provider = ToolingConfig {
            whitelist: Some(vec!["web_search".into(), "file_search".into()]),
            pricing: [("web_search".to_string(), priced(0.01))].into(),
        };
        let channel = ToolingConfig {
            whitelist: Some(vec!["web_search".into()]),
            pricing: HashMap::new(),
        };
        let policy = ToolPolicy::merge(Some(&channel), &provider, &ModelPricing::default());
        assert!(policy.allows("web_search"));
        assert!(!policy.allows("file_search"));
    }

    #[test]
    fn whitelisted_but_unpriced_is_rejected() {
        let provider = ToolingConfig {
            whitelist: Some(vec!["grounding".into()]),
            pricing: HashMap::new(),
        };
        let policy = ToolPolicy::merge(None, &provider, &ModelPricing::default());
        assert!(!policy.allows("grounding"));
        assert!(policy.validate(&["grounding".to_string()]).is_err());
    }

    #[test]
    fn no_whitelist_means_any_priced_tool() {
        let provider = ToolingConfig {
            whitelist: None,
            pricing: [("web_search".to_string(), priced(0.01))].into(),
        };
        let policy = ToolPolicy::merge(None, &provider, &ModelPricing::default());
        assert!(policy.allows("web_search"));
        assert!(!policy.allows("code_interpreter"));
    }

    #[test]
    fn channel_quota_price_overlays_provider_usd() {
        let provider = ToolingConfig {
            whitelist: None,
            pricing: [("web_search".to_string(), priced(0.03))].into(),
        };
        let channel = ToolingConfig {
            whitelist: None,
            pricing: [(
                "web_search".to_string(),
                ToolPrice {
                    usd_per_call: None,
                    quota_per_call: Some(5),
                },
            )]
            .into(),
        };
        let policy = ToolPolicy::merge(Some(&channel), &provider, &ModelPricing::default());
        assert_eq!(policy.price("web_search").unwrap().quota(500_000), Some(5));
    }

    #[test]
    fn extract_builtins_from_chat_and_claude() {
        let chat = json!({
            "tools": [
                {"type": "function", "function": {"name": "mine"}},
                {"type": "web_search_preview"},
            ]
        });
        assert_eq!(
            builtin_tools_in_request(&chat, PayloadFormat::Chat),
            vec!["web_search_preview".to_string()]
        );

        let claude = json!({
            "tools": [
                {"name": "mine", "input_schema": {"type": "object"}},
                {"type": "web_search_20250305", "name": "web_search"},
            ]
        });
        assert_eq!(
            builtin_tools_in_request(&claude, PayloadFormat::Claude),
            vec!["web_search".to_string()]
        );
    }

    #[test]
    fn reconcile_prices_counts() {
        let provider = ToolingConfig {
            whitelist: None,
            pricing: [("web_search".to_string(), priced(0.01))].into(),
        };
        let policy = ToolPolicy::merge(None, &provider, &ModelPricing::default());
        let counts: HashMap<String, i64> =
            [("web_search".to_string(), 3), ("unpriced".to_string(), 2)].into();
        let summary = reconcile_tool_costs(&policy, &counts, 500_000);
        // 0.01 USD -> 5000 quota per call, 3 calls.
        assert_eq!(summary.total_cost, 15_000);
        assert_eq!(summary.counts.get("web_search"), Some(&3));
        assert!(summary.cost_by_tool.get("unpriced").is_none());
    }
}
