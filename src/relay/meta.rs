//! Per-request context structures shared by the relay pipeline.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Which adaptor family handles a call. Independent of the numeric channel
/// type: several channel types share one adaptor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    OpenAI,
    Azure,
    Anthropic,
    Gemini,
    Bedrock,
    VertexAI,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::OpenAI => "openai",
            ApiType::Azure => "azure",
            ApiType::Anthropic => "anthropic",
            ApiType::Gemini => "gemini",
            ApiType::Bedrock => "bedrock",
            ApiType::VertexAI => "vertexai",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable numeric channel-type ids as stored in channel rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    OpenAI,
    Azure,
    Anthropic,
    Gemini,
    DeepSeek,
    XAI,
    Groq,
    Bedrock,
    VertexAI,
    Unknown(i64),
}

impl ChannelType {
    pub fn id(&self) -> i64 {
        match self {
            ChannelType::OpenAI => 1,
            ChannelType::Azure => 3,
            ChannelType::Anthropic => 14,
            ChannelType::Gemini => 24,
            ChannelType::Bedrock => 33,
            ChannelType::DeepSeek => 36,
            ChannelType::Groq => 29,
            ChannelType::XAI => 44,
            ChannelType::VertexAI => 42,
            ChannelType::Unknown(id) => *id,
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            1 => ChannelType::OpenAI,
            3 => ChannelType::Azure,
            14 => ChannelType::Anthropic,
            24 => ChannelType::Gemini,
            29 => ChannelType::Groq,
            33 => ChannelType::Bedrock,
            36 => ChannelType::DeepSeek,
            42 => ChannelType::VertexAI,
            44 => ChannelType::XAI,
            other => ChannelType::Unknown(other),
        }
    }

    pub fn api_type(&self) -> ApiType {
        match self {
            ChannelType::Azure => ApiType::Azure,
            ChannelType::Anthropic => ApiType::Anthropic,
            ChannelType::Gemini => ApiType::Gemini,
            ChannelType::Bedrock => ApiType::Bedrock,
            ChannelType::VertexAI => ApiType::VertexAI,
            // DeepSeek, xAI, Groq and unknown types speak the OpenAI protocol.
            _ => ApiType::OpenAI,
        }
    }

    /// Only first-party OpenAI serves the Responses API natively.
    pub fn supports_native_responses(&self) -> bool {
        matches!(self, ChannelType::OpenAI)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Azure => "azure",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
            ChannelType::DeepSeek => "deepseek",
            ChannelType::XAI => "xai",
            ChannelType::Groq => "groq",
            ChannelType::Bedrock => "bedrock",
            ChannelType::VertexAI => "vertexai",
            ChannelType::Unknown(_) => "unknown",
        }
    }
}

/// Immutable-after-init bundle describing one relay request.
///
/// Identity fields never change. Routing fields (`request_path`,
/// `actual_model`, the fallback flags) may be rewritten only before the
/// upstream request is issued; after that the meta is read-only.
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub api_type: ApiType,
    pub channel_type: ChannelType,
    pub channel_id: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    /// What the client asked for; billing keys off this across fallbacks.
    pub origin_model: String,
    /// Upstream-facing name after the channel's model mapping.
    pub actual_model: String,
    pub model_mapping: Vec<(String, String)>,
    pub request_path: String,
    pub is_stream: bool,
    pub start_time: Instant,
    /// Filled during processing once the prompt has been measured.
    pub prompt_tokens: i64,
    pub base_url: Option<String>,
    /// Channel key, opaque; decoded by the adaptor.
    pub key: String,
    pub group_ratio: f64,
    /// This Responses request was downgraded to Chat upstream.
    pub response_api_fallback: bool,
    /// Claude request converted to another wire format upstream.
    pub claude_conversion: bool,
    /// Claude request served by a native Anthropic upstream.
    pub claude_native: bool,
    pub request_id: String,
    pub trace_id: String,
}

impl RelayMeta {
    pub fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

/// Token counts split by modality, mirroring the public usage envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenDetails {
    pub text_tokens: i64,
    pub image_tokens: i64,
    pub cached_tokens: i64,
    pub audio_tokens: i64,
}

/// Usage totals reconciled after the upstream call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub prompt_tokens_details: TokenDetails,
    pub completion_tokens_details: TokenDetails,
    /// Quota charged for built-in tool invocations.
    pub tools_cost: i64,
}

impl Usage {
    pub fn new(prompt: i64, completion: i64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            ..Self::default()
        }
    }

    pub fn recompute_total(&mut self) {
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// How the response body must be rewritten before reaching the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewriteMode {
    /// Upstream speaks the same wire format the client asked in.
    #[default]
    Passthrough,
    /// Chat request upgraded to Responses upstream; answers come back as
    /// Responses and must be rendered as Chat.
    ResponsesToChat,
    /// Responses request downgraded to Chat upstream; answers must be
    /// rendered as Responses events/objects.
    ChatToResponses,
    /// Upstream answered in Chat shape; client expects Claude Messages.
    ChatToClaude,
    /// Upstream answered in Claude shape; client expects Chat.
    ClaudeToChat,
    /// Upstream answered in Gemini shape; client expects Claude Messages.
    GeminiToClaude,
    /// Upstream answered in Gemini shape; client expects Chat.
    GeminiToChat,
}

/// Mutable per-request scratch state threaded explicitly through the
/// controller instead of a string-keyed context bag.
#[derive(Debug, Default)]
pub struct RequestState {
    /// Body actually sent upstream, for diagnostics and task snapshots.
    pub converted_request: Option<serde_json::Value>,
    pub rewrite: RewriteMode,
    /// Built-in tool invocation counts collected by the stream rewriters.
    pub tool_invocations: std::collections::HashMap<String, i64>,
    pub web_search_calls: i64,
    pub usage: Usage,
    /// Summary of tool billing attached for the log row.
    pub tool_cost_summary: Option<crate::relay::toolcost::ToolCostSummary>,
}

impl RequestState {
    pub fn count_tool(&mut self, name: &str) {
        *self
            .tool_invocations
            .entry(name.trim().to_ascii_lowercase())
            .or_insert(0) += 1;
    }
}

/// Rough token estimate for text the upstream never counted (~3.5 chars per
/// token).
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_roundtrip() {
        for ct in [
            ChannelType::OpenAI,
            ChannelType::Azure,
            ChannelType::Anthropic,
            ChannelType::Gemini,
            ChannelType::DeepSeek,
            ChannelType::XAI,
            ChannelType::Groq,
            ChannelType::Bedrock,
            ChannelType::VertexAI,
        ] {
            assert_eq!(ChannelType::from_id(ct.id()), ct);
        }
        assert_eq!(ChannelType::from_id(999), ChannelType::Unknown(999));
    }

    #[test]
    fn openai_compatible_types_share_the_openai_adaptor() {
        assert_eq!(ChannelType::DeepSeek.api_type(), ApiType::OpenAI);
        assert_eq!(ChannelType::Groq.api_type(), ApiType::OpenAI);
        assert_eq!(ChannelType::XAI.api_type(), ApiType::OpenAI);
        assert_eq!(ChannelType::Azure.api_type(), ApiType::Azure);
    }

    #[test]
    fn only_first_party_openai_is_responses_native() {
        assert!(ChannelType::OpenAI.supports_native_responses());
        assert!(!ChannelType::Azure.supports_native_responses());
        assert!(!ChannelType::DeepSeek.supports_native_responses());
    }

    #[test]
    fn usage_totals() {
        let mut u = Usage::new(3, 2);
        assert_eq!(u.total_tokens, 5);
        u.completion_tokens = 10;
        u.recompute_total();
        assert_eq!(u.total_tokens, 13);
    }

    #[test]
    fn estimate_is_rough_chars_over_3_5() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello, my friend"), 5);
    }

    #[test]
    fn tool_counts_canonicalize_names() {
        let mut state = RequestState::default();
        state.count_tool(" Web_Search ");
        state.count_tool("web_search");
        assert_eq!(state.tool_invocations.get("web_search"), Some(&2));
    }
}
