//! Upstream adaptor registry.
//!
//! One adaptor per upstream family. Each knows how to build request URLs,
//! attach credentials from the channel's opaque key, and convert the
//! internal Chat (or native Claude) representation into its wire format.
//! Responses travel back through [`rewrite_json_response`] /
//! [`stream_rewriter`], keyed by the `RewriteMode` the conversion recorded.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod gemini;
pub mod openai;
pub mod vertex;

use std::collections::HashMap;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::pricing::{ModelPricing, ToolingConfig};
use crate::relay::client;
use crate::relay::convert::{claude as claude_conv, gemini as gemini_conv, responses as resp_conv};
use crate::relay::error::RelayResult;
use crate::relay::meta::{ApiType, RelayMeta, RequestState, RewriteMode, Usage};
use crate::relay::stream::{apply_chat_usage, SseRewriter};

/// Endpoint families an adaptor can be asked to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Responses,
    ClaudeMessages,
    Embeddings,
    ImagesGenerations,
    ImagesEdits,
    AudioTranscriptions,
    AudioTranslations,
    AudioSpeech,
    Videos,
    VideoStatus(String),
    Rerank,
    Moderations,
}

/// Capability set every upstream family implements.
pub trait AdaptorImpl: Send + Sync {
    fn channel_name(&self, meta: &RelayMeta) -> &'static str;

    /// Full upstream URL for the endpoint, consulting the channel base URL
    /// and the mapped model where the wire format requires it.
    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String>;

    /// Attach credentials decoded from the channel's opaque key.
    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()>;

    /// Internal Chat representation -> wire body. Records the response
    /// rewrite mode in `state`.
    fn convert_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value>;

    /// Native Claude Messages request -> wire body.
    fn convert_claude_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value>;

    /// Image request conversion; most families take the OpenAI shape as-is.
    fn convert_image_request(
        &self,
        meta: &RelayMeta,
        payload: &Value,
    ) -> RelayResult<Value> {
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(meta.actual_model.clone()));
        }
        Ok(body)
    }

    fn default_model_pricing(&self) -> HashMap<String, ModelPricing> {
        HashMap::new()
    }

    fn default_tooling(&self) -> ToolingConfig {
        ToolingConfig::default()
    }
}

/// Enum dispatch over the adaptor families.
pub enum Adaptor {
    OpenAI(openai::OpenAIAdaptor),
    Azure(azure::AzureAdaptor),
    Anthropic(anthropic::AnthropicAdaptor),
    Gemini(gemini::GeminiAdaptor),
    Bedrock(bedrock::BedrockAdaptor),
    Vertex(vertex::VertexAdaptor),
}

/// Registry lookup: which adaptor serves this API type.
pub fn for_api_type(api_type: ApiType) -> Adaptor {
    match api_type {
        ApiType::OpenAI => Adaptor::OpenAI(openai::OpenAIAdaptor),
        ApiType::Azure => Adaptor::Azure(azure::AzureAdaptor),
        ApiType::Anthropic => Adaptor::Anthropic(anthropic::AnthropicAdaptor),
        ApiType::Gemini => Adaptor::Gemini(gemini::GeminiAdaptor),
        ApiType::Bedrock => Adaptor::Bedrock(bedrock::BedrockAdaptor),
        ApiType::VertexAI => Adaptor::Vertex(vertex::VertexAdaptor),
    }
}

impl Adaptor {
    fn inner(&self) -> &dyn AdaptorImpl {
        match self {
            Adaptor::OpenAI(a) => a,
            Adaptor::Azure(a) => a,
            Adaptor::Anthropic(a) => a,
            Adaptor::Gemini(a) => a,
            Adaptor::Bedrock(a) => a,
            Adaptor::Vertex(a) => a,
        }
    }

    pub fn channel_name(&self, meta: &RelayMeta) -> &'static str {
        self.inner().channel_name(meta)
    }

    pub fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        self.inner().request_url(meta, endpoint)
    }

    pub fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        self.inner().setup_headers(meta, headers)
    }

    pub fn convert_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        self.inner().convert_request(meta, state, payload)
    }

    pub fn convert_claude_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        self.inner().convert_claude_request(meta, state, payload)
    }

    pub fn convert_image_request(&self, meta: &RelayMeta, payload: &Value) -> RelayResult<Value> {
        self.inner().convert_image_request(meta, payload)
    }

    pub fn default_model_pricing(&self) -> HashMap<String, ModelPricing> {
        self.inner().default_model_pricing()
    }

    pub fn default_tooling(&self) -> ToolingConfig {
        self.inner().default_tooling()
    }

    /// Issue the upstream request. Network failures map to relay errors;
    /// HTTP error statuses come back as responses so the caller can
    /// preserve the body verbatim.
    pub async fn do_request(
        &self,
        meta: &RelayMeta,
        endpoint: &Endpoint,
        body: &Value,
    ) -> RelayResult<reqwest::Response> {
        let url = self.request_url(meta, endpoint)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        self.setup_headers(meta, &mut headers)?;
        let http = if meta.is_stream {
            client::stream_client()
        } else {
            client::json_client()
        };
        client::post_json(http, &url, headers, body).await
    }
}

/// Rewrite a non-streaming upstream JSON body into the client's protocol
/// and extract usage. The mode was recorded during request conversion.
pub fn rewrite_json_response(
    mode: RewriteMode,
    meta: &RelayMeta,
    body: &Value,
) -> (Value, Usage) {
    match mode {
        RewriteMode::Passthrough => {
            let mut usage = Usage::default();
            match meta.api_type {
                ApiType::Anthropic | ApiType::Bedrock => {
                    usage = claude_conv::claude_usage(body);
                }
                ApiType::Gemini | ApiType::VertexAI => {
                    usage = gemini_conv::gemini_usage(body);
                }
                _ => {
                    apply_chat_usage(&mut usage, body);
                }
            }
            (body.clone(), usage)
        }
        RewriteMode::ClaudeToChat => {
            let chat = claude_conv::claude_response_to_chat(body, &meta.origin_model);
            let usage = claude_conv::claude_usage(body);
            (chat, usage)
        }
        RewriteMode::ChatToClaude => {
            let claude = claude_conv::chat_response_to_claude(body, &meta.origin_model);
            let mut usage = Usage::default();
            apply_chat_usage(&mut usage, body);
            (claude, usage)
        }
        RewriteMode::ResponsesToChat => {
            let chat = resp_conv::responses_response_to_chat(body, &meta.origin_model);
            let usage = resp_conv::responses_usage(body);
            (chat, usage)
        }
        RewriteMode::ChatToResponses => {
            let responses = resp_conv::chat_response_to_responses(body, &meta.origin_model);
            let mut usage = Usage::default();
            apply_chat_usage(&mut usage, body);
            (responses, usage)
        }
        RewriteMode::GeminiToChat => {
            let chat = gemini_conv::gemini_response_to_chat(body, &meta.origin_model);
            let usage = gemini_conv::gemini_usage(body);
            (chat, usage)
        }
        RewriteMode::GeminiToClaude => {
            let claude = gemini_conv::gemini_response_to_claude(body, &meta.origin_model);
            let usage = gemini_conv::gemini_usage(body);
            (claude, usage)
        }
    }
}

impl SseRewriter for Box<dyn SseRewriter> {
    fn on_frame(&mut self, event: Option<&str>, data: &Value) -> Vec<String> {
        (**self).on_frame(event, data)
    }

    fn finish(&mut self) -> Vec<String> {
        (**self).finish()
    }

    fn emits_done(&self) -> bool {
        (**self).emits_done()
    }

    fn usage(&self) -> Usage {
        (**self).usage()
    }
}

/// Trim a configured base URL, falling back to the family default.
pub(crate) fn base_url<'a>(meta: &'a RelayMeta, default: &'a str) -> &'a str {
    meta.base_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
}

/// Test fixtures shared by the per-provider adaptor tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Instant;

    use crate::relay::meta::{ApiType, ChannelType, RelayMeta};

    pub(crate) fn meta_for(api_type: ApiType, channel_type: ChannelType) -> RelayMeta {
        RelayMeta {
            api_type,
            channel_type,
            channel_id: 1,
            user_id: 1,
            token_id: 1,
            token_name: "t".into(),
            group: "default".into(),
            origin_model: "m".into(),
            actual_model: "m".into(),
            model_mapping: vec![],
            request_path: "/v1/chat/completions".into(),
            is_stream: false,
            start_time: Instant::now(),
            prompt_tokens: 0,
            base_url: None,
            key: "sk-key".into(),
            group_ratio: 1.0,
            response_api_fallback: false,
            claude_conversion: false,
            claude_native: false,
            request_id: "r".into(),
            trace_id: "t".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::meta_for;
    use super::*;
    use crate::relay::meta::ChannelType;
    use serde_json::json;

    #[test]
    fn registry_covers_every_api_type() {
        for api in [
            ApiType::OpenAI,
            ApiType::Azure,
            ApiType::Anthropic,
            ApiType::Gemini,
            ApiType::Bedrock,
            ApiType::VertexAI,
        ] {
            let meta = meta_for(api, ChannelType::OpenAI);
            let adaptor = for_api_type(api);
            assert!(!adaptor.channel_name(&meta).is_empty());
        }
    }

    #[test]
    fn passthrough_rewrite_extracts_usage_per_wire_format() {
        let meta = meta_for(ApiType::Anthropic, ChannelType::Anthropic);
        let body = json!({"usage": {"input_tokens": 4, "output_tokens": 6}});
        let (out, usage) = rewrite_json_response(RewriteMode::Passthrough, &meta, &body);
        assert_eq!(out, body);
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 6);

        let meta = meta_for(ApiType::OpenAI, ChannelType::OpenAI);
        let body = json!({"usage": {"prompt_tokens": 3, "completion_tokens": 2}});
        let (_, usage) = rewrite_json_response(RewriteMode::Passthrough, &meta, &body);
        assert_eq!(usage.total_tokens, 5);
    }

    #[test]
    fn gemini_to_claude_rewrite_produces_message() {
        let meta = meta_for(ApiType::Gemini, ChannelType::Gemini);
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "ok"}]},
                            "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1},
        });
        let (out, usage) = rewrite_json_response(RewriteMode::GeminiToClaude, &meta, &body);
        assert_eq!(out["type"], "message");
        assert_eq!(usage.prompt_tokens, 2);
    }
}
