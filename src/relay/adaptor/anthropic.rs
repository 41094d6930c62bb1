//! Anthropic adaptor.
//!
//! Native Claude Messages upstream. Chat clients are converted to Messages
//! on the way in; native Claude clients pass through with only field
//! filtering and model mapping.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::pricing::{ModelPricing, ToolPrice, ToolingConfig};
use crate::relay::client::normalize_stream_flag;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{RelayMeta, RequestState};

use super::openai::filter_fields;
use super::{base_url, AdaptorImpl, Endpoint};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Fields the Messages API accepts.
const MESSAGES_ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "stream",
    "system",
    "temperature",
    "top_p",
    "top_k",
    "stop_sequences",
    "metadata",
    "tools",
    "tool_choice",
    "thinking",
    "service_tier",
];

pub struct AnthropicAdaptor;

impl AdaptorImpl for AnthropicAdaptor {
    fn channel_name(&self, _meta: &RelayMeta) -> &'static str {
        "anthropic"
    }

    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        let base = base_url(meta, "https://api.anthropic.com");
        match endpoint {
            Endpoint::Chat | Endpoint::ClaudeMessages => Ok(format!("{}/v1/messages", base)),
            other => Err(RelayError::ConversionFailed(format!(
                "Anthropic upstreams do not serve {:?}",
                other
            ))),
        }
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        let value = HeaderValue::from_str(&meta.key)
            .map_err(|_| RelayError::AuthFailed("channel key is not header-safe".into()))?;
        headers.insert("x-api-key", value);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(())
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        _state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        crate::relay::convert::claude::chat_to_claude_request(payload, &meta.actual_model)
    }

    fn convert_claude_request(
        &self,
        meta: &RelayMeta,
        _state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        let mut body = filter_fields(payload, MESSAGES_ALLOWED_FIELDS);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(meta.actual_model.clone()));
        }
        normalize_stream_flag(&mut body);
        Ok(body)
    }

    fn default_model_pricing(&self) -> HashMap<String, ModelPricing> {
        let mut t = HashMap::new();
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
            "claude-3-5-haiku".to_string(),
            ModelPricing {
                ratio: 0.4,
                cached_input_ratio: 0.1,
                completion_ratio: 5.0,
                ..ModelPricing::default()
            },
        );
        t.insert(
            "claude-3-opus".to_string(),
            ModelPricing {
                ratio: 7.5,
                cached_input_ratio: 0.1,
                completion_ratio: 5.0,
                ..ModelPricing::default()
            },
        );
        t
    }

    fn default_tooling(&self) -> ToolingConfig {
        ToolingConfig {
            whitelist: None,
            pricing: [(
                "web_search".to_string(),
                ToolPrice {
                    usd_per_call: Some(0.01),
                    quota_per_call: None,
                },
            )]
            .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::adaptor::test_support::meta_for;
    use crate::relay::meta::{ApiType, ChannelType};
    use serde_json::json;

    #[test]
    fn native_request_passes_with_model_mapping() {
        // Scenario 3: native Claude bytes reach the upstream unchanged
        // apart from field filtering and the mapped model name.
        let mut meta = meta_for(ApiType::Anthropic, ChannelType::Anthropic);
        meta.actual_model = "claude-3-5-sonnet-20241022".into();
        let mut state = RequestState::default();
        let payload = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}],
        });
        let body = AnthropicAdaptor
            .convert_claude_request(&meta, &mut state, &payload)
            .unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(body["messages"], payload["messages"]);
        assert_eq!(body["max_tokens"], 16);
    }

    #[test]
    fn chat_requests_convert_to_messages() {
        let meta = meta_for(ApiType::Anthropic, ChannelType::Anthropic);
        let mut state = RequestState::default();
        let body = AnthropicAdaptor
            .convert_request(
                &meta,
                &mut state,
                &json!({"model": "x", "messages": [{"role": "user", "content": "hi"}]}),
            )
            .unwrap();
        assert!(body.get("max_tokens").is_some());
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn headers_use_api_key_scheme() {
        let meta = meta_for(ApiType::Anthropic, ChannelType::Anthropic);
        let mut headers = HeaderMap::new();
        AnthropicAdaptor.setup_headers(&meta, &mut headers).unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-key");
        assert_eq!(
            headers.get("anthropic-version").unwrap(),
            ANTHROPIC_VERSION
        );
    }
}
