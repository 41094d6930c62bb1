//! OpenAI adaptor.
//!
//! Serves first-party OpenAI and the OpenAI-compatible providers (DeepSeek,
//! xAI, Groq) which differ only in base URL and catalog.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::pricing::{ModelPricing, ToolPrice, ToolingConfig};
use crate::relay::client::normalize_stream_flag;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{ChannelType, RelayMeta, RequestState};

use super::{base_url, AdaptorImpl, Endpoint};

/// Fields the Chat Completions surface accepts; everything else is dropped
/// before the bytes leave the gateway.
pub(crate) const CHAT_ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "n",
    "stream",
    "stream_options",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "user",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "response_format",
    "seed",
    "logprobs",
    "top_logprobs",
    "service_tier",
    "store",
    "reasoning_effort",
    "metadata",
    "modalities",
    "audio",
    "prediction",
];

/// Keep only the allowed keys of an object payload.
pub(crate) fn filter_fields(payload: &Value, allowed: &[&str]) -> Value {
    match payload.as_object() {
        Some(obj) => Value::Object(
            obj.iter()
                .filter(|(key, _)| allowed.contains(&key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => payload.clone(),
    }
}

pub struct OpenAIAdaptor;

fn default_base(channel_type: ChannelType) -> &'static str {
    match channel_type {
        ChannelType::DeepSeek => "https://api.deepseek.com",
        ChannelType::XAI => "https://api.x.ai",
        ChannelType::Groq => "https://api.groq.com/openai",
        _ => "https://api.openai.com",
    }
}

impl AdaptorImpl for OpenAIAdaptor {
    fn channel_name(&self, meta: &RelayMeta) -> &'static str {
        match meta.channel_type {
            ChannelType::DeepSeek => "deepseek",
            ChannelType::XAI => "xai",
            ChannelType::Groq => "groq",
            _ => "openai",
        }
    }

    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        let base = base_url(meta, default_base(meta.channel_type));
        let path = match endpoint {
            Endpoint::Chat => "/v1/chat/completions".to_string(),
            Endpoint::Responses => "/v1/responses".to_string(),
            Endpoint::ClaudeMessages => {
                return Err(RelayError::ConversionFailed(
                    "OpenAI upstreams do not speak Claude Messages".into(),
                ))
            }
            Endpoint::Embeddings => "/v1/embeddings".to_string(),
            Endpoint::ImagesGenerations => "/v1/images/generations".to_string(),
            Endpoint::ImagesEdits => "/v1/images/edits".to_string(),
            Endpoint::AudioTranscriptions => "/v1/audio/transcriptions".to_string(),
            Endpoint::AudioTranslations => "/v1/audio/translations".to_string(),
            Endpoint::AudioSpeech => "/v1/audio/speech".to_string(),
            Endpoint::Videos => "/v1/videos".to_string(),
            Endpoint::VideoStatus(id) => format!("/v1/videos/{}", id),
            Endpoint::Rerank => "/v2/rerank".to_string(),
            Endpoint::Moderations => "/v1/moderations".to_string(),
        };
        Ok(format!("{}{}", base, path))
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        let value = HeaderValue::from_str(&format!("Bearer {}", meta.key))
            .map_err(|_| RelayError::AuthFailed("channel key is not header-safe".into()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        _state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        let mut body = filter_fields(payload, CHAT_ALLOWED_FIELDS);
        let obj = body
            .as_object_mut()
            .ok_or_else(|| RelayError::MalformedRequest("request body must be an object".into()))?;
        obj.insert("model".into(), Value::String(meta.actual_model.clone()));
        if normalize_stream_flag(&mut body) {
            if let Some(obj) = body.as_object_mut() {
                // Ask for the aggregated usage chunk so billing never estimates.
                obj.insert(
                    "stream_options".into(),
                    serde_json::json!({"include_usage": true}),
                );
            }
        }
        Ok(body)
    }

    fn convert_claude_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        let chat = crate::relay::convert::claude::claude_to_chat_request(
            payload,
            &meta.actual_model,
        )?;
        self.convert_request(meta, state, &chat)
    }

    fn default_model_pricing(&self) -> HashMap<String, ModelPricing> {
        let mut t = HashMap::new();
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
            "o3-mini".to_string(),
            ModelPricing {
                ratio: 0.55,
                cached_input_ratio: 0.25,
                completion_ratio: 4.0,
                ..ModelPricing::default()
            },
        );
        t.insert(
            "deepseek-chat".to_string(),
            ModelPricing {
                ratio: 0.135,
                cached_input_ratio: 0.25,
                completion_ratio: 4.0,
                ..ModelPricing::default()
            },
        );
        t.insert(
            "grok-2".to_string(),
            ModelPricing {
                ratio: 1.0,
                completion_ratio: 5.0,
                ..ModelPricing::default()
            },
        );
        t
    }

    fn default_tooling(&self) -> ToolingConfig {
        ToolingConfig {
            whitelist: None,
            pricing: [
                (
                    "web_search".to_string(),
                    ToolPrice {
                        usd_per_call: Some(0.01),
                        quota_per_call: None,
                    },
                ),
                (
                    "web_search_preview".to_string(),
                    ToolPrice {
                        usd_per_call: Some(0.01),
                        quota_per_call: None,
                    },
                ),
                (
                    "code_interpreter".to_string(),
                    ToolPrice {
                        usd_per_call: Some(0.03),
                        quota_per_call: None,
                    },
                ),
                (
                    "file_search".to_string(),
                    ToolPrice {
                        usd_per_call: Some(0.0025),
                        quota_per_call: None,
                    },
                ),
            ]
            .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::adaptor::test_support::meta_for;
    use crate::relay::meta::ApiType;
    use serde_json::json;

    #[test]
    fn urls_respect_channel_type_and_base_override() {
        let meta = meta_for(ApiType::OpenAI, ChannelType::OpenAI);
        let a = OpenAIAdaptor;
        assert_eq!(
            a.request_url(&meta, &Endpoint::Chat).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );

        let meta = meta_for(ApiType::OpenAI, ChannelType::DeepSeek);
        assert_eq!(
            a.request_url(&meta, &Endpoint::Chat).unwrap(),
            "https://api.deepseek.com/v1/chat/completions"
        );

        let mut meta = meta_for(ApiType::OpenAI, ChannelType::OpenAI);
        meta.base_url = Some("https://proxy.example.com/".into());
        assert_eq!(
            a.request_url(&meta, &Endpoint::Responses).unwrap(),
            "https://proxy.example.com/v1/responses"
        );
    }

    #[test]
    fn convert_filters_unknown_fields_and_maps_model() {
        let mut meta = meta_for(ApiType::OpenAI, ChannelType::OpenAI);
        meta.actual_model = "gpt-4o-2024-08-06".into();
        let mut state = RequestState::default();
        let body = OpenAIAdaptor
            .convert_request(
                &meta,
                &mut state,
                &json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": "hi"}],
                    "custom_junk": true,
                }),
            )
            .unwrap();
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert!(body.get("custom_junk").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn streaming_requests_ask_for_usage() {
        let meta = meta_for(ApiType::OpenAI, ChannelType::OpenAI);
        let mut state = RequestState::default();
        let body = OpenAIAdaptor
            .convert_request(
                &meta,
                &mut state,
                &json!({"model": "m", "messages": [], "stream": true}),
            )
            .unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn claude_requests_lower_to_chat() {
        let meta = meta_for(ApiType::OpenAI, ChannelType::OpenAI);
        let mut state = RequestState::default();
        let body = OpenAIAdaptor
            .convert_claude_request(
                &meta,
                &mut state,
                &json!({
                    "model": "claude-3-5-sonnet",
                    "max_tokens": 16,
                    "system": "be kind",
                    "messages": [{"role": "user", "content": "hi"}],
                }),
            )
            .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }
}
