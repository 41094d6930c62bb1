//! Google Gemini adaptor.
//!
//! Model and streaming mode travel in the URL
//! (`models/{model}:generateContent` vs `:streamGenerateContent?alt=sse`).

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::pricing::{ModelPricing, ToolPrice, ToolingConfig};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{RelayMeta, RequestState};

use super::{base_url, AdaptorImpl, Endpoint};

const API_VERSION: &str = "v1beta";

pub struct GeminiAdaptor;

impl AdaptorImpl for GeminiAdaptor {
    fn channel_name(&self, _meta: &RelayMeta) -> &'static str {
        "gemini"
    }

    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        let base = base_url(meta, "https://generativelanguage.googleapis.com");
        match endpoint {
            Endpoint::Chat | Endpoint::ClaudeMessages => {
                let action = if meta.is_stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                Ok(format!(
                    "{}/{}/models/{}:{}",
                    base, API_VERSION, meta.actual_model, action
                ))
            }
            Endpoint::Embeddings => Ok(format!(
                "{}/{}/models/{}:embedContent",
                base, API_VERSION, meta.actual_model
            )),
            other => Err(RelayError::ConversionFailed(format!(
                "Gemini upstreams do not serve {:?}",
                other
            ))),
        }
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        let value = HeaderValue::from_str(&meta.key)
            .map_err(|_| RelayError::AuthFailed("channel key is not header-safe".into()))?;
        headers.insert("x-goog-api-key", value);
        Ok(())
    }

    fn convert_request(
        &self,
        _meta: &RelayMeta,
        _state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        crate::relay::convert::gemini::chat_to_gemini_request(payload)
    }

    fn convert_claude_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        let chat =
            crate::relay::convert::claude::claude_to_chat_request(payload, &meta.actual_model)?;
        self.convert_request(meta, state, &chat)
    }

    fn default_model_pricing(&self) -> HashMap<String, ModelPricing> {
        let mut t = HashMap::new();
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
            "gemini-1.5-pro".to_string(),
            ModelPricing {
                ratio: 0.625,
                cached_input_ratio: 0.25,
                completion_ratio: 4.0,
                ..ModelPricing::default()
            },
        );
        t
    }

    fn default_tooling(&self) -> ToolingConfig {
        ToolingConfig {
            whitelist: None,
            pricing: [(
                "grounding".to_string(),
                ToolPrice {
                    usd_per_call: Some(0.035),
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

    #[test]
    fn url_switches_on_stream_flag() {
        let mut meta = meta_for(ApiType::Gemini, ChannelType::Gemini);
        meta.actual_model = "gemini-2.0-flash".into();
        let a = GeminiAdaptor;
        assert_eq!(
            a.request_url(&meta, &Endpoint::Chat).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        meta.is_stream = true;
        assert_eq!(
            a.request_url(&meta, &Endpoint::Chat).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn headers_use_goog_api_key() {
        let meta = meta_for(ApiType::Gemini, ChannelType::Gemini);
        let mut headers = HeaderMap::new();
        GeminiAdaptor.setup_headers(&meta, &mut headers).unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "sk-key");
    }
}
