//! AWS Bedrock adaptor.
//!
//! The channel key packs `api_key|region` (or `ak|sk|region`; the first
//! segment is the bearer credential either way). Anthropic models on
//! Bedrock speak the Claude Messages shape with the model in the URL and
//! the anthropic_version inside the body.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{RelayMeta, RequestState};

use super::{AdaptorImpl, Endpoint};

const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub struct BedrockAdaptor;

pub(crate) struct BedrockKey<'a> {
    pub api_key: &'a str,
    pub region: &'a str,
}

pub(crate) fn decode_key(raw: &str) -> RelayResult<BedrockKey<'_>> {
    let parts: Vec<&str> = raw.split('|').collect();
    match parts.as_slice() {
        [api_key, region] => Ok(BedrockKey { api_key, region }),
        [api_key, _secret, region] => Ok(BedrockKey { api_key, region }),
        _ => Err(RelayError::AuthFailed(
            "Bedrock channel key must be 'api_key|region'".into(),
        )),
    }
}

impl AdaptorImpl for BedrockAdaptor {
    fn channel_name(&self, _meta: &RelayMeta) -> &'static str {
        "bedrock"
    }

    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        let key = decode_key(&meta.key)?;
        let action = if meta.is_stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        match endpoint {
            Endpoint::Chat | Endpoint::ClaudeMessages => Ok(format!(
                "https://bedrock-runtime.{}.amazonaws.com/model/{}/{}",
                key.region, meta.actual_model, action
            )),
            other => Err(RelayError::ConversionFailed(format!(
                "Bedrock upstreams do not serve {:?}",
                other
            ))),
        }
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        let key = decode_key(&meta.key)?;
        let value = HeaderValue::from_str(&format!("Bearer {}", key.api_key))
            .map_err(|_| RelayError::AuthFailed("channel key is not header-safe".into()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        let claude =
            crate::relay::convert::claude::chat_to_claude_request(payload, &meta.actual_model)?;
        self.convert_claude_request(meta, state, &claude)
    }

    fn convert_claude_request(
        &self,
        _meta: &RelayMeta,
        _state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            // Bedrock rejects a model in the body and wants the protocol
            // version instead; streaming is chosen by URL.
            obj.remove("model");
            obj.remove("stream");
            obj.insert(
                "anthropic_version".into(),
                Value::String(BEDROCK_ANTHROPIC_VERSION.into()),
            );
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::adaptor::test_support::meta_for;
    use crate::relay::meta::{ApiType, ChannelType};
    use serde_json::json;

    #[test]
    fn key_decoding_variants() {
        let two = decode_key("bedrock-key|us-east-1").unwrap();
        assert_eq!(two.api_key, "bedrock-key");
        assert_eq!(two.region, "us-east-1");

        let three = decode_key("ak|sk|eu-west-1").unwrap();
        assert_eq!(three.region, "eu-west-1");

        assert!(decode_key("justakey").is_err());
    }

    #[test]
    fn url_carries_region_and_model() {
        let mut meta = meta_for(ApiType::Bedrock, ChannelType::Bedrock);
        meta.key = "k|us-west-2".into();
        meta.actual_model = "anthropic.claude-3-5-sonnet-20241022-v2:0".into();
        let url = BedrockAdaptor
            .request_url(&meta, &Endpoint::ClaudeMessages)
            .unwrap();
        assert_eq!(
            url,
            "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-3-5-sonnet-20241022-v2:0/invoke"
        );

        meta.is_stream = true;
        let url = BedrockAdaptor
            .request_url(&meta, &Endpoint::ClaudeMessages)
            .unwrap();
        assert!(url.ends_with("/invoke-with-response-stream"));
    }

    #[test]
    fn body_swaps_model_for_protocol_version() {
        let mut meta = meta_for(ApiType::Bedrock, ChannelType::Bedrock);
        meta.key = "k|us-east-1".into();
        let mut state = RequestState::default();
        let body = BedrockAdaptor
            .convert_claude_request(
                &meta,
                &mut state,
                &json!({"model": "claude", "max_tokens": 8, "stream": true,
                        "messages": []}),
            )
            .unwrap();
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["anthropic_version"], BEDROCK_ANTHROPIC_VERSION);
    }
}
