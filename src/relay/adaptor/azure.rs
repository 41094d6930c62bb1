//! Azure OpenAI adaptor.
//!
//! Same wire format as OpenAI but deployment-scoped URLs and `api-key`
//! authentication. The channel key may carry the API version after a `|`.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{RelayMeta, RequestState};

use super::openai::OpenAIAdaptor;
use super::{base_url, AdaptorImpl, Endpoint};

const DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct AzureAdaptor;

fn split_key(raw: &str) -> (&str, &str) {
    match raw.split_once('|') {
        Some((key, version)) if !version.trim().is_empty() => (key, version.trim()),
        _ => (raw, DEFAULT_API_VERSION),
    }
}

/// Azure deployment names cannot contain dots.
fn deployment_name(model: &str) -> String {
    model.replace('.', "")
}

impl AdaptorImpl for AzureAdaptor {
    fn channel_name(&self, _meta: &RelayMeta) -> &'static str {
        "azure"
    }

    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        let base = base_url(meta, "");
        if base.is_empty() {
            return Err(RelayError::Internal(
                "Azure channels require a base_url".into(),
            ));
        }
        let (_, api_version) = split_key(&meta.key);
        let deployment = deployment_name(&meta.actual_model);
        let path = match endpoint {
            Endpoint::Chat => "chat/completions",
            Endpoint::Embeddings => "embeddings",
            Endpoint::ImagesGenerations => "images/generations",
            Endpoint::AudioTranscriptions => "audio/transcriptions",
            Endpoint::AudioTranslations => "audio/translations",
            Endpoint::AudioSpeech => "audio/speech",
            other => {
                return Err(RelayError::ConversionFailed(format!(
                    "Azure deployments do not serve {:?}",
                    other
                )))
            }
        };
        Ok(format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            base, deployment, path, api_version
        ))
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        let (key, _) = split_key(&meta.key);
        let value = HeaderValue::from_str(key)
            .map_err(|_| RelayError::AuthFailed("channel key is not header-safe".into()))?;
        headers.insert("api-key", value);
        Ok(())
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        OpenAIAdaptor.convert_request(meta, state, payload)
    }

    fn convert_claude_request(
        &self,
        meta: &RelayMeta,
        state: &mut RequestState,
        payload: &Value,
    ) -> RelayResult<Value> {
        OpenAIAdaptor.convert_claude_request(meta, state, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::adaptor::test_support::meta_for;
    use crate::relay::meta::{ApiType, ChannelType};

    #[test]
    fn deployment_url_uses_mapped_model_and_version() {
        let mut meta = meta_for(ApiType::Azure, ChannelType::Azure);
        meta.base_url = Some("https://example.openai.azure.com".into());
        meta.actual_model = "gpt-4.1".into();
        meta.key = "azkey|2024-10-21".into();
        let url = AzureAdaptor.request_url(&meta, &Endpoint::Chat).unwrap();
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/gpt-41/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn key_without_version_falls_back() {
        let (key, version) = split_key("plainkey");
        assert_eq!(key, "plainkey");
        assert_eq!(version, DEFAULT_API_VERSION);
    }

    #[test]
    fn missing_base_url_is_an_error() {
        let meta = meta_for(ApiType::Azure, ChannelType::Azure);
        assert!(AzureAdaptor.request_url(&meta, &Endpoint::Chat).is_err());
    }
}
