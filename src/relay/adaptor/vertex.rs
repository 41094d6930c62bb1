//! Google Vertex AI adaptor.
//!
//! Channel key packs `region|project|access_token`. Gemini publisher models
//! share the Gemini wire format with a project-scoped URL.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{RelayMeta, RequestState};

use super::{AdaptorImpl, Endpoint};

pub struct VertexAdaptor;

pub(crate) struct VertexKey<'a> {
    pub region: &'a str,
    pub project: &'a str,
    pub token: &'a str,
}

pub(crate) fn decode_key(raw: &str) -> RelayResult<VertexKey<'_>> {
    let mut parts = raw.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(region), Some(project), Some(token))
            if !region.is_empty() && !project.is_empty() && !token.is_empty() =>
        {
            Ok(VertexKey {
                region,
                project,
                token,
            })
        }
        _ => Err(RelayError::AuthFailed(
            "Vertex channel key must be 'region|project|access_token'".into(),
        )),
    }
}

impl AdaptorImpl for VertexAdaptor {
    fn channel_name(&self, _meta: &RelayMeta) -> &'static str {
        "vertexai"
    }

    fn request_url(&self, meta: &RelayMeta, endpoint: &Endpoint) -> RelayResult<String> {
        let key = decode_key(&meta.key)?;
        let action = if meta.is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        match endpoint {
            Endpoint::Chat | Endpoint::ClaudeMessages => Ok(format!(
                "https://{}-aiplatform.googleapis.com/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
                key.region, key.project, key.region, meta.actual_model, action
            )),
            other => Err(RelayError::ConversionFailed(format!(
                "Vertex upstreams do not serve {:?}",
                other
            ))),
        }
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) -> RelayResult<()> {
        let key = decode_key(&meta.key)?;
        let value = HeaderValue::from_str(&format!("Bearer {}", key.token))
            .map_err(|_| RelayError::AuthFailed("channel key is not header-safe".into()))?;
        headers.insert(AUTHORIZATION, value);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::adaptor::test_support::meta_for;
    use crate::relay::meta::{ApiType, ChannelType};

    #[test]
    fn key_must_have_three_segments() {
        let key = decode_key("us-central1|my-project|ya29.token").unwrap();
        assert_eq!(key.region, "us-central1");
        assert_eq!(key.project, "my-project");
        assert_eq!(key.token, "ya29.token");
        assert!(decode_key("us-central1|my-project").is_err());
        assert!(decode_key("").is_err());
    }

    #[test]
    fn url_is_project_scoped() {
        let mut meta = meta_for(ApiType::VertexAI, ChannelType::VertexAI);
        meta.key = "europe-west4|proj-9|tok".into();
        meta.actual_model = "gemini-2.0-flash".into();
        let url = VertexAdaptor.request_url(&meta, &Endpoint::Chat).unwrap();
        assert_eq!(
            url,
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/proj-9/locations/europe-west4/publishers/google/models/gemini-2.0-flash:generateContent"
        );
    }
}
