//! Relay error types and their public envelopes.
//!
//! Errors raised before the upstream call map onto the §7 kinds. Upstream
//! 4xx/5xx responses are wrapped verbatim: the original status code and body
//! travel back to the client unchanged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::logger;
use crate::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("insufficient quota: {0}")]
    QuotaExceeded(String),
    #[error("model not available: {0}")]
    ModelNotAvailable(String),
    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),
    #[error("unsupported content block: {0}")]
    UnsupportedContentBlock(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Upstream answered with an error status; body preserved verbatim.
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: Value },
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),
    #[error("upstream request failed: {0}")]
    UpstreamUnreachable(String),
    #[error("conversion failed: {0}")]
    ConversionFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientQuota => {
                RelayError::QuotaExceeded("token balance exhausted".to_string())
            }
            StoreError::NotFound => RelayError::Internal("referenced row missing".to_string()),
            StoreError::Db(msg) => RelayError::Internal(msg),
        }
    }
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MalformedRequest(_)
            | RelayError::ToolNotAllowed(_)
            | RelayError::UnsupportedContentBlock(_) => StatusCode::BAD_REQUEST,
            RelayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::QuotaExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            RelayError::ModelNotAvailable(_) => StatusCode::NOT_FOUND,
            RelayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::ConversionFailed(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RelayError::MalformedRequest(_) => "invalid_request_error",
            RelayError::AuthFailed(_) => "authentication_error",
            RelayError::Forbidden(_) => "permission_error",
            RelayError::QuotaExceeded(_) => "insufficient_quota",
            RelayError::ModelNotAvailable(_) => "model_not_found",
            RelayError::ToolNotAllowed(_) => "tool_not_allowed",
            RelayError::UnsupportedContentBlock(_) => "invalid_request_error",
            RelayError::RateLimited(_) => "rate_limit_error",
            RelayError::Upstream { .. } => "upstream_error",
            RelayError::UpstreamTimeout(_) => "timeout_error",
            RelayError::UpstreamUnreachable(_) => "upstream_error",
            RelayError::ConversionFailed(_) | RelayError::Internal(_) => "api_error",
        }
    }

    /// OpenAI-shaped envelope: `{"error": {type, code, message, param}}`.
    pub fn openai_body(&self) -> Value {
        if let RelayError::Upstream { body, .. } = self {
            if body.get("error").is_some() {
                return body.clone();
            }
        }
        json!({
            "error": {
                "type": self.kind(),
                "code": self.kind(),
                "message": self.to_string(),
                "param": Value::Null,
            }
        })
    }

    /// Anthropic-shaped envelope: `{"type":"error","error":{type,message}}`.
    pub fn claude_body(&self) -> Value {
        if let RelayError::Upstream { body, .. } = self {
            if body.get("type").and_then(Value::as_str) == Some("error") {
                return body.clone();
            }
        }
        json!({
            "type": "error",
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }

    /// Render with the Claude envelope instead of the OpenAI default.
    pub fn into_claude_response(self) -> Response {
        let status = self.status();
        log_outgoing(&self, status);
        (status, Json(self.claude_body())).into_response()
    }
}

fn log_outgoing(err: &RelayError, status: StatusCode) {
    logger::error(
        "relay",
        &format!(
            "returning error response: status={}, type={}, message={}",
            status.as_u16(),
            err.kind(),
            err
        ),
    );
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        log_outgoing(&self, status);
        (status, Json(self.openai_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            RelayError::MalformedRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::QuotaExceeded("x".into()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            RelayError::ModelNotAvailable("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::UpstreamTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::Upstream {
                status: 502,
                body: json!({}),
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn upstream_body_preserved_verbatim() {
        let body = json!({"error": {"type": "server_error", "message": "boom"}});
        let err = RelayError::Upstream {
            status: 500,
            body: body.clone(),
        };
        assert_eq!(err.openai_body(), body);
    }

    #[test]
    fn envelopes_have_expected_shape() {
        let err = RelayError::ToolNotAllowed("web_search".into());
        let openai = err.openai_body();
        assert!(openai["error"]["message"]
            .as_str()
            .unwrap()
            .contains("web_search"));
        let claude = err.claude_body();
        assert_eq!(claude["type"], "error");
        assert!(claude["error"]["message"].is_string());
    }
}
