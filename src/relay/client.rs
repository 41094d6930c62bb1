//! Outbound HTTP plumbing shared by all adaptors.
//!
//! Two process-wide reqwest clients: a JSON client bounded by the
//! `RELAY_TIMEOUT` deadline and a streaming client with a longer ceiling.
//! Also hosts the SSE line framing used by the streaming engine.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Proxy};
use serde_json::Value;

use super::error::{RelayError, RelayResult};
use crate::{config, logger};

/// Largest inbound request body the gateway will parse.
pub const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;
/// Largest non-streaming upstream response read before JSON decode.
pub const MAX_RESPONSE_BODY: usize = 32 * 1024 * 1024;
/// Largest single SSE frame accepted from an upstream.
pub const MAX_SSE_FRAME: usize = 1024 * 1024;

const STREAMING_TIMEOUT_SECS: u64 = 600;

static JSON_CLIENT: OnceLock<Client> = OnceLock::new();
static STREAM_CLIENT: OnceLock<Client> = OnceLock::new();

fn build_client(timeout_secs: u64) -> Client {
    let cfg = config::load();
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));
    if timeout_secs > 0 {
        builder = builder.timeout(Duration::from_secs(timeout_secs));
    }
    if let Some(proxy_url) = cfg.relay_proxy.as_deref() {
        match Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(_) => logger::warn(
                "client",
                &format!("ignoring unparsable RELAY_PROXY: {}", proxy_url),
            ),
        }
    }
    builder.build().unwrap_or_default()
}

/// Client for non-streaming upstream calls; honors `RELAY_TIMEOUT`.
pub fn json_client() -> &'static Client {
    JSON_CLIENT.get_or_init(|| build_client(config::load().relay_timeout_secs))
}

/// Client for streaming upstream calls. The per-request deadline would kill
/// long generations, so only the connect timeout and a wide ceiling apply.
pub fn stream_client() -> &'static Client {
    STREAM_CLIENT.get_or_init(|| build_client(STREAMING_TIMEOUT_SECS))
}

fn map_send_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::UpstreamTimeout("upstream deadline exceeded".to_string())
    } else if e.is_connect() {
        RelayError::UpstreamUnreachable(format!("connection failed: {}", e))
    } else {
        RelayError::UpstreamUnreachable(format!("request error: {}", e))
    }
}

/// POST a JSON body and return the raw response. Network failures map onto
/// the relay error kinds; HTTP error statuses are left to the caller so the
/// upstream body can be preserved verbatim.
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> RelayResult<reqwest::Response> {
    logger::debug("client", &format!("sending request to {}", url));
    client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(map_send_error)
}

/// GET with headers; used by async-task polling.
pub async fn get(
    client: &Client,
    url: &str,
    headers: HeaderMap,
) -> RelayResult<reqwest::Response> {
    client
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(map_send_error)
}

/// Read a bounded response body and parse it as JSON.
pub async fn read_json_body(response: reqwest::Response) -> RelayResult<(u16, Value)> {
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::UpstreamUnreachable(format!("failed to read response: {}", e)))?;
    if bytes.len() > MAX_RESPONSE_BODY {
        return Err(RelayError::Internal("upstream response too large".into()));
    }
    if bytes.is_empty() {
        logger::warn("client", "received empty response body from upstream");
        return Ok((status, Value::Null));
    }
    let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
        let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(500)]).to_string();
        logger::error(
            "client",
            &format!("failed to parse upstream JSON: {}, body: {}", e, preview),
        );
        RelayError::UpstreamUnreachable(format!("unparsable upstream response: {}", e))
    })?;
    Ok((status, body))
}

/// Coerce a loosely-typed `stream` flag to a real boolean in place and
/// report it.
pub fn normalize_stream_flag(payload: &mut Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };
    let is_streaming = match obj.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    };
    if obj.contains_key("stream") {
        obj.insert("stream".to_string(), Value::Bool(is_streaming));
    }
    is_streaming
}

// ============================================================================
// SSE line framing
// ============================================================================

/// One parsed SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// `event: <name>`
    Event(String),
    /// `data: <payload>`
    Data(String),
    /// Blank separator or a comment/field we pass over.
    Other,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    if let Some(rest) = line.strip_prefix("data:") {
        return SseLine::Data(rest.strip_prefix(' ').unwrap_or(rest).to_string());
    }
    if let Some(rest) = line.strip_prefix("event:") {
        return SseLine::Event(rest.trim().to_string());
    }
    SseLine::Other
}

pub fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete lines out of `buffer` after appending `chunk`. Handles
/// line breaks split across reads; tolerates both LF and CRLF.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> RelayResult<Vec<String>> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    if buffer.len() > MAX_SSE_FRAME {
        return Err(RelayError::Internal("SSE frame exceeds size cap".into()));
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_lines() {
        assert_eq!(
            parse_sse_line("data: hello"),
            SseLine::Data("hello".into())
        );
        assert_eq!(parse_sse_line("data:hello"), SseLine::Data("hello".into()));
        assert_eq!(
            parse_sse_line("event: message_start"),
            SseLine::Event("message_start".into())
        );
        assert_eq!(parse_sse_line(": comment"), SseLine::Other);
        assert_eq!(parse_sse_line(""), SseLine::Other);
    }

    #[test]
    fn done_marker() {
        assert!(is_done_marker("[DONE]"));
        assert!(is_done_marker("  [DONE]  "));
        assert!(!is_done_marker("{}"));
    }

    #[test]
    fn drain_handles_partial_lines() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":").unwrap();
        assert!(lines.is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\n").unwrap();
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_handles_crlf() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: ok\r\n\r\n").unwrap();
        assert_eq!(lines, vec!["data: ok", ""]);
    }

    #[test]
    fn drain_rejects_oversized_frames() {
        let mut buffer = Vec::new();
        let chunk = vec![b'a'; MAX_SSE_FRAME + 1];
        assert!(drain_sse_lines(&mut buffer, &chunk).is_err());
    }

    #[test]
    fn stream_flag_normalization() {
        let mut p = json!({"stream": "true"});
        assert!(normalize_stream_flag(&mut p));
        assert_eq!(p["stream"], json!(true));

        let mut p = json!({"stream": 0});
        assert!(!normalize_stream_flag(&mut p));
        assert_eq!(p["stream"], json!(false));

        let mut p = json!({});
        assert!(!normalize_stream_flag(&mut p));
        assert!(p.get("stream").is_none());
    }
}
