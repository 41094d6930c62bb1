//! Request payload format detection.
//!
//! Classifies a raw JSON body as Chat, Responses or Claude using only
//! features exclusive to one format. Anything a Chat body and a Claude body
//! could both legally contain yields `Unknown`, so backward-compatible
//! traffic is never misrouted.

use serde_json::Value;

use super::error::{RelayError, RelayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Chat,
    Responses,
    Claude,
    Unknown,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Chat => "chat",
            PayloadFormat::Responses => "responses",
            PayloadFormat::Claude => "claude",
            PayloadFormat::Unknown => "unknown",
        }
    }
}

/// Detect the wire format of `body`. Fails only on empty or invalid JSON.
pub fn detect(body: &[u8]) -> RelayResult<PayloadFormat> {
    if body.is_empty() {
        return Err(RelayError::MalformedRequest("empty request body".into()));
    }
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::MalformedRequest(format!("invalid JSON: {}", e)))?;
    Ok(detect_value(&payload))
}

/// Format detection on an already-parsed payload.
pub fn detect_value(payload: &Value) -> PayloadFormat {
    let has_messages = payload.get("messages").is_some();

    // Responses-exclusive top-level fields, only meaningful without messages.
    if !has_messages {
        if payload.get("input").is_some()
            || payload.get("max_output_tokens").is_some()
            || payload.get("instructions").is_some()
        {
            return PayloadFormat::Responses;
        }
    }

    if has_messages && messages_have_claude_blocks(payload) {
        return PayloadFormat::Claude;
    }

    if tools_are_claude_shaped(payload) {
        return PayloadFormat::Claude;
    }

    PayloadFormat::Unknown
}

/// `tool_use`, `tool_result` and `thinking` content blocks exist only in the
/// Claude Messages schema.
fn messages_have_claude_blocks(payload: &Value) -> bool {
    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return false;
    };
    for message in messages {
        let Some(parts) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            if matches!(
                part.get("type").and_then(Value::as_str),
                Some("tool_use") | Some("tool_result") | Some("thinking")
            ) {
                return true;
            }
        }
    }
    false
}

/// Claude tool definitions carry `{name, input_schema}`; OpenAI tools nest a
/// `function` object with `parameters`. A `function.input_schema` hybrid is
/// still treated as Claude.
fn tools_are_claude_shaped(payload: &Value) -> bool {
    let Some(tools) = payload.get("tools").and_then(Value::as_array) else {
        return false;
    };
    for tool in tools {
        if tool.get("name").is_some() && tool.get("input_schema").is_some() {
            return true;
        }
        if tool
            .get("function")
            .map(|f| f.get("input_schema").is_some())
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detect_json(v: Value) -> PayloadFormat {
        detect(v.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn responses_exclusive_fields() {
        assert_eq!(
            detect_json(json!({"model": "gpt-4o", "input": "hi"})),
            PayloadFormat::Responses
        );
        assert_eq!(
            detect_json(json!({"model": "gpt-4o", "max_output_tokens": 16})),
            PayloadFormat::Responses
        );
        assert_eq!(
            detect_json(json!({"model": "gpt-4o", "instructions": "be brief"})),
            PayloadFormat::Responses
        );
    }

    #[test]
    fn responses_fields_do_not_override_messages() {
        // `instructions` next to `messages` is not a Responses request.
        assert_eq!(
            detect_json(json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "instructions": "x"
            })),
            PayloadFormat::Unknown
        );
    }

    #[test]
    fn claude_blocks_are_exclusive() {
        assert_eq!(
            detect_json(json!({
                "model": "claude-3-5-sonnet",
                "messages": [{
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]
                }]
            })),
            PayloadFormat::Claude
        );
        assert_eq!(
            detect_json(json!({
                "model": "claude-3-5-sonnet",
                "messages": [{
                    "role": "assistant",
                    "content": [{"type": "thinking", "thinking": "hmm"}]
                }]
            })),
            PayloadFormat::Claude
        );
    }

    #[test]
    fn claude_tool_schema() {
        assert_eq!(
            detect_json(json!({
                "model": "claude-3-5-sonnet",
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
            })),
            PayloadFormat::Claude
        );
        assert_eq!(
            detect_json(json!({
                "tools": [{"type": "function",
                           "function": {"name": "f", "input_schema": {"type": "object"}}}]
            })),
            PayloadFormat::Claude
        );
    }

    #[test]
    fn shared_shape_is_never_guessed() {
        // Valid as both Chat and Claude: plain role/content messages.
        assert_eq!(
            detect_json(json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}]
            })),
            PayloadFormat::Unknown
        );
        // OpenAI-shaped tools stay Unknown too.
        assert_eq!(
            detect_json(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [{"type": "function",
                           "function": {"name": "f", "parameters": {"type": "object"}}}]
            })),
            PayloadFormat::Unknown
        );
    }

    #[test]
    fn system_field_plus_system_message_stays_unknown() {
        assert_eq!(
            detect_json(json!({
                "model": "m",
                "system": "You are helpful.",
                "messages": [
                    {"role": "system", "content": "You are helpful."},
                    {"role": "user", "content": "hi"}
                ]
            })),
            PayloadFormat::Unknown
        );
    }

    #[test]
    fn malformed_bodies_fail() {
        assert!(detect(b"").is_err());
        assert!(detect(b"not json").is_err());
        assert!(detect(b"{\"truncated\":").is_err());
    }
}
