//! Claude Messages <-> Chat Completions conversion.
//!
//! Request conversion runs before the upstream call; response conversion
//! covers both JSON bodies and SSE streams. Tool-call ids and ordering are
//! preserved in both directions.

use serde_json::{json, Map, Value};

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{estimate_tokens, Usage};
use crate::relay::stream::{
    apply_chat_usage, claude_input_tokens, sse_frame, SseRewriter, StreamPhase,
    ToolCallAccumulator,
};

// ============================================================================
// Finish-reason mapping
// ============================================================================

pub fn finish_reason_to_claude(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        Some("content_filter") => "refusal",
        _ => "end_turn",
    }
}

pub fn claude_stop_to_finish_reason(stop: Option<&str>) -> &'static str {
    match stop {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

// ============================================================================
// Request conversion
// ============================================================================

fn chat_content_to_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<String> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

fn chat_parts_to_claude_blocks(content: &Value, blocks: &mut Vec<Value>) -> RelayResult<()> {
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
        }
        Value::Array(parts) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            blocks.push(json!({"type": "text", "text": text}));
                        }
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        // data: URLs re-wrap as base64 sources; plain URLs
                        // use the url source type.
                        if let Some(rest) = url.strip_prefix("data:") {
                            let (media_type, data) = rest
                                .split_once(";base64,")
                                .unwrap_or(("application/octet-stream", ""));
                            blocks.push(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": media_type,
                                    "data": data,
                                }
                            }));
                        } else {
                            blocks.push(json!({
                                "type": "image",
                                "source": {"type": "url", "url": url}
                            }));
                        }
                    }
                    Some("input_audio") => {
                        return Err(RelayError::UnsupportedContentBlock(
                            "input_audio has no Claude Messages equivalent".into(),
                        ))
                    }
                    Some(other) => {
                        return Err(RelayError::UnsupportedContentBlock(format!(
                            "content part type '{}'",
                            other
                        )))
                    }
                    None => {}
                }
            }
        }
        Value::Null => {}
        _ => {
            return Err(RelayError::UnsupportedContentBlock(
                "message content must be a string or an array of parts".into(),
            ))
        }
    }
    Ok(())
}

fn chat_tool_call_to_claude_block(tool_call: &Value) -> Option<Value> {
    let function = tool_call.get("function")?;
    let name = function.get("name")?.as_str()?;
    let id = tool_call
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("tool_call");
    let args_raw = function
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or("");
    let input =
        serde_json::from_str(args_raw).unwrap_or_else(|_| Value::String(args_raw.to_string()));
    Some(json!({
        "type": "tool_use",
        "id": id,
        "name": name,
        "input": input,
    }))
}

fn chat_tools_to_claude(tools: &Value) -> Option<Value> {
    let mut mapped = Vec::new();
    for tool in tools.as_array()? {
        if tool.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
        let Some(function) = tool.get("function") else {
            continue;
        };
        let Some(name) = function.get("name").and_then(Value::as_str) else {
            continue;
        };
        let mut entry = Map::new();
        entry.insert("name".into(), Value::String(name.to_string()));
        if let Some(desc) = function.get("description") {
            entry.insert("description".into(), desc.clone());
        }
        if let Some(params) = function.get("parameters") {
            entry.insert("input_schema".into(), params.clone());
        }
        mapped.push(Value::Object(entry));
    }
    (!mapped.is_empty()).then(|| Value::Array(mapped))
}

fn chat_tool_choice_to_claude(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(raw) => match raw.to_ascii_lowercase().as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "none" => Some(json!({"type": "none"})),
            "required" => Some(json!({"type": "any"})),
            _ => None,
        },
        Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)?;
            Some(json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}

/// Chat Completions request -> Claude Messages request.
pub fn chat_to_claude_request(payload: &Value, model: &str) -> RelayResult<Value> {
    let mut out = Map::new();
    out.insert("model".into(), Value::String(model.to_string()));

    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    // A top-level `system` field takes precedence; system-role messages are
    // only collected when it is absent (observed legacy behavior).
    let top_level_system = payload
        .get("system")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(input) = payload.get("messages").and_then(Value::as_array) {
        for msg in input {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");

            if role.eq_ignore_ascii_case("system") {
                if top_level_system.is_none() {
                    if let Some(text) = msg.get("content").and_then(chat_content_to_text) {
                        system_parts.push(text);
                    }
                }
                continue;
            }

            if role.eq_ignore_ascii_case("tool") {
                let tool_id = msg
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or("tool_call");
                let content = msg
                    .get("content")
                    .and_then(chat_content_to_text)
                    .unwrap_or_default();
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_id,
                        "content": content,
                    }]
                }));
                continue;
            }

            let mut blocks = Vec::new();
            if let Some(content) = msg.get("content") {
                chat_parts_to_claude_blocks(content, &mut blocks)?;
            }
            if let Some(tool_calls) = msg.get("tool_calls").and_then(Value::as_array) {
                blocks.extend(tool_calls.iter().filter_map(chat_tool_call_to_claude_block));
            }
            if blocks.is_empty() {
                blocks.push(json!({"type": "text", "text": ""}));
            }
            messages.push(json!({"role": role, "content": blocks}));
        }
    }

    out.insert("messages".into(), Value::Array(messages));

    if let Some(system) = top_level_system {
        out.insert("system".into(), Value::String(system));
    } else if !system_parts.is_empty() {
        out.insert("system".into(), Value::String(system_parts.join("\n\n")));
    }

    let max_tokens = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(4096);
    out.insert("max_tokens".into(), json!(max_tokens));

    for key in ["temperature", "top_p", "stream", "metadata"] {
        if let Some(v) = payload.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(stop) = payload.get("stop") {
        let mapped = match stop {
            Value::String(text) => Value::Array(vec![Value::String(text.clone())]),
            other => other.clone(),
        };
        out.insert("stop_sequences".into(), mapped);
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = chat_tools_to_claude(tools) {
            out.insert("tools".into(), mapped);
        }
    }
    if let Some(choice) = payload.get("tool_choice") {
        if let Some(mapped) = chat_tool_choice_to_claude(choice) {
            out.insert("tool_choice".into(), mapped);
        }
    }

    Ok(Value::Object(out))
}

fn claude_tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn claude_tools_to_chat(tools: &Value) -> Option<Value> {
    let mut mapped = Vec::new();
    for tool in tools.as_array()? {
        // Built-in server tools (versioned `type`) do not cross formats.
        let Some(name) = tool.get("name").and_then(Value::as_str) else {
            continue;
        };
        if tool.get("input_schema").is_none() {
            continue;
        }
        let mut function = Map::new();
        function.insert("name".into(), Value::String(name.to_string()));
        if let Some(desc) = tool.get("description") {
            function.insert("description".into(), desc.clone());
        }
        if let Some(schema) = tool.get("input_schema") {
            function.insert("parameters".into(), schema.clone());
        }
        mapped.push(json!({"type": "function", "function": function}));
    }
    (!mapped.is_empty()).then(|| Value::Array(mapped))
}

fn claude_tool_choice_to_chat(choice: &Value) -> Option<Value> {
    let obj = choice.as_object()?;
    match obj.get("type").and_then(Value::as_str)? {
        "auto" => Some(Value::String("auto".into())),
        "any" => Some(Value::String("required".into())),
        "none" => Some(Value::String("none".into())),
        "tool" => {
            let name = obj.get("name").and_then(Value::as_str)?;
            Some(json!({"type": "function", "function": {"name": name}}))
        }
        _ => None,
    }
}

fn claude_system_text(system: &Value) -> Option<String> {
    match system {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let texts: Vec<String> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n\n"))
        }
        _ => None,
    }
}

fn content_from_parts(parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        if let Some(text) = parts[0]
            .as_object()
            .filter(|o| o.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|o| o.get("text"))
            .and_then(Value::as_str)
        {
            return Value::String(text.to_string());
        }
    }
    Value::Array(parts)
}

/// Claude Messages request -> Chat Completions request.
pub fn claude_to_chat_request(payload: &Value, model: &str) -> RelayResult<Value> {
    let mut out = Map::new();
    out.insert("model".into(), Value::String(model.to_string()));

    let mut messages = Vec::new();
    if let Some(system) = payload.get("system").and_then(|s| claude_system_text(s)) {
        messages.push(json!({"role": "system", "content": system}));
    }

    if let Some(input) = payload.get("messages").and_then(Value::as_array) {
        for msg in input {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
            let mut content_parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_messages = Vec::new();

            match msg.get("content") {
                Some(Value::String(text)) => {
                    if !text.is_empty() {
                        content_parts.push(json!({"type": "text", "text": text}));
                    }
                }
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str).unwrap_or("") {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    content_parts.push(json!({"type": "text", "text": text}));
                                }
                            }
                            // Thinking blocks are internal to the Claude
                            // protocol; they never reach a Chat upstream.
                            "thinking" | "redacted_thinking" => {}
                            "image" => {
                                let source = block.get("source");
                                let source_type = source
                                    .and_then(|s| s.get("type"))
                                    .and_then(Value::as_str)
                                    .unwrap_or("");
                                let url = match source_type {
                                    "base64" => {
                                        let media = source
                                            .and_then(|s| s.get("media_type"))
                                            .and_then(Value::as_str)
                                            .unwrap_or("application/octet-stream");
                                        let data = source
                                            .and_then(|s| s.get("data"))
                                            .and_then(Value::as_str)
                                            .unwrap_or("");
                                        format!("data:{};base64,{}", media, data)
                                    }
                                    "url" => source
                                        .and_then(|s| s.get("url"))
                                        .and_then(Value::as_str)
                                        .unwrap_or("")
                                        .to_string(),
                                    other => {
                                        return Err(RelayError::UnsupportedContentBlock(
                                            format!("image source type '{}'", other),
                                        ))
                                    }
                                };
                                content_parts.push(json!({
                                    "type": "image_url",
                                    "image_url": {"url": url}
                                }));
                            }
                            "tool_use" => {
                                let name =
                                    block.get("name").and_then(Value::as_str).unwrap_or("tool");
                                let id = block
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .unwrap_or("tool_call");
                                let input = block.get("input").cloned().unwrap_or(Value::Null);
                                let args = serde_json::to_string(&input)
                                    .unwrap_or_else(|_| "{}".to_string());
                                tool_calls.push(json!({
                                    "id": id,
                                    "type": "function",
                                    "function": {"name": name, "arguments": args}
                                }));
                            }
                            "tool_result" => {
                                let tool_id = block
                                    .get("tool_use_id")
                                    .and_then(Value::as_str)
                                    .unwrap_or("tool_call");
                                tool_messages.push(json!({
                                    "role": "tool",
                                    "tool_call_id": tool_id,
                                    "content": claude_tool_result_text(block),
                                }));
                            }
                            other => {
                                return Err(RelayError::UnsupportedContentBlock(format!(
                                    "content block type '{}'",
                                    other
                                )))
                            }
                        }
                    }
                }
                _ => {}
            }

            if !content_parts.is_empty() || !tool_calls.is_empty() {
                let mut chat_msg = Map::new();
                chat_msg.insert("role".into(), Value::String(role.to_string()));
                chat_msg.insert(
                    "content".into(),
                    if content_parts.is_empty() {
                        Value::String(String::new())
                    } else {
                        content_from_parts(content_parts)
                    },
                );
                if !tool_calls.is_empty() {
                    chat_msg.insert("tool_calls".into(), Value::Array(tool_calls));
                }
                messages.push(Value::Object(chat_msg));
            }
            messages.extend(tool_messages);
        }
    }

    out.insert("messages".into(), Value::Array(messages));

    if let Some(max_tokens) = payload.get("max_tokens") {
        out.insert("max_tokens".into(), max_tokens.clone());
    }
    for key in ["temperature", "top_p", "stream"] {
        if let Some(v) = payload.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(stop) = payload.get("stop_sequences") {
        out.insert("stop".into(), stop.clone());
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = claude_tools_to_chat(tools) {
            out.insert("tools".into(), mapped);
        }
    }
    if let Some(choice) = payload.get("tool_choice") {
        if let Some(mapped) = claude_tool_choice_to_chat(choice) {
            out.insert("tool_choice".into(), mapped);
        }
    }

    Ok(Value::Object(out))
}

// ============================================================================
// Response conversion (JSON)
// ============================================================================

/// Chat Completions response -> Claude Messages response.
pub fn chat_response_to_claude(response: &Value, fallback_model: &str) -> Value {
    let mut message = Map::new();
    let id = response
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("msg_unknown");
    let id = if id.starts_with("msg_") {
        id.to_string()
    } else {
        format!("msg_{}", id)
    };
    message.insert("id".into(), Value::String(id));
    message.insert("type".into(), Value::String("message".into()));
    message.insert("role".into(), Value::String("assistant".into()));
    message.insert(
        "model".into(),
        response
            .get("model")
            .cloned()
            .unwrap_or_else(|| Value::String(fallback_model.to_string())),
    );

    let mut blocks = Vec::new();
    let mut finish_reason = None;
    if let Some(choice) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        finish_reason = choice.get("finish_reason").and_then(Value::as_str);
        if let Some(chat_msg) = choice.get("message") {
            if let Some(text) = chat_msg.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
            }
            if let Some(tool_calls) = chat_msg.get("tool_calls").and_then(Value::as_array) {
                blocks.extend(tool_calls.iter().filter_map(chat_tool_call_to_claude_block));
            }
        }
    }
    if blocks.is_empty() {
        blocks.push(json!({"type": "text", "text": ""}));
    }

    message.insert("content".into(), Value::Array(blocks));
    message.insert(
        "stop_reason".into(),
        Value::String(finish_reason_to_claude(finish_reason).to_string()),
    );
    message.insert("stop_sequence".into(), Value::Null);

    if let Some(usage) = response.get("usage") {
        message.insert(
            "usage".into(),
            json!({
                "input_tokens": usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
                "output_tokens": usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0),
            }),
        );
    }

    Value::Object(message)
}

/// Claude Messages response -> Chat Completions response.
pub fn claude_response_to_chat(response: &Value, fallback_model: &str) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = response.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                "text" => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                "tool_use" => {
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    tool_calls.push(json!({
                        "id": block.get("id").and_then(Value::as_str).unwrap_or("tool_call"),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(Value::as_str).unwrap_or("tool"),
                            "arguments": serde_json::to_string(&input)
                                .unwrap_or_else(|_| "{}".into()),
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    let mut chat_message = Map::new();
    chat_message.insert("role".into(), Value::String("assistant".into()));
    chat_message.insert("content".into(), Value::String(text));
    if !tool_calls.is_empty() {
        chat_message.insert("tool_calls".into(), Value::Array(tool_calls));
    }

    let stop_reason = response.get("stop_reason").and_then(Value::as_str);
    let usage = response.get("usage");
    let prompt_tokens = usage.map(claude_input_tokens).unwrap_or(0);
    let completion_tokens = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    json!({
        "id": response.get("id").and_then(Value::as_str)
            .map(|id| format!("chatcmpl-{}", id.trim_start_matches("msg_")))
            .unwrap_or_else(|| "chatcmpl-unknown".into()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": response.get("model").cloned()
            .unwrap_or_else(|| Value::String(fallback_model.to_string())),
        "choices": [{
            "index": 0,
            "message": chat_message,
            "finish_reason": claude_stop_to_finish_reason(stop_reason),
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        }
    })
}

/// Usage extraction from a Claude JSON body.
pub fn claude_usage(response: &Value) -> Usage {
    let Some(u) = response.get("usage") else {
        return Usage::default();
    };
    let mut usage = Usage::new(
        claude_input_tokens(u),
        u.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
    );
    usage.prompt_tokens_details.cached_tokens = u
        .get("cache_read_input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    usage
}

// ============================================================================
// Stream rewriters
// ============================================================================

/// Chat SSE chunks -> Claude events, for Claude clients served by a
/// Chat-speaking upstream.
pub struct ChatToClaudeStream {
    phase: StreamPhase,
    usage: Usage,
    saw_usage_chunk: bool,
    estimated_completion: i64,
    model: String,
    text_index: Option<usize>,
    next_index: usize,
    tool_indices: std::collections::HashMap<usize, usize>,
    tools: ToolCallAccumulator,
    finish_reason: Option<String>,
    message_id: Option<String>,
}

impl ChatToClaudeStream {
    pub fn new(model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            phase: StreamPhase::Idle,
            usage: Usage::new(estimated_prompt_tokens, 0),
            saw_usage_chunk: false,
            estimated_completion: 0,
            model: model.to_string(),
            text_index: None,
            next_index: 0,
            tool_indices: std::collections::HashMap::new(),
            tools: ToolCallAccumulator::default(),
            finish_reason: None,
            message_id: None,
        }
    }

    fn start_frames(&mut self, chunk: &Value) -> Vec<String> {
        let raw_id = chunk
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("msg_unknown");
        let id = if raw_id.starts_with("msg_") {
            raw_id.to_string()
        } else {
            format!("msg_{}", raw_id)
        };
        self.message_id = Some(id.clone());
        self.phase = StreamPhase::Started;
        vec![sse_frame(
            Some("message_start"),
            &json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": chunk.get("model").cloned()
                        .unwrap_or_else(|| Value::String(self.model.clone())),
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": {"input_tokens": self.usage.prompt_tokens, "output_tokens": 0},
                }
            }),
        )]
    }

    fn ensure_text_block(&mut self, out: &mut Vec<String>) -> usize {
        if let Some(index) = self.text_index {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.text_index = Some(index);
        self.phase = StreamPhase::InContentBlock;
        out.push(sse_frame(
            Some("content_block_start"),
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""},
            }),
        ));
        index
    }

    fn close_open_blocks(&mut self, out: &mut Vec<String>) {
        let mut indices: Vec<usize> = self.text_index.take().into_iter().collect();
        indices.extend(self.tool_indices.values().copied());
        self.tool_indices.clear();
        indices.sort_unstable();
        for index in indices {
            out.push(sse_frame(
                Some("content_block_stop"),
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    fn handle_tool_delta(&mut self, call: &Value, out: &mut Vec<String>) {
        let Some(chunk_index) = call.get("index").and_then(Value::as_u64).map(|i| i as usize)
        else {
            return;
        };
        let id = call.get("id").and_then(Value::as_str);
        let name = call
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str);
        let args = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str);
        self.tools.push(chunk_index, id, name, args);

        if !self.tool_indices.contains_key(&chunk_index) {
            // A tool block interrupts any open text block.
            if let Some(text_index) = self.text_index.take() {
                out.push(sse_frame(
                    Some("content_block_stop"),
                    &json!({"type": "content_block_stop", "index": text_index}),
                ));
            }
            let block_index = self.next_index;
            self.next_index += 1;
            self.tool_indices.insert(chunk_index, block_index);
            self.phase = StreamPhase::ToolCallAccumulating;
            let pending = self.tools.get(chunk_index);
            out.push(sse_frame(
                Some("content_block_start"),
                &json!({
                    "type": "content_block_start",
                    "index": block_index,
                    "content_block": {
                        "type": "tool_use",
                        "id": pending.map(|p| p.id.clone()).unwrap_or_default(),
                        "name": pending.map(|p| p.name.clone()).unwrap_or_default(),
                        "input": {},
                    }
                }),
            ));
        }

        if let Some(fragment) = args.filter(|a| !a.is_empty()) {
            let block_index = self.tool_indices[&chunk_index];
            out.push(sse_frame(
                Some("content_block_delta"),
                &json!({
                    "type": "content_block_delta",
                    "index": block_index,
                    "delta": {"type": "input_json_delta", "partial_json": fragment},
                }),
            ));
        }
    }

    fn output_tokens(&self) -> i64 {
        if self.saw_usage_chunk {
            self.usage.completion_tokens
        } else {
            self.estimated_completion + (self.tools.argument_chars() as f64 / 3.5).round() as i64
        }
    }
}

impl SseRewriter for ChatToClaudeStream {
    fn on_frame(&mut self, _event: Option<&str>, data: &Value) -> Vec<String> {
        let mut out = Vec::new();

        if self.phase == StreamPhase::Idle {
            out.extend(self.start_frames(data));
        }

        if apply_chat_usage(&mut self.usage, data) {
            self.saw_usage_chunk = true;
        }

        if let Some(choice) = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            if let Some(delta) = choice.get("delta") {
                if let Some(content) = delta.get("content").and_then(Value::as_str) {
                    if !content.is_empty() {
                        let index = self.ensure_text_block(&mut out);
                        out.push(sse_frame(
                            Some("content_block_delta"),
                            &json!({
                                "type": "content_block_delta",
                                "index": index,
                                "delta": {"type": "text_delta", "text": content},
                            }),
                        ));
                        self.estimated_completion += estimate_tokens(content);
                    }
                }
                if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for call in calls {
                        self.handle_tool_delta(call, &mut out);
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        out
    }

    fn finish(&mut self) -> Vec<String> {
        if self.phase == StreamPhase::Finishing {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.phase == StreamPhase::Idle {
            out.extend(self.start_frames(&Value::Null));
        }
        self.close_open_blocks(&mut out);
        let stop_reason = finish_reason_to_claude(self.finish_reason.as_deref());
        out.push(sse_frame(
            Some("message_delta"),
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {"output_tokens": self.output_tokens()},
            }),
        ));
        out.push(sse_frame(
            Some("message_stop"),
            &json!({"type": "message_stop"}),
        ));
        self.phase = StreamPhase::Finishing;
        out
    }

    fn emits_done(&self) -> bool {
        false
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if !self.saw_usage_chunk {
            usage.completion_tokens = self.output_tokens();
        }
        usage.recompute_total();
        usage
    }
}

/// Claude SSE events -> Chat chunks, for Chat clients served by a native
/// Anthropic upstream.
pub struct ClaudeToChatStream {
    phase: StreamPhase,
    usage: Usage,
    model: String,
    chunk_id: String,
    created: i64,
    finish_reason: Option<&'static str>,
    /// Claude block index -> chat tool-call index for open tool_use blocks.
    open_tools: std::collections::HashMap<usize, usize>,
    tools: ToolCallAccumulator,
    emitted_finish: bool,
    emitted_usage: bool,
}

impl ClaudeToChatStream {
    pub fn new(model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            phase: StreamPhase::Idle,
            usage: Usage::new(estimated_prompt_tokens, 0),
            model: model.to_string(),
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            finish_reason: None,
            open_tools: std::collections::HashMap::new(),
            tools: ToolCallAccumulator::default(),
            emitted_finish: false,
            emitted_usage: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}

impl SseRewriter for ClaudeToChatStream {
    fn on_frame(&mut self, _event: Option<&str>, data: &Value) -> Vec<String> {
        let mut out = Vec::new();
        match data.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.phase = StreamPhase::Started;
                if let Some(u) = data.get("message").and_then(|m| m.get("usage")) {
                    self.usage.prompt_tokens = claude_input_tokens(u);
                    self.usage.recompute_total();
                }
                out.push(sse_frame(
                    None,
                    &self.chunk(json!({"role": "assistant", "content": ""}), None),
                ));
            }
            Some("content_block_start") => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(block) = data.get("content_block") {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        self.phase = StreamPhase::ToolCallAccumulating;
                        let tool_index = self.open_tools.len();
                        self.open_tools.insert(index, tool_index);
                        self.tools.push(
                            tool_index,
                            block.get("id").and_then(Value::as_str),
                            block.get("name").and_then(Value::as_str),
                            None,
                        );
                        let pending = self.tools.get(tool_index);
                        out.push(sse_frame(
                            None,
                            &self.chunk(
                                json!({"tool_calls": [{
                                    "index": tool_index,
                                    "id": pending.map(|p| p.id.clone()).unwrap_or_default(),
                                    "type": "function",
                                    "function": {
                                        "name": pending.map(|p| p.name.clone()).unwrap_or_default(),
                                        "arguments": "",
                                    },
                                }]}),
                                None,
                            ),
                        ));
                    } else {
                        self.phase = StreamPhase::InContentBlock;
                    }
                }
            }
            Some("content_block_delta") => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                match data
                    .get("delta")
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                {
                    Some("text_delta") => {
                        if let Some(text) = data
                            .get("delta")
                            .and_then(|d| d.get("text"))
                            .and_then(Value::as_str)
                        {
                            self.usage.completion_tokens += estimate_tokens(text);
                            out.push(
                                sse_frame(None, &self.chunk(json!({"content": text}), None)),
                            );
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) = data
                            .get("delta")
                            .and_then(|d| d.get("partial_json"))
                            .and_then(Value::as_str)
                        {
                            if let Some(&tool_index) = self.open_tools.get(&index) {
                                self.tools.push(tool_index, None, None, Some(fragment));
                                out.push(sse_frame(
                                    None,
                                    &self.chunk(
                                        json!({"tool_calls": [{
                                            "index": tool_index,
                                            "function": {"arguments": fragment},
                                        }]}),
                                        None,
                                    ),
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(v) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.usage.completion_tokens = v;
                    self.usage.recompute_total();
                }
                if let Some(stop) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.finish_reason = Some(claude_stop_to_finish_reason(Some(stop)));
                }
            }
            Some("message_stop") => {
                out.extend(self.finish());
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.emitted_finish {
            self.emitted_finish = true;
            self.phase = StreamPhase::Finishing;
            let reason = self.finish_reason.unwrap_or("stop");
            out.push(sse_frame(None, &self.chunk(json!({}), Some(reason))));
        }
        if !self.emitted_usage {
            self.emitted_usage = true;
            let usage = self.usage();
            out.push(sse_frame(
                None,
                &json!({
                    "id": self.chunk_id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [],
                    "usage": {
                        "prompt_tokens": usage.prompt_tokens,
                        "completion_tokens": usage.completion_tokens,
                        "total_tokens": usage.total_tokens,
                    },
                }),
            ));
        }
        out
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        usage.recompute_total();
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_round_trips_core_fields() {
        let chat = json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
            ],
            "max_tokens": 32,
            "stop": "END",
        });
        let claude = chat_to_claude_request(&chat, "claude-3-5-sonnet").unwrap();
        assert_eq!(claude["system"], "be brief");
        assert_eq!(claude["max_tokens"], 32);
        assert_eq!(claude["stop_sequences"], json!(["END"]));
        let messages = claude["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn top_level_system_wins_over_system_messages() {
        let chat = json!({
            "model": "m",
            "system": "from field",
            "messages": [
                {"role": "system", "content": "from message"},
                {"role": "user", "content": "hi"},
            ],
        });
        let claude = chat_to_claude_request(&chat, "m").unwrap();
        assert_eq!(claude["system"], "from field");
    }

    #[test]
    fn tool_ids_survive_both_directions() {
        let claude = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 16,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_abc", "name": "get_weather",
                     "input": {"city": "SF"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_abc", "content": "sunny"},
                ]},
            ],
        });
        let chat = claude_to_chat_request(&claude, "gpt-4o").unwrap();
        let messages = chat["messages"].as_array().unwrap();
        assert_eq!(messages[0]["tool_calls"][0]["id"], "toolu_abc");
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "toolu_abc");

        let back = chat_to_claude_request(&chat, "claude-3-5-sonnet").unwrap();
        let blocks = back["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["id"], "toolu_abc");
        assert_eq!(blocks[0]["input"]["city"], "SF");
    }

    #[test]
    fn unknown_block_type_is_rejected() {
        let claude = json!({
            "model": "m",
            "max_tokens": 4,
            "messages": [{"role": "user", "content": [{"type": "hologram", "data": "?"}]}],
        });
        assert!(matches!(
            claude_to_chat_request(&claude, "m"),
            Err(RelayError::UnsupportedContentBlock(_))
        ));
    }

    #[test]
    fn image_blocks_pass_through_rewrapped() {
        let claude = json!({
            "model": "m",
            "max_tokens": 4,
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {
                    "type": "base64", "media_type": "image/png", "data": "AAAA"}},
            ]}],
        });
        let chat = claude_to_chat_request(&claude, "m").unwrap();
        let part = &chat["messages"][0]["content"][0];
        assert_eq!(part["type"], "image_url");
        assert_eq!(part["image_url"]["url"], "data:image/png;base64,AAAA");

        let back = chat_to_claude_request(&chat, "m").unwrap();
        let block = &back["messages"][0]["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["source"]["data"], "AAAA");
    }

    #[test]
    fn chat_response_converts_to_claude_message() {
        let chat = json!({
            "id": "abc123",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello",
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "f", "arguments": "{\"a\":1}"}}]},
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4},
        });
        let claude = chat_response_to_claude(&chat, "gpt-4o");
        assert_eq!(claude["type"], "message");
        assert_eq!(claude["stop_reason"], "tool_use");
        assert_eq!(claude["content"][0]["text"], "hello");
        assert_eq!(claude["content"][1]["type"], "tool_use");
        assert_eq!(claude["content"][1]["input"]["a"], 1);
        assert_eq!(claude["usage"]["input_tokens"], 9);
        assert!(claude["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn claude_response_converts_to_chat() {
        let claude = json!({
            "id": "msg_xyz",
            "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "hi there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 3,
                      "cache_read_input_tokens": 2},
        });
        let chat = claude_response_to_chat(&claude, "claude-3-5-sonnet");
        assert_eq!(chat["choices"][0]["message"]["content"], "hi there");
        assert_eq!(chat["choices"][0]["finish_reason"], "stop");
        // Cache reads count into the prompt side.
        assert_eq!(chat["usage"]["prompt_tokens"], 7);
        assert_eq!(chat["usage"]["total_tokens"], 10);
    }

    #[test]
    fn chat_to_claude_stream_emits_ordered_events() {
        let mut rw = ChatToClaudeStream::new("gpt-4o", 4);
        let first = rw.on_frame(
            None,
            &json!({"id": "x", "choices": [{"delta": {"role": "assistant", "content": "he"}}]}),
        );
        assert!(first[0].starts_with("event: message_start"));
        assert!(first[1].starts_with("event: content_block_start"));
        assert!(first[2].starts_with("event: content_block_delta"));

        rw.on_frame(
            None,
            &json!({"choices": [{"delta": {"content": "llo"}, "finish_reason": "stop"}]}),
        );
        let closing = rw.finish();
        let text = closing.join("");
        assert!(text.contains("content_block_stop"));
        assert!(text.contains("\"stop_reason\":\"end_turn\""));
        assert!(text.contains("message_stop"));
        assert!(!rw.emits_done());
        // finish() is idempotent.
        assert!(rw.finish().is_empty());
    }

    #[test]
    fn chat_to_claude_stream_accumulates_tool_args() {
        let mut rw = ChatToClaudeStream::new("gpt-4o", 1);
        rw.on_frame(
            None,
            &json!({"id": "x", "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_9", "type": "function",
                 "function": {"name": "f", "arguments": "{\"a\""}}]}}]}),
        );
        let frames = rw.on_frame(
            None,
            &json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":1}"}}]}}]}),
        );
        let text = frames.join("");
        assert!(text.contains("input_json_delta"));
        assert!(text.contains(":1}"));
    }

    #[test]
    fn claude_to_chat_stream_single_finish_and_usage() {
        let mut rw = ClaudeToChatStream::new("claude-3-5-sonnet", 2);
        rw.on_frame(
            Some("message_start"),
            &json!({"type": "message_start",
                    "message": {"usage": {"input_tokens": 6}}}),
        );
        rw.on_frame(
            Some("content_block_delta"),
            &json!({"type": "content_block_delta", "index": 0,
                    "delta": {"type": "text_delta", "text": "hey"}}),
        );
        rw.on_frame(
            Some("message_delta"),
            &json!({"type": "message_delta",
                    "delta": {"stop_reason": "end_turn"},
                    "usage": {"output_tokens": 5}}),
        );
        let frames = rw.on_frame(
            Some("message_stop"),
            &json!({"type": "message_stop"}),
        );
        let text = frames.join("");
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.contains("\"completion_tokens\":5"));
        // Engine-level finish after message_stop adds nothing more.
        assert!(rw.finish().is_empty());
        assert_eq!(rw.usage().prompt_tokens, 6);
        assert!(rw.emits_done());
    }
}
