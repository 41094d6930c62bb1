//! Responses API <-> Chat Completions conversion.
//!
//! Fallback direction (Responses client, Chat-only upstream): sanitize the
//! Responses request, convert it to Chat, and rewrite the upstream answer
//! back into Responses shape, including the `response.*` SSE events.
//! Upgrade direction (Chat client, first-party OpenAI upstream routed via
//! `/v1/responses`): the mirror image.

use serde_json::{json, Map, Value};

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{estimate_tokens, Usage};
use crate::relay::stream::{sse_frame, SseRewriter, StreamPhase, ToolCallAccumulator};

/// Models that reject sampling parameters on the Chat surface.
pub fn is_reasoning_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") || m.starts_with("gpt-5")
}

/// Models that must stay on `/v1/chat/completions` even on first-party
/// OpenAI channels.
pub fn chat_only_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.contains("instruct") || m.starts_with("gpt-3.5") || m.starts_with("chatgpt-4o")
}

/// Keys a Chat upstream rejects outright; stripped during fallback so the
/// outbound bytes never contain them.
const RESPONSES_ONLY_KEYS: &[&str] = &[
    "input",
    "instructions",
    "max_output_tokens",
    "previous_response_id",
    "reasoning",
    "store",
    "truncation",
    "include",
    "text",
];

// ============================================================================
// Fallback: Responses request -> Chat request
// ============================================================================

fn responses_content_to_chat(content: &Value) -> RelayResult<Value> {
    match content {
        Value::String(text) => Ok(Value::String(text.clone())),
        Value::Array(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("input_text") | Some("output_text") | Some("text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            out.push(json!({"type": "text", "text": text}));
                        }
                    }
                    Some("input_image") => {
                        let url = part
                            .get("image_url")
                            .and_then(Value::as_str)
                            .or_else(|| {
                                part.get("image_url")
                                    .and_then(|v| v.get("url"))
                                    .and_then(Value::as_str)
                            })
                            .unwrap_or("");
                        out.push(json!({"type": "image_url", "image_url": {"url": url}}));
                    }
                    Some("input_audio") => {
                        if let Some(audio) = part.get("input_audio") {
                            out.push(json!({"type": "input_audio", "input_audio": audio}));
                        }
                    }
                    Some("refusal") => {}
                    Some(other) => {
                        return Err(RelayError::UnsupportedContentBlock(format!(
                            "input content type '{}'",
                            other
                        )))
                    }
                    None => {}
                }
            }
            Ok(Value::Array(out))
        }
        _ => Ok(Value::String(String::new())),
    }
}

fn responses_tools_to_chat(tools: &Value) -> Option<Value> {
    let mut mapped = Vec::new();
    for tool in tools.as_array()? {
        // Responses function tools are flat; built-in tools are validated
        // and billed separately and cannot cross to a Chat upstream.
        if tool.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
        let Some(name) = tool.get("name").and_then(Value::as_str) else {
            continue;
        };
        let mut function = Map::new();
        function.insert("name".into(), Value::String(name.to_string()));
        if let Some(desc) = tool.get("description") {
            function.insert("description".into(), desc.clone());
        }
        if let Some(params) = tool.get("parameters") {
            function.insert("parameters".into(), params.clone());
        }
        mapped.push(json!({"type": "function", "function": function}));
    }
    (!mapped.is_empty()).then(|| Value::Array(mapped))
}

/// Responses request -> Chat request (fallback path). Reasoning models drop
/// `temperature`/`top_p` since their Chat surface rejects sampling knobs.
pub fn responses_to_chat_request(payload: &Value, model: &str) -> RelayResult<Value> {
    let mut out = Map::new();
    out.insert("model".into(), Value::String(model.to_string()));

    let mut messages = Vec::new();
    if let Some(instructions) = payload.get("instructions").and_then(Value::as_str) {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    match payload.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "user", "content": text}));
        }
        Some(Value::Array(items)) => {
            for item in items {
                let item_type = item
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("message");
                match item_type {
                    "message" => {
                        let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                        let content = item.get("content").unwrap_or(&Value::Null);
                        messages.push(json!({
                            "role": role,
                            "content": responses_content_to_chat(content)?,
                        }));
                    }
                    "function_call" => {
                        let call_id = item
                            .get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or("call_0");
                        messages.push(json!({
                            "role": "assistant",
                            "content": Value::Null,
                            "tool_calls": [{
                                "id": call_id,
                                "type": "function",
                                "function": {
                                    "name": item.get("name").and_then(Value::as_str).unwrap_or(""),
                                    "arguments": item.get("arguments").and_then(Value::as_str)
                                        .unwrap_or("{}"),
                                },
                            }],
                        }));
                    }
                    "function_call_output" => {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": item.get("call_id").and_then(Value::as_str)
                                .unwrap_or("call_0"),
                            "content": item.get("output").and_then(Value::as_str).unwrap_or(""),
                        }));
                    }
                    other => {
                        return Err(RelayError::UnsupportedContentBlock(format!(
                            "input item type '{}'",
                            other
                        )))
                    }
                }
            }
        }
        _ => {
            return Err(RelayError::MalformedRequest(
                "Responses request carries no input".into(),
            ))
        }
    }

    out.insert("messages".into(), Value::Array(messages));

    if let Some(max) = payload.get("max_output_tokens") {
        out.insert("max_tokens".into(), max.clone());
    }
    if !is_reasoning_model(model) {
        for key in ["temperature", "top_p"] {
            if let Some(v) = payload.get(key) {
                out.insert(key.into(), v.clone());
            }
        }
    }
    if let Some(stream) = payload.get("stream") {
        out.insert("stream".into(), stream.clone());
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = responses_tools_to_chat(tools) {
            out.insert("tools".into(), mapped);
        }
    }
    if let Some(choice) = payload.get("tool_choice") {
        let mapped = match choice {
            Value::String(_) => Some(choice.clone()),
            Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("function") => {
                obj.get("name").and_then(Value::as_str).map(|name| {
                    json!({"type": "function", "function": {"name": name}})
                })
            }
            _ => None,
        };
        if let Some(mapped) = mapped {
            out.insert("tool_choice".into(), mapped);
        }
    }

    Ok(Value::Object(out))
}

/// Normalize the raw Responses JSON in place before conversion so the
/// outbound bytes never carry Responses-only keys.
pub fn strip_responses_only_keys(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        for key in RESPONSES_ONLY_KEYS {
            obj.remove(*key);
        }
    }
}

// ============================================================================
// Upgrade: Chat request -> Responses request
// ============================================================================

fn chat_message_to_input_item(msg: &Value) -> RelayResult<Vec<Value>> {
    let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
    let mut items = Vec::new();

    if role.eq_ignore_ascii_case("tool") {
        items.push(json!({
            "type": "function_call_output",
            "call_id": msg.get("tool_call_id").and_then(Value::as_str).unwrap_or("call_0"),
            "output": msg.get("content").and_then(Value::as_str).unwrap_or(""),
        }));
        return Ok(items);
    }

    let content = match msg.get("content") {
        Some(Value::String(text)) => {
            let part_type = if role.eq_ignore_ascii_case("assistant") {
                "output_text"
            } else {
                "input_text"
            };
            json!([{"type": part_type, "text": text}])
        }
        Some(Value::Array(parts)) => {
            let mut converted = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => converted.push(json!({
                        "type": "input_text",
                        "text": part.get("text").and_then(Value::as_str).unwrap_or(""),
                    })),
                    Some("image_url") => converted.push(json!({
                        "type": "input_image",
                        "image_url": part.get("image_url").and_then(|v| v.get("url"))
                            .and_then(Value::as_str).unwrap_or(""),
                    })),
                    Some("input_audio") => converted.push(part.clone()),
                    Some(other) => {
                        return Err(RelayError::UnsupportedContentBlock(format!(
                            "content part type '{}'",
                            other
                        )))
                    }
                    None => {}
                }
            }
            Value::Array(converted)
        }
        _ => json!([]),
    };

    if content.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
        items.push(json!({"type": "message", "role": role, "content": content}));
    }

    if let Some(tool_calls) = msg.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let function = call.get("function").cloned().unwrap_or_default();
            items.push(json!({
                "type": "function_call",
                "call_id": call.get("id").and_then(Value::as_str).unwrap_or("call_0"),
                "name": function.get("name").and_then(Value::as_str).unwrap_or(""),
                "arguments": function.get("arguments").and_then(Value::as_str).unwrap_or("{}"),
            }));
        }
    }

    Ok(items)
}

/// Chat request -> Responses request (upgrade path).
pub fn chat_to_responses_request(payload: &Value, model: &str) -> RelayResult<Value> {
    let mut out = Map::new();
    out.insert("model".into(), Value::String(model.to_string()));

    let mut instructions = Vec::new();
    let mut input_items = Vec::new();
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for msg in messages {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
            if role.eq_ignore_ascii_case("system") || role.eq_ignore_ascii_case("developer") {
                if let Some(text) = msg.get("content").and_then(Value::as_str) {
                    instructions.push(text.to_string());
                }
                continue;
            }
            input_items.extend(chat_message_to_input_item(msg)?);
        }
    }

    out.insert("input".into(), Value::Array(input_items));
    if !instructions.is_empty() {
        out.insert(
            "instructions".into(),
            Value::String(instructions.join("\n\n")),
        );
    }
    if let Some(max) = payload
        .get("max_completion_tokens")
        .or_else(|| payload.get("max_tokens"))
    {
        out.insert("max_output_tokens".into(), max.clone());
    }
    for key in ["temperature", "top_p", "stream", "metadata"] {
        if let Some(v) = payload.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(tools) = payload.get("tools").and_then(Value::as_array) {
        let mut mapped = Vec::new();
        for tool in tools {
            if tool.get("type").and_then(Value::as_str) != Some("function") {
                mapped.push(tool.clone());
                continue;
            }
            let Some(function) = tool.get("function") else {
                continue;
            };
            let mut flat = Map::new();
            flat.insert("type".into(), Value::String("function".into()));
            for key in ["name", "description", "parameters"] {
                if let Some(v) = function.get(key) {
                    flat.insert(key.into(), v.clone());
                }
            }
            mapped.push(Value::Object(flat));
        }
        if !mapped.is_empty() {
            out.insert("tools".into(), Value::Array(mapped));
        }
    }

    Ok(Value::Object(out))
}

// ============================================================================
// Response conversion (JSON)
// ============================================================================

fn responses_usage_value(usage: &Value) -> Usage {
    let prompt = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let mut out = Usage::new(prompt, completion);
    out.prompt_tokens_details.cached_tokens = usage
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    out
}

/// Usage from a Responses body or a `response.completed` event.
pub fn responses_usage(body: &Value) -> Usage {
    if let Some(u) = body.get("usage").filter(|u| !u.is_null()) {
        return responses_usage_value(u);
    }
    if let Some(u) = body.get("response").and_then(|r| r.get("usage")) {
        return responses_usage_value(u);
    }
    Usage::default()
}

/// Responses body -> Chat body (upgrade path, non-streaming).
pub fn responses_response_to_chat(response: &Value, fallback_model: &str) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(output) = response.get("output").and_then(Value::as_array) {
        for item in output {
            match item.get("type").and_then(Value::as_str).unwrap_or("") {
                "message" => {
                    if let Some(parts) = item.get("content").and_then(Value::as_array) {
                        for part in parts {
                            if part.get("type").and_then(Value::as_str) == Some("output_text") {
                                if let Some(t) = part.get("text").and_then(Value::as_str) {
                                    text.push_str(t);
                                }
                            }
                        }
                    }
                }
                "function_call" => {
                    tool_calls.push(json!({
                        "id": item.get("call_id").and_then(Value::as_str).unwrap_or("call_0"),
                        "type": "function",
                        "function": {
                            "name": item.get("name").and_then(Value::as_str).unwrap_or(""),
                            "arguments": item.get("arguments").and_then(Value::as_str)
                                .unwrap_or("{}"),
                        },
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls"
    } else if response
        .get("incomplete_details")
        .and_then(|d| d.get("reason"))
        .and_then(Value::as_str)
        == Some("max_output_tokens")
    {
        "length"
    } else {
        "stop"
    };

    let mut message = Map::new();
    message.insert("role".into(), Value::String("assistant".into()));
    message.insert("content".into(), Value::String(text));
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(tool_calls));
    }

    let usage = responses_usage(response);
    json!({
        "id": response.get("id").and_then(Value::as_str)
            .map(|id| format!("chatcmpl-{}", id.trim_start_matches("resp_")))
            .unwrap_or_else(|| "chatcmpl-unknown".into()),
        "object": "chat.completion",
        "created": response.get("created_at").and_then(Value::as_i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        "model": response.get("model").cloned()
            .unwrap_or_else(|| Value::String(fallback_model.to_string())),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }
    })
}

/// Chat body -> Responses body (fallback path, non-streaming).
pub fn chat_response_to_responses(response: &Value, origin_model: &str) -> Value {
    let mut output = Vec::new();
    let mut status = "completed";
    let mut incomplete: Option<Value> = None;

    if let Some(choice) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        if let Some(msg) = choice.get("message") {
            if let Some(text) = msg.get("content").and_then(Value::as_str) {
                output.push(json!({
                    "type": "message",
                    "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                    "role": "assistant",
                    "status": "completed",
                    "content": [{"type": "output_text", "text": text, "annotations": []}],
                }));
            }
            if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let function = call.get("function").cloned().unwrap_or_default();
                    output.push(json!({
                        "type": "function_call",
                        "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                        "call_id": call.get("id").and_then(Value::as_str).unwrap_or("call_0"),
                        "name": function.get("name").and_then(Value::as_str).unwrap_or(""),
                        "arguments": function.get("arguments").and_then(Value::as_str)
                            .unwrap_or("{}"),
                        "status": "completed",
                    }));
                }
            }
        }
        if choice.get("finish_reason").and_then(Value::as_str) == Some("length") {
            status = "incomplete";
            incomplete = Some(json!({"reason": "max_output_tokens"}));
        }
    }

    let usage = response.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let mut body = json!({
        "id": format!("resp_{}", uuid::Uuid::new_v4().simple()),
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "status": status,
        // Billing reports the model name the client asked for.
        "model": origin_model,
        "output": output,
        "usage": {
            "input_tokens": prompt,
            "output_tokens": completion,
            "total_tokens": prompt + completion,
        },
    });
    if let Some(details) = incomplete {
        body["incomplete_details"] = details;
    }
    body
}

// ============================================================================
// Stream rewriters
// ============================================================================

/// Fallback streaming: Chat chunks in, `response.*` events out.
pub struct ChatToResponsesStream {
    phase: StreamPhase,
    usage: Usage,
    saw_usage_chunk: bool,
    estimated_completion: i64,
    origin_model: String,
    response_id: String,
    item_id: String,
    emitted_completed: bool,
    finish_reason: Option<String>,
    text: String,
}

impl ChatToResponsesStream {
    pub fn new(origin_model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            phase: StreamPhase::Idle,
            usage: Usage::new(estimated_prompt_tokens, 0),
            saw_usage_chunk: false,
            estimated_completion: 0,
            origin_model: origin_model.to_string(),
            response_id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            item_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            emitted_completed: false,
            finish_reason: None,
            text: String::new(),
        }
    }

    fn response_skeleton(&self, status: &str) -> Value {
        json!({
            "id": self.response_id,
            "object": "response",
            "status": status,
            "model": self.origin_model,
        })
    }

    fn created_frame(&mut self) -> String {
        self.phase = StreamPhase::Started;
        sse_frame(
            Some("response.created"),
            &json!({
                "type": "response.created",
                "response": self.response_skeleton("in_progress"),
            }),
        )
    }
}

impl SseRewriter for ChatToResponsesStream {
    fn on_frame(&mut self, _event: Option<&str>, data: &Value) -> Vec<String> {
        let mut out = Vec::new();
        if self.phase == StreamPhase::Idle {
            out.push(self.created_frame());
        }

        if crate::relay::stream::apply_chat_usage(&mut self.usage, data) {
            self.saw_usage_chunk = true;
        }

        if let Some(choice) = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
            {
                if !content.is_empty() {
                    self.phase = StreamPhase::InContentBlock;
                    self.text.push_str(content);
                    self.estimated_completion += estimate_tokens(content);
                    out.push(sse_frame(
                        Some("response.output_text.delta"),
                        &json!({
                            "type": "response.output_text.delta",
                            "item_id": self.item_id,
                            "output_index": 0,
                            "content_index": 0,
                            "delta": content,
                        }),
                    ));
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        out
    }

    fn finish(&mut self) -> Vec<String> {
        if self.emitted_completed {
            return Vec::new();
        }
        self.emitted_completed = true;
        let mut out = Vec::new();
        if self.phase == StreamPhase::Idle {
            out.push(self.created_frame());
        }
        self.phase = StreamPhase::Finishing;

        let usage = self.usage();
        let mut response = self.response_skeleton("completed");
        response["output"] = json!([{
            "type": "message",
            "id": self.item_id,
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": self.text, "annotations": []}],
        }]);
        response["usage"] = json!({
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        });
        if self.finish_reason.as_deref() == Some("length") {
            response["status"] = json!("incomplete");
            response["incomplete_details"] = json!({"reason": "max_output_tokens"});
        }

        out.push(sse_frame(
            Some("response.output_text.done"),
            &json!({
                "type": "response.output_text.done",
                "item_id": self.item_id,
                "output_index": 0,
                "content_index": 0,
                "text": self.text,
            }),
        ));
        out.push(sse_frame(
            Some("response.completed"),
            &json!({"type": "response.completed", "response": response}),
        ));
        out
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if !self.saw_usage_chunk {
            usage.completion_tokens = self.estimated_completion;
        }
        usage.recompute_total();
        usage
    }
}

/// Native Responses streaming passthrough: frames go through with their
/// event names intact while usage is read off the terminal event.
pub struct ResponsesPassthrough {
    usage: Usage,
    saw_usage: bool,
    estimated_completion: i64,
}

impl ResponsesPassthrough {
    pub fn new(estimated_prompt_tokens: i64) -> Self {
        Self {
            usage: Usage::new(estimated_prompt_tokens, 0),
            saw_usage: false,
            estimated_completion: 0,
        }
    }
}

impl SseRewriter for ResponsesPassthrough {
    fn on_frame(&mut self, event: Option<&str>, data: &Value) -> Vec<String> {
        let streamed = responses_usage(data);
        if streamed.total_tokens > 0 {
            self.usage = streamed;
            self.saw_usage = true;
        } else if let Some(delta) = data.get("delta").and_then(Value::as_str) {
            self.estimated_completion += estimate_tokens(delta);
        }
        vec![sse_frame(event, data)]
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if !self.saw_usage {
            usage.completion_tokens = self.estimated_completion;
        }
        usage.recompute_total();
        usage
    }
}

/// Upgrade streaming: `response.*` events in, Chat chunks out. Exactly one
/// non-empty finish_reason chunk and one usage chunk reach the client.
pub struct ResponsesToChatStream {
    phase: StreamPhase,
    usage: Usage,
    origin_model: String,
    chunk_id: String,
    created: i64,
    tools: ToolCallAccumulator,
    /// Responses item id -> chat tool-call index.
    tool_items: std::collections::HashMap<String, usize>,
    finish_reason: Option<&'static str>,
    emitted_terminal: bool,
}

impl ResponsesToChatStream {
    pub fn new(origin_model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            phase: StreamPhase::Idle,
            usage: Usage::new(estimated_prompt_tokens, 0),
            origin_model: origin_model.to_string(),
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            tools: ToolCallAccumulator::default(),
            tool_items: std::collections::HashMap::new(),
            finish_reason: None,
            emitted_terminal: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            // The client asked in Chat terms; report its model name.
            "model": self.origin_model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }
}

impl SseRewriter for ResponsesToChatStream {
    fn on_frame(&mut self, event: Option<&str>, data: &Value) -> Vec<String> {
        let mut out = Vec::new();
        let event_type = data
            .get("type")
            .and_then(Value::as_str)
            .or(event)
            .unwrap_or("");

        match event_type {
            "response.created" => {
                self.phase = StreamPhase::Started;
                out.push(sse_frame(
                    None,
                    &self.chunk(json!({"role": "assistant", "content": ""}), None),
                ));
            }
            "response.output_item.added" => {
                if let Some(item) = data.get("item") {
                    if item.get("type").and_then(Value::as_str) == Some("function_call") {
                        self.phase = StreamPhase::ToolCallAccumulating;
                        let item_id = item
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("item")
                            .to_string();
                        let tool_index = self.tool_items.len();
                        self.tool_items.insert(item_id, tool_index);
                        self.tools.push(
                            tool_index,
                            item.get("call_id").and_then(Value::as_str),
                            item.get("name").and_then(Value::as_str),
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
                                        "name": pending.map(|p| p.name.clone())
                                            .unwrap_or_default(),
                                        "arguments": "",
                                    },
                                }]}),
                                None,
                            ),
                        ));
                    }
                }
            }
            "response.output_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    self.phase = StreamPhase::InContentBlock;
                    self.usage.completion_tokens += estimate_tokens(delta);
                    out.push(sse_frame(None, &self.chunk(json!({"content": delta}), None)));
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(fragment) = data.get("delta").and_then(Value::as_str) {
                    let item_id = data.get("item_id").and_then(Value::as_str).unwrap_or("");
                    if let Some(&tool_index) = self.tool_items.get(item_id) {
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
            "response.completed" | "response.incomplete" => {
                // Aggregated usage arrives once, on the terminal event.
                let usage = responses_usage(data);
                if usage.total_tokens > 0 {
                    self.usage = usage;
                }
                self.finish_reason = Some(if !self.tool_items.is_empty() {
                    "tool_calls"
                } else if event_type == "response.incomplete" {
                    "length"
                } else {
                    "stop"
                });
                out.extend(self.finish());
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        if self.emitted_terminal {
            return Vec::new();
        }
        self.emitted_terminal = true;
        self.phase = StreamPhase::Finishing;
        let mut out = Vec::new();
        let reason = self.finish_reason.unwrap_or("stop");
        out.push(sse_frame(None, &self.chunk(json!({}), Some(reason))));
        let usage = self.usage();
        out.push(sse_frame(
            None,
            &json!({
                "id": self.chunk_id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.origin_model,
                "choices": [],
                "usage": {
                    "prompt_tokens": usage.prompt_tokens,
                    "completion_tokens": usage.completion_tokens,
                    "total_tokens": usage.total_tokens,
                },
            }),
        ));
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
    fn string_input_becomes_user_message() {
        let req = json!({"model": "gpt-4o", "input": "hi", "max_output_tokens": 64});
        let chat = responses_to_chat_request(&req, "gpt-4o").unwrap();
        assert_eq!(chat["messages"][0]["role"], "user");
        assert_eq!(chat["messages"][0]["content"], "hi");
        assert_eq!(chat["max_tokens"], 64);
    }

    #[test]
    fn instructions_become_system_message() {
        let req = json!({"model": "gpt-4o", "instructions": "be terse", "input": "hi"});
        let chat = responses_to_chat_request(&req, "gpt-4o").unwrap();
        assert_eq!(chat["messages"][0]["role"], "system");
        assert_eq!(chat["messages"][0]["content"], "be terse");
    }

    #[test]
    fn reasoning_models_drop_sampling_params() {
        let req = json!({"model": "o3-mini", "input": "hi", "temperature": 0.5, "top_p": 0.9});
        let chat = responses_to_chat_request(&req, "o3-mini").unwrap();
        assert!(chat.get("temperature").is_none());
        assert!(chat.get("top_p").is_none());

        let plain = responses_to_chat_request(
            &json!({"model": "gpt-4o", "input": "hi", "temperature": 0.5}),
            "gpt-4o",
        )
        .unwrap();
        assert_eq!(plain["temperature"], 0.5);
    }

    #[test]
    fn function_call_items_round_trip() {
        let req = json!({
            "model": "gpt-4o",
            "input": [
                {"type": "message", "role": "user", "content": "weather?"},
                {"type": "function_call", "call_id": "call_7", "name": "get_weather",
                 "arguments": "{\"city\":\"SF\"}"},
                {"type": "function_call_output", "call_id": "call_7", "output": "sunny"},
            ],
        });
        let chat = responses_to_chat_request(&req, "gpt-4o").unwrap();
        let messages = chat["messages"].as_array().unwrap();
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_7");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_7");
    }

    #[test]
    fn upgrade_maps_messages_to_input_items() {
        let chat = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"},
            ],
            "max_tokens": 20,
        });
        let responses = chat_to_responses_request(&chat, "gpt-4o").unwrap();
        assert_eq!(responses["instructions"], "be brief");
        assert_eq!(responses["max_output_tokens"], 20);
        let input = responses["input"].as_array().unwrap();
        assert_eq!(input.len(), 1);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
    }

    #[test]
    fn responses_body_converts_to_chat_with_same_semantics() {
        // I3: role, content, finish_reason and usage totals survive.
        let responses = json!({
            "id": "resp_1",
            "model": "gpt-4o",
            "status": "completed",
            "output": [{"type": "message", "role": "assistant", "content": [
                {"type": "output_text", "text": "hello there"}]}],
            "usage": {"input_tokens": 3, "output_tokens": 2},
        });
        let chat = responses_response_to_chat(&responses, "gpt-4o");
        assert_eq!(chat["choices"][0]["message"]["role"], "assistant");
        assert_eq!(chat["choices"][0]["message"]["content"], "hello there");
        assert_eq!(chat["choices"][0]["finish_reason"], "stop");
        assert_eq!(chat["usage"]["total_tokens"], 5);
    }

    #[test]
    fn chat_body_converts_to_responses_with_origin_model() {
        let chat = json!({
            "id": "x",
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "hi"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2},
        });
        let responses = chat_response_to_responses(&chat, "gpt-4o");
        assert_eq!(responses["model"], "gpt-4o");
        assert_eq!(responses["status"], "completed");
        assert_eq!(responses["usage"]["input_tokens"], 3);
        assert_eq!(responses["output"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn fallback_stream_emits_created_delta_completed() {
        // Scenario 2: created, deltas, exactly one completed with usage.
        let mut rw = ChatToResponsesStream::new("gpt-4o", 3);
        let first = rw.on_frame(
            None,
            &json!({"choices": [{"delta": {"content": "he"}}]}),
        );
        assert!(first[0].starts_with("event: response.created"));
        assert!(first[1].starts_with("event: response.output_text.delta"));

        rw.on_frame(None, &json!({"choices": [{"delta": {"content": "y"}}]}));
        rw.on_frame(
            None,
            &json!({"choices": [{"delta": {}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 2}}),
        );
        let closing = rw.finish();
        let text = closing.join("");
        assert!(text.contains("response.completed"));
        assert!(text.contains("\"input_tokens\":3"));
        assert!(text.contains("\"output_tokens\":2"));
        assert!(text.contains("\"text\":\"hey\""));
        // Only one completed event ever.
        assert!(rw.finish().is_empty());
        assert!(rw.emits_done());
    }

    #[test]
    fn upgrade_stream_single_finish_and_usage() {
        let mut rw = ResponsesToChatStream::new("gpt-4o", 1);
        rw.on_frame(None, &json!({"type": "response.created"}));
        rw.on_frame(
            None,
            &json!({"type": "response.output_text.delta", "delta": "hello"}),
        );
        let frames = rw.on_frame(
            None,
            &json!({"type": "response.completed",
                    "response": {"usage": {"input_tokens": 4, "output_tokens": 6}}}),
        );
        let text = frames.join("");
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.contains("\"prompt_tokens\":4"));
        // Terminal frames are not duplicated by the engine-level finish.
        assert!(rw.finish().is_empty());
        let usage = rw.usage();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 6);
    }

    #[test]
    fn strip_responses_only_keys_cleans_payload() {
        let mut payload = json!({
            "model": "gpt-4o", "input": "x", "instructions": "y",
            "reasoning": {"effort": "high"}, "store": true, "messages": [],
        });
        strip_responses_only_keys(&mut payload);
        assert!(payload.get("input").is_none());
        assert!(payload.get("reasoning").is_none());
        assert!(payload.get("store").is_none());
        assert!(payload.get("messages").is_some());
    }

    #[test]
    fn model_classifiers() {
        assert!(is_reasoning_model("o3-mini"));
        assert!(is_reasoning_model("gpt-5"));
        assert!(!is_reasoning_model("gpt-4o"));
        assert!(chat_only_model("gpt-3.5-turbo-instruct"));
        assert!(!chat_only_model("gpt-4o"));
    }
}
